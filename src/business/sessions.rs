//! Per-proxy session table
//!
//! Shared by the channel receive task (lazy insert, dispatch, eviction on
//! failure) and the pruner (bulk eviction). Every access to a key goes
//! through the map's shard lock, so a session is never dispatched to once
//! its removal is visible, and an insert cannot interleave with a prune of
//! the same key.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::core::{Packet, ProxyId, Session, SessionFactory};
use crate::logger::log;
use crate::transport::ChannelHandle;

/// Proxy id -> session, built lazily by a [`SessionFactory`]
pub struct SessionTable<F: SessionFactory> {
    factory: Arc<F>,
    sessions: Arc<DashMap<ProxyId, F::Session>>,
}

impl<F: SessionFactory> Clone for SessionTable<F> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            sessions: Arc::clone(&self.sessions),
        }
    }
}

impl<F: SessionFactory> SessionTable<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory: Arc::new(factory),
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Route a packet to its proxy's session, creating the session first if
    /// this is the first packet seen for that proxy.
    ///
    /// Returns the session's verdict, or `None` when no session could handle
    /// the packet (creation failed, the session was dead, or it failed while
    /// handling). Failed and dead sessions are closed and evicted.
    pub fn dispatch(&self, channel: &ChannelHandle, packet: &Packet) -> Option<bool> {
        let proxy_id = packet.proxy_id;

        let mut entry = match self.sessions.entry(proxy_id) {
            Entry::Occupied(entry) => entry,
            Entry::Vacant(vacant) => match guarded(|| self.factory.create(channel, packet)) {
                Ok(session) => {
                    log::session(proxy_id, "created", None);
                    vacant.insert_entry(session)
                }
                Err(e) => {
                    log::session(proxy_id, "create failed", Some(&format!("{:#}", e)));
                    return None;
                }
            },
        };

        if !entry.get().is_alive() {
            let mut session = entry.remove();
            session.close();
            log::session(proxy_id, "dead, evicted", None);
            return None;
        }

        match guarded(|| entry.get_mut().handle_packet(channel, packet)) {
            Ok(verdict) => Some(verdict),
            Err(e) => {
                let mut session = entry.remove();
                session.close();
                log::session(proxy_id, "failed, evicted", Some(&format!("{:#}", e)));
                None
            }
        }
    }

    /// Evict every tracked session whose proxy is not in `alive`.
    /// Returns the number evicted.
    pub fn prune(&self, alive: &HashSet<ProxyId>) -> usize {
        let stale: Vec<ProxyId> = self
            .ids()
            .into_iter()
            .filter(|id| !alive.contains(id))
            .collect();

        let mut evicted = 0;
        for proxy_id in stale {
            // Re-checked under the shard lock
            if let Some((_, mut session)) = self
                .sessions
                .remove_if(&proxy_id, |id, _| !alive.contains(id))
            {
                session.close();
                log::session(proxy_id, "pruned", None);
                evicted += 1;
            }
        }
        evicted
    }

    /// Remove and close one session
    pub fn remove(&self, proxy_id: ProxyId) -> bool {
        match self.sessions.remove(&proxy_id) {
            Some((_, mut session)) => {
                session.close();
                log::session(proxy_id, "removed", None);
                true
            }
            None => false,
        }
    }

    /// Remove and close every session
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for proxy_id in self.ids() {
            if self.remove(proxy_id) {
                closed += 1;
            }
        }
        closed
    }

    pub fn contains(&self, proxy_id: ProxyId) -> bool {
        self.sessions.contains_key(&proxy_id)
    }

    /// Snapshot of the tracked proxy ids
    pub fn ids(&self) -> Vec<ProxyId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Run session code, turning a panic into an error so only that session is lost
fn guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|_| Err(anyhow::anyhow!("session code panicked")))
}
