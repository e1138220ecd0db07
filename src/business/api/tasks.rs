//! Background pruning of the session table

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::client::ApiClient;
use super::models::ProxyStatus;
use crate::business::sessions::SessionTable;
use crate::core::{ProxyId, SessionFactory};
use crate::error::Result;
use crate::logger::log;

/// Default reconciliation period
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(30);

/// Source of the authoritative proxy list
#[async_trait]
pub trait ProxyDirectory: Send + Sync {
    async fn list_proxies(&self) -> Result<Vec<ProxyStatus>>;
}

#[async_trait]
impl ProxyDirectory for ApiClient {
    async fn list_proxies(&self) -> Result<Vec<ProxyStatus>> {
        ApiClient::list_proxies(self).await
    }
}

/// Pruner configuration
#[derive(Debug, Clone)]
pub struct PrunerConfig {
    /// Time between reconciliation passes
    pub interval: Duration,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PRUNE_INTERVAL,
        }
    }
}

impl PrunerConfig {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

/// Periodically evicts sessions whose proxies the service no longer reports alive
pub struct Pruner<F: SessionFactory> {
    config: PrunerConfig,
    directory: Arc<dyn ProxyDirectory>,
    sessions: SessionTable<F>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Handle for a running pruner
pub struct PrunerHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PrunerHandle {
    /// Signal the pruner and wait up to `timeout` for it to exit.
    /// Returns `false` if it was still running when the timeout elapsed.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        log::debug!("Stopping pruner...");
        let _ = self.shutdown_tx.send(true);

        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(())) => {
                log::debug!("Pruner stopped");
                true
            }
            Ok(Err(e)) => {
                log::warn!(error = %e, "Pruner panicked");
                true
            }
            Err(_) => {
                log::warn!("Pruner shutdown timeout");
                false
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<F> Pruner<F>
where
    F: SessionFactory + 'static,
{
    pub fn new(
        config: PrunerConfig,
        directory: Arc<dyn ProxyDirectory>,
        sessions: SessionTable<F>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            directory,
            sessions,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Spawn the pruning loop. The first pass runs one full interval after start.
    pub fn start(self) -> PrunerHandle {
        let Pruner {
            config,
            directory,
            sessions,
            shutdown_tx,
            mut shutdown_rx,
        } = self;
        let period = config.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = prune_once(directory.as_ref(), &sessions).await {
                            log::warn!(error = %e, "Prune pass skipped");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        log::debug!("Pruner shutting down");
                        break;
                    }
                }
            }
        });

        log::info!(interval = ?period, "Pruner started");

        PrunerHandle {
            shutdown_tx,
            handle,
        }
    }
}

/// One reconciliation pass: evict every tracked session not reported alive
pub async fn prune_once<F: SessionFactory>(
    directory: &dyn ProxyDirectory,
    sessions: &SessionTable<F>,
) -> Result<usize> {
    let proxies = directory.list_proxies().await?;
    let alive: HashSet<ProxyId> = proxies
        .iter()
        .filter(|p| p.alive)
        .map(|p| p.id)
        .collect();

    let evicted = sessions.prune(&alive);
    if evicted > 0 {
        log::info!(
            evicted = evicted,
            remaining = sessions.len(),
            alive = alive.len(),
            "Sessions pruned"
        );
    }
    Ok(evicted)
}
