//! Session-routing filter hook and the top-level interceptor

use std::sync::Arc;
use std::time::Duration;

use super::api::{ApiClient, Pruner, PrunerConfig, PrunerHandle, ProxyDirectory};
use super::sessions::SessionTable;
use crate::config::ClientConfig;
use crate::core::{Packet, PacketDecider, SessionFactory};
use crate::error::Result;
use crate::logger::log;
use crate::transport::{Capabilities, ChannelHandle, ControlChannel};

/// Filter hook that routes every packet to its proxy's session
pub struct SessionHub<F: SessionFactory> {
    sessions: SessionTable<F>,
    network: Option<String>,
    fallback: bool,
}

impl<F: SessionFactory> SessionHub<F> {
    /// Hub over a fresh table. Packets no session handles are dropped.
    pub fn new(factory: F) -> Self {
        Self {
            sessions: SessionTable::new(factory),
            network: None,
            fallback: false,
        }
    }

    /// Only route packets of this network kind; others get the fallback verdict
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Verdict for packets that no session produced a verdict for
    pub fn with_fallback(mut self, allow: bool) -> Self {
        self.fallback = allow;
        self
    }

    pub fn sessions(&self) -> &SessionTable<F> {
        &self.sessions
    }

    pub fn fallback(&self) -> bool {
        self.fallback
    }
}

impl<F: SessionFactory> PacketDecider for SessionHub<F> {
    fn decide(&self, channel: &ChannelHandle, packet: &Packet) -> bool {
        if let Some(network) = &self.network {
            if packet.network != *network {
                return self.fallback;
            }
        }
        self.sessions
            .dispatch(channel, packet)
            .unwrap_or(self.fallback)
    }
}

/// Top-level client: control-plane access, a session hub, and its pruner
pub struct Interceptor<F: SessionFactory + 'static> {
    config: ClientConfig,
    api: Arc<ApiClient>,
    hub: Arc<SessionHub<F>>,
    pruner: Option<PrunerHandle>,
}

impl<F: SessionFactory + 'static> Interceptor<F> {
    /// Build the API client and start pruning `hub`'s sessions.
    /// Must be called from within a tokio runtime.
    pub fn new(config: ClientConfig, hub: SessionHub<F>) -> Result<Self> {
        config.validate()?;
        let api = Arc::new(ApiClient::new(&config)?);
        let hub = Arc::new(hub);

        let pruner = Pruner::new(
            PrunerConfig::new(config.prune_interval),
            Arc::clone(&api) as Arc<dyn ProxyDirectory>,
            hub.sessions().clone(),
        )
        .start();

        Ok(Self {
            config,
            api,
            hub,
            pruner: Some(pruner),
        })
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn hub(&self) -> &Arc<SessionHub<F>> {
        &self.hub
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open a control channel whose packets are routed through the hub
    pub async fn open_channel(&self, caps: Capabilities) -> Result<ControlChannel> {
        let decider: Arc<dyn PacketDecider> = self.hub.clone();
        ControlChannel::open(&self.config.base_url, &self.config.api_key, caps, decider).await
    }

    /// Stop the pruner, waiting at most `timeout`, then close every session.
    /// Returns `false` if the pruner did not stop in time.
    pub async fn shutdown(&mut self, timeout: Duration) -> bool {
        let stopped = match self.pruner.take() {
            Some(pruner) => pruner.shutdown(timeout).await,
            None => true,
        };
        let closed = self.hub.sessions().close_all();
        log::info!(sessions_closed = closed, pruner_stopped = stopped, "Interceptor shut down");
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::business::sessions::testing::{packet, Recorder, TestFactory};

    fn new_hub() -> (SessionHub<TestFactory>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let hub = SessionHub::new(TestFactory {
            recorder: Arc::clone(&recorder),
        });
        (hub, recorder)
    }

    fn channel() -> ChannelHandle {
        ChannelHandle::detached(Capabilities::listen().with_filter()).0
    }

    #[test]
    fn test_hub_uses_session_verdict() {
        let (hub, _) = new_hub();
        let ch = channel();
        assert!(hub.decide(&ch, &packet(2, 1, b"x")));
        assert!(!hub.decide(&ch, &packet(3, 1, b"x")));
        assert_eq!(hub.sessions().len(), 1);
    }

    #[test]
    fn test_hub_fallback_on_failure() {
        let (hub, recorder) = new_hub();
        let hub = hub.with_fallback(true);
        let ch = channel();

        assert!(hub.decide(&ch, &packet(1, 5, b"boom")));
        assert!(hub.sessions().is_empty());
        assert_eq!(*recorder.closed.lock().unwrap(), vec![5]);

        let (strict, _) = new_hub();
        assert!(!strict.decide(&ch, &packet(1, 5, b"boom")));
    }

    #[test]
    fn test_hub_network_restriction() {
        let (hub, recorder) = new_hub();
        let hub = hub.with_network("tcp");
        let ch = channel();

        let mut udp = packet(2, 8, b"x");
        udp.network = "udp".to_string();
        assert!(!hub.decide(&ch, &udp));
        assert!(hub.sessions().is_empty());
        assert_eq!(recorder.created.load(std::sync::atomic::Ordering::SeqCst), 0);

        assert!(hub.decide(&ch, &packet(2, 8, b"x")));
        assert!(hub.sessions().contains(8));
    }

    #[tokio::test]
    async fn test_interceptor_shutdown_closes_sessions() {
        let (hub, recorder) = new_hub();
        let config = ClientConfig::new("http://127.0.0.1:9", "BABE");
        let mut interceptor = Interceptor::new(config, hub).unwrap();

        let ch = channel();
        interceptor.hub().decide(&ch, &packet(0, 1, b"x"));
        interceptor.hub().decide(&ch, &packet(0, 2, b"x"));

        assert!(interceptor.shutdown(Duration::from_secs(1)).await);
        assert!(interceptor.hub().sessions().is_empty());
        assert_eq!(recorder.closed.lock().unwrap().len(), 2);
        // Second shutdown is a no-op
        assert!(interceptor.shutdown(Duration::from_secs(1)).await);
    }
}
