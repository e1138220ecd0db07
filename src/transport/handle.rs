//! Sending half of a control channel

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::capabilities::Capabilities;
use crate::core::{ControlMessage, InjectDirection, ProxyId};
use crate::error::{EzProxyError, Result};

/// Channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ChannelState::Connecting,
            1 => ChannelState::Open,
            2 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }
}

struct HandleInner {
    caps: Capabilities,
    outbound: mpsc::UnboundedSender<ControlMessage>,
    state: AtomicU8,
    cancel: CancellationToken,
}

/// Cloneable handle used to send control messages
///
/// Sends never block: messages are queued in order and written by the
/// channel's receive task, so the filter hook may send from inside `decide`.
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("caps", &self.inner.caps)
            .field("state", &self.state())
            .finish()
    }
}

impl ChannelHandle {
    pub(crate) fn new(caps: Capabilities) -> (Self, mpsc::UnboundedReceiver<ControlMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            inner: Arc::new(HandleInner {
                caps,
                outbound: tx,
                state: AtomicU8::new(ChannelState::Connecting as u8),
                cancel: CancellationToken::new(),
            }),
        };
        (handle, rx)
    }

    /// An open handle that is not attached to any service.
    ///
    /// Every queued message lands on the returned receiver, which makes it
    /// suitable for exercising deciders and sessions offline.
    pub fn detached(caps: Capabilities) -> (Self, mpsc::UnboundedReceiver<ControlMessage>) {
        let (handle, rx) = Self::new(caps);
        handle.set_state(ChannelState::Open);
        (handle, rx)
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.inner.caps
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.state(), ChannelState::Connecting | ChannelState::Open)
            && !self.inner.cancel.is_cancelled()
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Send a verdict for a captured packet
    pub fn filter(&self, pkt_num: i64, allow: bool) -> Result<()> {
        if !self.inner.caps.filter {
            return Err(EzProxyError::MissingCapability("filter"));
        }
        self.send(ControlMessage::filter(pkt_num, allow))
    }

    /// Inject `data` into proxy `target` (`TARGET_ALL` for every proxy)
    pub fn inject(
        &self,
        target: ProxyId,
        data: impl Into<Vec<u8>>,
        direction: InjectDirection,
    ) -> Result<()> {
        if !self.inner.caps.inject {
            return Err(EzProxyError::MissingCapability("inject"));
        }
        self.send(ControlMessage::inject(target, data.into(), direction))
    }

    pub fn send_to_server(&self, target: ProxyId, data: impl Into<Vec<u8>>) -> Result<()> {
        self.inject(target, data, InjectDirection::ToServer)
    }

    pub fn send_to_client(&self, target: ProxyId, data: impl Into<Vec<u8>>) -> Result<()> {
        self.inject(target, data, InjectDirection::ToClient)
    }

    /// Ask the service to close proxy `target` (`TARGET_ALL` for every proxy)
    pub fn close_proxy(&self, target: ProxyId) -> Result<()> {
        if !self.inner.caps.close {
            return Err(EzProxyError::MissingCapability("close"));
        }
        self.send(ControlMessage::close(target))
    }

    /// Stop the channel. Idempotent.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        let _ = self.inner.state.compare_exchange(
            ChannelState::Open as u8,
            ChannelState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn send(&self, msg: ControlMessage) -> Result<()> {
        if !self.is_alive() {
            return Err(EzProxyError::ChannelClosed);
        }
        self.push(msg)
    }

    /// Queue without the liveness check; used by the receive task for verdicts
    pub(crate) fn push(&self, msg: ControlMessage) -> Result<()> {
        self.inner
            .outbound
            .send(msg)
            .map_err(|_| EzProxyError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ControlKind, TARGET_ALL};

    #[test]
    fn test_capability_guards() {
        let (handle, mut rx) = ChannelHandle::detached(Capabilities::listen());
        assert!(matches!(
            handle.filter(1, true),
            Err(EzProxyError::MissingCapability("filter"))
        ));
        assert!(matches!(
            handle.inject(1, b"x".to_vec(), InjectDirection::Both),
            Err(EzProxyError::MissingCapability("inject"))
        ));
        assert!(matches!(
            handle.close_proxy(1),
            Err(EzProxyError::MissingCapability("close"))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_sends_are_queued_in_order() {
        let caps = Capabilities::listen().with_filter().with_inject().with_close();
        let (handle, mut rx) = ChannelHandle::detached(caps);

        handle.send_to_server(4, b"abc".to_vec()).unwrap();
        handle.send_to_client(TARGET_ALL, Vec::new()).unwrap();
        handle.close_proxy(4).unwrap();
        handle.filter(10, false).unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.kind, ControlKind::Inject);
        assert_eq!(first.extra, InjectDirection::ToServer.bits());
        assert_eq!(first.data, b"abc");

        let second = rx.try_recv().unwrap();
        assert_eq!(second.target, TARGET_ALL);
        assert_eq!(second.extra, InjectDirection::ToClient.bits());

        assert_eq!(rx.try_recv().unwrap().kind, ControlKind::Close);

        let verdict = rx.try_recv().unwrap();
        assert_eq!(verdict.kind, ControlKind::Filter);
        assert_eq!(verdict.target, 10);
        assert!(!verdict.allows());
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_sends() {
        let (handle, mut rx) = ChannelHandle::detached(Capabilities::listen().with_inject());
        assert!(handle.is_alive());
        handle.close();
        handle.close();
        assert_eq!(handle.state(), ChannelState::Closing);
        assert!(!handle.is_alive());
        assert!(matches!(
            handle.send_to_server(1, b"x".to_vec()),
            Err(EzProxyError::ChannelClosed)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_clone_shares_state() {
        let (handle, _rx) = ChannelHandle::detached(Capabilities::listen());
        let other = handle.clone();
        other.close();
        assert!(!handle.is_alive());
    }
}
