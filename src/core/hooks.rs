//! Hook traits for extensibility
//!
//! Defines the extension points where application policy plugs into the
//! control channel and the session table.

use super::packet::Packet;
use crate::transport::ChannelHandle;

/// Filter decision hook, invoked once per delivered packet
///
/// Synchronous: it runs on the channel's receive task, so a slow decision
/// stalls every later packet on that channel. The returned verdict is sent
/// back only when the channel holds the filter capability and the packet was
/// not injected. The hook may queue `inject`/`close_proxy` on `channel` before
/// returning. A panic is caught and answered with a drop verdict.
pub trait PacketDecider: Send + Sync {
    fn decide(&self, channel: &ChannelHandle, packet: &Packet) -> bool;
}

impl<F> PacketDecider for F
where
    F: Fn(&ChannelHandle, &Packet) -> bool + Send + Sync,
{
    fn decide(&self, channel: &ChannelHandle, packet: &Packet) -> bool {
        self(channel, packet)
    }
}

/// Per-proxy application state
pub trait Session: Send + Sync {
    /// Handle one packet for this proxy, returning the filter verdict.
    /// An error or a panic closes and evicts the session.
    fn handle_packet(&mut self, channel: &ChannelHandle, packet: &Packet) -> anyhow::Result<bool>;

    /// `false` once the underlying resources are gone
    fn is_alive(&self) -> bool;

    /// Release resources. Called exactly once, when the session leaves the table.
    fn close(&mut self);
}

/// Builds a session on the first packet seen for a proxy
pub trait SessionFactory: Send + Sync {
    type Session: Session;

    fn create(&self, channel: &ChannelHandle, packet: &Packet) -> anyhow::Result<Self::Session>;
}
