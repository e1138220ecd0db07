//! Control channel transport
//!
//! - Capability negotiation and socket URI
//! - Channel handle (ordered, non-blocking sends)
//! - WebSocket receive loop dispatching packets to the filter hook

mod capabilities;
mod channel;
mod handle;

pub use capabilities::{socket_uri, Capabilities, DefaultAction};
pub(crate) use capabilities::with_scheme_family;
pub use channel::ControlChannel;
pub use handle::{ChannelHandle, ChannelState};
