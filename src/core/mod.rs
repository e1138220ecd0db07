//! Core protocol module
//!
//! - Packet model and capture flags
//! - Wire codec for control and server messages
//! - Hook traits for application policy

pub mod codec;
pub mod hooks;
mod packet;

pub use codec::{ControlKind, ControlMessage, InjectDirection, ServerMessage};
pub use hooks::{PacketDecider, Session, SessionFactory};
pub use packet::{CapFlags, Packet, ProxyId, TARGET_ALL};
