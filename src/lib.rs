//! Client runtime for the EzProxy traffic interception service
//!
//! Architecture:
//! - `core/`: Packet model, wire codec, and hook traits
//! - `transport/`: WebSocket control channel and its receive loop
//! - `business/`: Control-plane client, session table, pruner, interceptor
//! - `config`: Client configuration and the viewer's command line

pub mod business;
pub mod config;
pub mod core;
pub mod error;
pub mod logger;
pub mod transport;

pub use crate::business::{ApiClient, Interceptor, SessionHub, SessionTable};
pub use crate::config::ClientConfig;
pub use crate::core::{
    CapFlags, ControlMessage, Packet, PacketDecider, ProxyId, ServerMessage, Session,
    SessionFactory, TARGET_ALL,
};
pub use crate::error::{EzProxyError, Result};
pub use crate::transport::{Capabilities, ChannelHandle, ChannelState, ControlChannel};
