//! Control-plane integration
//!
//! This module handles:
//! - Status, proxy listing, key introspection and creation
//! - One-shot packet injection
//! - Periodic session pruning against the proxy list

mod client;
mod models;
mod tasks;

pub use client::ApiClient;
pub use models::{InjectRequest, KeyInfo, NewKey, Permissions, ProxyStatus, SpawnerStatus};
pub use tasks::{
    prune_once, Pruner, PrunerConfig, PrunerHandle, ProxyDirectory, DEFAULT_PRUNE_INTERVAL,
};
