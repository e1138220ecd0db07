//! Business logic implementations
//!
//! This module contains the application-facing layer:
//! - Control-plane API client and the pruner
//! - Per-proxy session table
//! - Session hub (filter hook) and the top-level interceptor

pub mod api;
mod hub;
mod sessions;

pub use api::{ApiClient, Pruner, PrunerConfig, PrunerHandle, ProxyDirectory};
pub use hub::{Interceptor, SessionHub};
pub use sessions::SessionTable;
