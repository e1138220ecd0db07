//! Configuration for the EzProxy client
//!
//! `ClientConfig` is the immutable runtime configuration handed to the
//! library. `CliArgs` is the viewer's command line, with environment
//! variable fallbacks.

use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser};
use std::time::Duration;

use crate::business::api::DEFAULT_PRUNE_INTERVAL;
use crate::error::EzProxyError;
use crate::logger::LogLevel;
use crate::transport::{Capabilities, DefaultAction};

/// Default control-plane request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Default bound on waiting for background tasks at shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Parse duration string (e.g., "30s", "2m") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '30s', '2m' or plain seconds",
            s
        )
    })
}

/// Runtime client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Service address, `http(s)://` or `ws(s)://`
    pub base_url: String,
    pub api_key: String,
    pub request_timeout: Duration,
    pub prune_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.base_url.is_empty() {
            return Err(EzProxyError::Argument("base URL is required".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(EzProxyError::Argument(
                "request timeout must be greater than 0".to_string(),
            ));
        }
        if self.prune_interval.is_zero() {
            return Err(EzProxyError::Argument(
                "prune interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// CLI arguments for the packet viewer
///
/// Supports environment variables with EZPROXY_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Live packet viewer for an EzProxy spawner")]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// Service address (e.g., "http://10.0.0.46:8080")
    #[arg(long, env = "EZPROXY_URL", default_value = "http://127.0.0.1:8080")]
    pub url: String,

    /// API key (hex)
    #[arg(long, env = "EZPROXY_API_KEY")]
    pub key: String,

    /// Request the filter capability
    #[arg(long, env = "EZPROXY_FILTER", default_value_t = true, action = ArgAction::Set)]
    pub filter: bool,

    /// Request the inject capability
    #[arg(long, env = "EZPROXY_INJECT", default_value_t = false, action = ArgAction::Set)]
    pub inject: bool,

    /// Request the close capability
    #[arg(long, env = "EZPROXY_CLOSE", default_value_t = false, action = ArgAction::Set)]
    pub close: bool,

    /// Service-side verdict on timeout: drop or allow (filter only)
    #[arg(long = "default_action", env = "EZPROXY_DEFAULT_ACTION")]
    pub default_action: Option<String>,

    /// Only deliver packets of this network: tcp or udp
    #[arg(long, env = "EZPROXY_NETWORK")]
    pub network: Option<String>,

    /// Drop every Nth filterable packet (0 allows everything)
    #[arg(long = "drop_every", env = "EZPROXY_DROP_EVERY", default_value_t = 0)]
    pub drop_every: u64,

    /// Control-plane request timeout (e.g., "15s", default: 15s)
    #[arg(long = "api_timeout", env = "EZPROXY_API_TIMEOUT", default_value = "15s", value_parser = parse_duration)]
    pub api_timeout: Duration,

    /// Session pruning interval (e.g., "30s", default: 30s)
    #[arg(long = "prune_interval", env = "EZPROXY_PRUNE_INTERVAL", default_value = "30s", value_parser = parse_duration)]
    pub prune_interval: Duration,

    /// Bound on waiting for background tasks at exit (default: 5s)
    #[arg(long = "shutdown_timeout", env = "EZPROXY_SHUTDOWN_TIMEOUT", default_value = "5s", value_parser = parse_duration)]
    pub shutdown_timeout: Duration,

    /// Log mode: trace, debug, info, warn, error (default: info)
    #[arg(long = "log_mode", env = "EZPROXY_LOG_MODE", default_value = "info")]
    pub log_mode: String,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(anyhow!("Service URL is required (--url)"));
        }
        if self.key.is_empty() {
            return Err(anyhow!("API key is required (--key)"));
        }
        if LogLevel::parse(&self.log_mode).is_none() {
            return Err(anyhow!("Invalid log mode: {}", self.log_mode));
        }
        if let Some(ref action) = self.default_action {
            if DefaultAction::parse(action).is_none() {
                return Err(anyhow!(
                    "Invalid default action '{}': expected drop or allow",
                    action
                ));
            }
        }
        self.to_capabilities()?.validate()?;
        self.to_client_config().validate()?;
        Ok(())
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::parse(&self.log_mode).unwrap_or_default()
    }

    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig::new(&self.url, &self.key)
            .with_request_timeout(self.api_timeout)
            .with_prune_interval(self.prune_interval)
            .with_shutdown_timeout(self.shutdown_timeout)
    }

    pub fn to_capabilities(&self) -> Result<Capabilities> {
        let mut caps = Capabilities::listen();
        if self.filter {
            caps = caps.with_filter();
        }
        if self.inject {
            caps = caps.with_inject();
        }
        if self.close {
            caps = caps.with_close();
        }
        if let Some(ref action) = self.default_action {
            let action = DefaultAction::parse(action)
                .ok_or_else(|| anyhow!("Invalid default action: {}", action))?;
            caps = caps.with_default_action(action);
        }
        if let Some(ref network) = self.network {
            caps = caps.with_network(network.to_lowercase());
        }
        Ok(caps)
    }
}
