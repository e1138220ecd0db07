//! Capability negotiation and socket URI construction

use url::Url;

use crate::error::{EzProxyError, Result};

/// Socket endpoint, relative to the service base URL
const SOCKET_PATH: &str = "/api/2/socket";

/// What the service does with a packet whose verdict never arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Drop,
    Allow,
}

impl DefaultAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefaultAction::Drop => "drop",
            DefaultAction::Allow => "allow",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "drop" => Some(DefaultAction::Drop),
            "allow" => Some(DefaultAction::Allow),
            _ => None,
        }
    }
}

/// Capabilities requested when opening a channel
///
/// The service is authoritative: it refuses the socket when the key lacks a
/// requested capability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub filter: bool,
    pub inject: bool,
    pub close: bool,
    /// Only sent alongside `filter`
    pub default_action: Option<DefaultAction>,
    /// Restrict delivered packets to `tcp` or `udp`
    pub network: Option<String>,
}

impl Capabilities {
    /// Listen-only channel
    pub fn listen() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self) -> Self {
        self.filter = true;
        self
    }

    pub fn with_inject(mut self) -> Self {
        self.inject = true;
        self
    }

    pub fn with_close(mut self) -> Self {
        self.close = true;
        self
    }

    pub fn with_default_action(mut self, action: DefaultAction) -> Self {
        self.default_action = Some(action);
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Reject option values the service would refuse
    pub fn validate(&self) -> Result<()> {
        if let Some(network) = &self.network {
            if network != "tcp" && network != "udp" {
                return Err(EzProxyError::Argument(format!(
                    "network must be 'tcp' or 'udp', got '{}'",
                    network
                )));
            }
        }
        Ok(())
    }

    fn query(&self, key: &str) -> String {
        let key: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();
        let mut query = format!("key={}&", key);
        if self.filter {
            query.push_str("filter&");
            if let Some(action) = self.default_action {
                query.push_str("default=");
                query.push_str(action.as_str());
                query.push('&');
            }
        }
        if self.inject {
            query.push_str("inject&");
        }
        if self.close {
            query.push_str("close&");
        }
        if let Some(network) = &self.network {
            query.push_str("network=");
            query.push_str(network);
            query.push('&');
        }
        query.pop();
        query
    }
}

/// Build `<scheme>://<host>/api/2/socket?key=<key>[&filter][&inject][&close]`
///
/// `http`/`https` base URLs map onto `ws`/`wss`.
pub fn socket_uri(base: &str, key: &str, caps: &Capabilities) -> Result<Url> {
    caps.validate()?;

    let mut url = with_scheme_family(base, "ws", "wss")?;

    let path = format!("{}{}", url.path().trim_end_matches('/'), SOCKET_PATH);
    url.set_path(&path);
    url.set_query(Some(&caps.query(key)));
    Ok(url)
}

/// Parse `base` and move it onto `plain`/`secure`, keeping its security.
/// Accepts `http`, `https`, `ws` and `wss`.
pub(crate) fn with_scheme_family(base: &str, plain: &str, secure: &str) -> Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| EzProxyError::Argument(format!("invalid base URL '{}': {}", base, e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => plain,
        "https" | "wss" => secure,
        other => {
            return Err(EzProxyError::Argument(format!(
                "unsupported URL scheme '{}'",
                other
            )))
        }
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(EzProxyError::Argument(format!(
            "cannot convert '{}' to a {} URL",
            base, scheme
        )));
    }
    Ok(url)
}
