use thiserror::Error;

/// Unified error type for the control channel and the control plane
#[derive(Error, Debug)]
pub enum EzProxyError {
    /// The channel could not be established (transport or handshake failure)
    #[error("Connect error: {0}")]
    Connect(String),

    /// The established channel failed while reading or writing
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected wire data
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Non-success status reported by the service
    #[error("Remote error {status}: {payload}")]
    Remote { status: i64, payload: String },

    /// Missing or invalid API key (status 401)
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The API key lacks the required permission (status 403)
    #[error("Permission error: {0}")]
    Permission(String),

    /// Caller misuse, rejected before any network activity
    #[error("Argument error: {0}")]
    Argument(String),

    /// The channel was not opened with the capability this message needs
    #[error("Channel lacks the '{0}' capability")]
    MissingCapability(&'static str),

    /// The channel is closed and can no longer send
    #[error("Channel is closed")]
    ChannelClosed,

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EzProxyError {
    /// Whether this error leaves a channel unusable
    pub fn is_fatal_to_channel(&self) -> bool {
        matches!(
            self,
            EzProxyError::Transport(_) | EzProxyError::Protocol(_) | EzProxyError::Remote { .. }
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, EzProxyError>;

/// Render an envelope payload for error messages: strings verbatim, anything else as compact JSON
pub(crate) fn render_payload(payload: &serde_json::Value) -> String {
    match payload {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
