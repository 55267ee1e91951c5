//! Global error types for the msgr workspace.
//!
//! All error categories are unified into a single `MsgrError` enum with
//! conversions from underlying library errors.

use thiserror::Error;

/// Convenience type alias for Results using MsgrError.
pub type MsgrResult<T> = Result<T, MsgrError>;

/// Unified error type covering all error categories.
#[derive(Error, Debug)]
pub enum MsgrError {
    // -- Configuration errors --
    /// Failed to load or parse configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A required configuration value is missing.
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    // -- Network errors --
    /// HTTP request failed.
    #[error("http error: {0}")]
    Http(String),

    /// Request or wait timed out.
    #[error("request timeout: {0}")]
    Timeout(String),

    /// Server returned an error response.
    #[error("server error (status {status}): {message}")]
    ServerError {
        /// HTTP status code.
        status: u16,
        /// Error message from server.
        message: String,
    },

    /// Authentication was rejected or the session was lost.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// MQTT/WebSocket transport error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The transport closed underneath an operation.
    #[error("transport closed")]
    TransportClosed,

    // -- Protocol errors --
    /// A response or frame did not have the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // -- Task errors --
    /// A queued task reply could not be decoded.
    #[error("task {kind} failed: {message}")]
    TaskFailed {
        /// Task kind string.
        kind: String,
        /// What went wrong.
        message: String,
    },

    /// The task was dropped because the connection was torn down.
    #[error("task cancelled: {0}")]
    TaskCancelled(String),

    /// The listener has been stopped or its worker is gone.
    #[error("listener stopped")]
    ListenerStopped,

    // -- File/IO errors --
    /// File system operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // -- Generic --
    /// An unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Wrapping anyhow errors for interop.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MsgrError {
    /// Whether this error came from the HTTP layer reporting a lost session.
    pub fn is_auth(&self) -> bool {
        matches!(self, MsgrError::AuthFailed(_))
            || matches!(self, MsgrError::ServerError { status, .. } if *status == 401 || *status == 403)
    }
}

impl From<serde_json::Error> for MsgrError {
    fn from(e: serde_json::Error) -> Self {
        MsgrError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for MsgrError {
    fn from(e: toml::de::Error) -> Self {
        MsgrError::Config(e.to_string())
    }
}
