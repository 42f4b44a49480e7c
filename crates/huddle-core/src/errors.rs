use std::time::Duration;

/// Errors raised by the remote backend connections.
/// Classifies errors as connection-level (flip connectivity) or per-command.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BackendError {
    // Connection-level
    #[error("connection error: {0}")]
    Connection(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    Closed,

    // Per-command
    #[error("command error: {0}")]
    Command(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BackendError {
    /// Whether this error means the connection itself is unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_) | Self::Closed)
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Timeout(_) => "timeout",
            Self::Closed => "closed",
            Self::Command(_) => "command",
            Self::Protocol(_) => "protocol",
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        BackendError::Protocol(e.to_string())
    }
}

/// Errors that can occur when loading settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid settings value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}
