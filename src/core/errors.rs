use std::fmt;
use thiserror::Error;

/// Network phase a session was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Resolve,
    Connect,
    TlsHandshake,
    Write,
    Read,
    WsHandshake,
    Close,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolve => "resolve",
            Self::Connect => "connect",
            Self::TlsHandshake => "handshake",
            Self::Write => "write",
            Self::Read => "read",
            Self::WsHandshake => "ws handshake",
            Self::Close => "close",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("{phase}: {message}")]
    Transport { phase: Phase, message: String },

    #[error("{phase}: timed out")]
    Timeout { phase: Phase },

    #[error("path not found")]
    PathNotFound,

    #[error("content type invalid: {0}")]
    ContentTypeInvalid(String),

    #[error("json read: {0}")]
    JsonRead(String),

    #[error("API error: {code} - {message}")]
    ApiError { code: i64, message: String },

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::core::config::ConfigError),

    #[error("engine is not running")]
    NotRunning,

    #[error("callback dispatcher is closed")]
    DispatcherClosed,

    #[error("Other error: {0}")]
    Other(String),
}

impl ExchangeError {
    pub(crate) fn transport(phase: Phase, err: impl fmt::Display) -> Self {
        Self::Transport {
            phase,
            message: err.to_string(),
        }
    }

    /// The network phase this error was raised in, if it is a transport failure.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Transport { phase, .. } | Self::Timeout { phase } => Some(*phase),
            _ => None,
        }
    }
}
