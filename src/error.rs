//! Error taxonomy shared across every component (spec §7).

use thiserror::Error;

/// Stable machine code surfaced on the outbound `Error` event, so the
/// embedding host can switch on it without string-matching `Display`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    NotFound,
    Conflict,
    AuthFailed,
    HostKeyUnknown,
    HostKeyChanged,
    MissingSecret,
    Transport,
    Protocol,
    Internal,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("unknown host key for {hostname}:{port}")]
    HostKeyUnknown { hostname: String, port: u16 },

    #[error("host key changed for {hostname}:{port}")]
    HostKeyChanged { hostname: String, port: u16 },

    #[error("secret missing: {0}")]
    MissingSecret(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::NotFound(_) => ErrorCode::NotFound,
            EngineError::Conflict(_) => ErrorCode::Conflict,
            EngineError::AuthFailed(_) => ErrorCode::AuthFailed,
            EngineError::HostKeyUnknown { .. } => ErrorCode::HostKeyUnknown,
            EngineError::HostKeyChanged { .. } => ErrorCode::HostKeyChanged,
            EngineError::MissingSecret(_) => ErrorCode::MissingSecret,
            EngineError::Transport(_) => ErrorCode::Transport,
            EngineError::Protocol(_) => ErrorCode::Protocol,
            EngineError::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Internal(format!("serde: {e}"))
    }
}

impl From<ssh2::Error> for EngineError {
    fn from(e: ssh2::Error) -> Self {
        EngineError::Transport(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
