use thiserror::Error;

use crate::envelope::Reason;

/// Errors emitted across the LIME node core.
///
/// Every public operation returns this type; the variants mirror the failure
/// categories callers are expected to branch on (retry on `Transport`,
/// surface `Authentication`, never swallow `Cancelled`).
#[derive(Debug, Clone, Error)]
pub enum LimeError {
    /// Malformed or unexpected envelope on the wire.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Session state violation, including operations on a closed channel.
    #[error("session error: {0}")]
    Session(String),
    /// The remote peer terminated the session with a reason.
    #[error("session failed: {0}")]
    SessionFailed(Reason),
    /// I/O failure on the underlying transport.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("authorization failed: {0}")]
    Authorization(String),
    #[error("storage error: {0}")]
    Storage(String),
    /// The owning handle was disposed; no further operations are possible.
    #[error("disposed")]
    Disposed,
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl LimeError {
    /// Standard error for operations attempted on a channel that is no
    /// longer (or not yet) established.
    pub fn closed() -> Self {
        LimeError::Session("channel is closed".into())
    }

    /// Reason the remote peer reported, when one was carried.
    pub fn session_reason(&self) -> Option<&Reason> {
        match self {
            LimeError::SessionFailed(reason) => Some(reason),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for LimeError {
    fn from(err: serde_json::Error) -> Self {
        LimeError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for LimeError {
    fn from(err: std::io::Error) -> Self {
        LimeError::Transport(err.to_string())
    }
}
