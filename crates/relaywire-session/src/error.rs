//! Error types for the session layer.

use relaywire_mux::CallError;

use crate::SessionId;

/// Errors that can occur while working with sessions.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Talking to the session's peer failed.
    #[error(transparent)]
    Call(#[from] CallError),

    /// The session's connection is closed; room changes are refused.
    #[error("session {0} is closed")]
    Closed(SessionId),

    /// The server that owned the session has been dropped.
    #[error("server is gone")]
    ServerGone,
}
