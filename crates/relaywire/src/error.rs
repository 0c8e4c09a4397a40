//! Unified error type for relaywire.

use relaywire_mux::CallError;
use relaywire_procedure::{ProcedureError, ValidationError};
use relaywire_protocol::ProtocolError;
use relaywire_session::SessionError;
use relaywire_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant lets `?` convert sub-crate
/// errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum RelaywireError {
    /// A transport-level error (bind, accept, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A framing error (encode, decode, malformed message).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A procedure failed to validate its input or to resolve.
    #[error(transparent)]
    Procedure(#[from] ProcedureError),

    /// A call, stream, or event did not succeed.
    #[error(transparent)]
    Call(#[from] CallError),

    /// A session-level error (closed session, server gone).
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<ValidationError> for RelaywireError {
    fn from(e: ValidationError) -> Self {
        Self::Procedure(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let relaywire_err: RelaywireError = err.into();
        assert!(matches!(relaywire_err, RelaywireError::Transport(_)));
        assert!(relaywire_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::InvalidMessage("bad".into());
        let relaywire_err: RelaywireError = err.into();
        assert!(matches!(relaywire_err, RelaywireError::Protocol(_)));
    }

    #[test]
    fn test_from_validation_error() {
        let relaywire_err: RelaywireError = ValidationError::new("a is required").into();
        assert!(matches!(
            relaywire_err,
            RelaywireError::Procedure(ProcedureError::Validation(_))
        ));
        assert_eq!(relaywire_err.to_string(), "invalid input: a is required");
    }

    #[test]
    fn test_from_call_error_keeps_loss_reason() {
        let relaywire_err: RelaywireError = CallError::ConnectionLost.into();
        assert!(matches!(relaywire_err, RelaywireError::Call(_)));
        assert_eq!(relaywire_err.to_string(), "Old connection closed");
    }

    #[test]
    fn test_from_session_error() {
        let relaywire_err: RelaywireError = SessionError::ServerGone.into();
        assert!(matches!(relaywire_err, RelaywireError::Session(_)));
    }
}
