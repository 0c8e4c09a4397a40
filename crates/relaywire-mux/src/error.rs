//! Error types for the multiplexer.

use relaywire_protocol::{ProtocolError, Value};
use relaywire_transport::TransportError;

/// Failure reason reported for calls lost to a transport replacement.
pub const CONNECTION_LOST: &str = "Old connection closed";

/// Routing failure sent back for unknown procedures.
pub const PROCEDURE_NOT_FOUND: &str = "Procedure not found";

/// Why an outbound call, stream, or event did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The peer answered with a failure. The payload is the peer's error
    /// description, usually a string.
    #[error("{}", remote_text(.0))]
    Remote(Value),

    /// The transport was replaced while the call was pending.
    #[error("{}", CONNECTION_LOST)]
    ConnectionLost,

    /// The connection is closed for good.
    #[error("connection closed")]
    Closed,

    /// Sending failed at the transport.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Encoding the request or decoding the response failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl CallError {
    /// The remote failure payload, if the peer reported one.
    pub fn remote(&self) -> Option<&Value> {
        match self {
            Self::Remote(payload) => Some(payload),
            _ => None,
        }
    }
}

fn remote_text(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_remote_display_prefers_plain_strings() {
        assert_eq!(
            CallError::Remote(json!("Procedure not found")).to_string(),
            "Procedure not found"
        );
        assert_eq!(
            CallError::Remote(json!({ "code": 3 })).to_string(),
            r#"{"code":3}"#
        );
    }

    #[test]
    fn test_connection_lost_reason() {
        assert_eq!(CallError::ConnectionLost.to_string(), CONNECTION_LOST);
    }
}
