//! Error types for the protocol layer.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning values into bytes).
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into values).
    ///
    /// Common causes: malformed bytes, truncated messages, or a payload
    /// that is not an array.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The message decoded but breaks the frame layout, e.g. a missing
    /// nonce or a sequence number that is not an integer.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
