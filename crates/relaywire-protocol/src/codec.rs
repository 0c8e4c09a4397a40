//! Codec trait and implementations for serializing/deserializing frames.
//!
//! The multiplexer never picks a byte format itself. It hands values to
//! something that implements [`Codec`], so a binary format can replace
//! [`JsonCodec`] without touching any other layer.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// A codec that can encode Rust types to bytes and decode bytes back.
///
/// Codecs are shared by every connection of a server, hence the
/// `Send + Sync + 'static` bounds, and are cloned into each multiplexer.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed,
    /// incomplete, or don't match the expected type.
    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// ```rust
/// use relaywire_protocol::{Codec, Frame, JsonCodec, Nonce};
///
/// let codec = JsonCodec;
/// let frame = Frame::Reply {
///     nonce: Nonce(4),
///     success: true,
///     payload: 5.into(),
/// };
///
/// let bytes = frame.encode(&codec).unwrap();
/// assert_eq!(bytes, br#"[0,4,true,5]"#);
/// assert_eq!(Frame::decode(&codec, &bytes).unwrap(), frame);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}
