//! Core protocol types for relaywire's wire format.
//!
//! A [`Frame`] is the typed view of one message. On the wire it is a flat
//! array of dynamic values; [`Frame::to_parts`] and [`Frame::from_parts`]
//! convert between the two and are the only places that know the layout.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Codec, ProtocolError};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Correlates a request with its response or stream frames.
///
/// Nonces are allocated by the side that initiates a call, start at 0, and
/// are never reused on the same connection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Nonce(pub u64);

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N-{}", self.0)
    }
}

/// The message kind, always the first element of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Request/response call.
    Unary,
    /// Request answered by a sequence of data frames and a terminal frame.
    Streaming,
    /// Named event with a per-name sequence number.
    Event,
}

impl Kind {
    /// The kind's wire tag.
    pub fn as_u64(self) -> u64 {
        match self {
            Self::Unary => 0,
            Self::Streaming => 1,
            Self::Event => 2,
        }
    }

    /// Parses a wire tag.
    pub fn from_u64(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(Self::Unary),
            1 => Some(Self::Streaming),
            2 => Some(Self::Event),
            _ => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unary => "unary",
            Self::Streaming => "streaming",
            Self::Event => "event",
        };
        f.write_str(name)
    }
}

/// Frame-type tags at position 2 of a kind-1 response.
const STREAM_DATA: u64 = 0;
const STREAM_END: u64 = 1;
const STREAM_FAULT: u64 = 2;

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `[0, nonce, procedure, input?]`
    Call {
        nonce: Nonce,
        procedure: String,
        input: Option<Value>,
    },

    /// `[0, nonce, success, payload]`
    ///
    /// `payload` is the result on success and the error description on
    /// failure. A response without a payload decodes with `Value::Null`.
    Reply {
        nonce: Nonce,
        success: bool,
        payload: Value,
    },

    /// `[1, nonce, procedure, input?]`
    OpenStream {
        nonce: Nonce,
        procedure: String,
        input: Option<Value>,
    },

    /// `[1, nonce, 0, index, value]`
    StreamData {
        nonce: Nonce,
        index: u64,
        value: Value,
    },

    /// `[1, nonce, 1, total]`
    StreamEnd { nonce: Nonce, total: u64 },

    /// `[1, nonce, 2, total, reason]`
    ///
    /// `total` is the number of data frames sent before the failure.
    StreamFault {
        nonce: Nonce,
        total: u64,
        reason: Value,
    },

    /// `[2, name, sequence, ...args]`
    Event {
        name: String,
        seq: u64,
        args: Vec<Value>,
    },
}

impl Frame {
    /// The frame's kind tag.
    pub fn kind(&self) -> Kind {
        match self {
            Self::Call { .. } | Self::Reply { .. } => Kind::Unary,
            Self::OpenStream { .. }
            | Self::StreamData { .. }
            | Self::StreamEnd { .. }
            | Self::StreamFault { .. } => Kind::Streaming,
            Self::Event { .. } => Kind::Event,
        }
    }

    /// Flattens the frame into its positional wire layout.
    pub fn to_parts(&self) -> Vec<Value> {
        let kind = Value::from(self.kind().as_u64());
        match self {
            Self::Call {
                nonce,
                procedure,
                input,
            }
            | Self::OpenStream {
                nonce,
                procedure,
                input,
            } => {
                let mut parts =
                    vec![kind, nonce.0.into(), procedure.as_str().into()];
                parts.extend(input.clone());
                parts
            }
            Self::Reply {
                nonce,
                success,
                payload,
            } => vec![kind, nonce.0.into(), (*success).into(), payload.clone()],
            Self::StreamData {
                nonce,
                index,
                value,
            } => vec![
                kind,
                nonce.0.into(),
                STREAM_DATA.into(),
                (*index).into(),
                value.clone(),
            ],
            Self::StreamEnd { nonce, total } => {
                vec![kind, nonce.0.into(), STREAM_END.into(), (*total).into()]
            }
            Self::StreamFault {
                nonce,
                total,
                reason,
            } => vec![
                kind,
                nonce.0.into(),
                STREAM_FAULT.into(),
                (*total).into(),
                reason.clone(),
            ],
            Self::Event { name, seq, args } => {
                let mut parts = Vec::with_capacity(args.len() + 3);
                parts.push(kind);
                parts.push(name.as_str().into());
                parts.push((*seq).into());
                parts.extend(args.iter().cloned());
                parts
            }
        }
    }

    /// Parses a positional wire layout.
    ///
    /// # Errors
    /// Returns `ProtocolError::InvalidMessage` when a fixed position is
    /// missing or has the wrong type. Position 2 decides between request
    /// (a procedure name) and response (a bool or frame-type number).
    pub fn from_parts(parts: Vec<Value>) -> Result<Self, ProtocolError> {
        let mut parts = parts.into_iter();
        let tag = parts
            .next()
            .ok_or_else(|| invalid("empty message"))?;
        let kind = tag
            .as_u64()
            .and_then(Kind::from_u64)
            .ok_or_else(|| invalid(format!("unknown kind {tag}")))?;

        match kind {
            Kind::Unary => {
                let nonce = nonce_at(parts.next())?;
                match parts.next() {
                    Some(Value::String(procedure)) => {
                        let input = parts.next();
                        no_more(parts, "unary request")?;
                        Ok(Self::Call {
                            nonce,
                            procedure,
                            input,
                        })
                    }
                    Some(Value::Bool(success)) => {
                        let payload = parts.next().unwrap_or(Value::Null);
                        no_more(parts, "unary response")?;
                        Ok(Self::Reply {
                            nonce,
                            success,
                            payload,
                        })
                    }
                    other => Err(invalid(format!(
                        "unary position 2 must be a string or bool, got {}",
                        describe(other.as_ref())
                    ))),
                }
            }
            Kind::Streaming => {
                let nonce = nonce_at(parts.next())?;
                match parts.next() {
                    Some(Value::String(procedure)) => {
                        let input = parts.next();
                        no_more(parts, "streaming request")?;
                        Ok(Self::OpenStream {
                            nonce,
                            procedure,
                            input,
                        })
                    }
                    Some(Value::Number(n)) => match n.as_u64() {
                        Some(STREAM_DATA) => {
                            let index = uint_at(parts.next(), "index")?;
                            let value = parts
                                .next()
                                .ok_or_else(|| invalid("stream data without value"))?;
                            no_more(parts, "stream data")?;
                            Ok(Self::StreamData {
                                nonce,
                                index,
                                value,
                            })
                        }
                        Some(STREAM_END) => {
                            let total = uint_at(parts.next(), "total")?;
                            no_more(parts, "stream end")?;
                            Ok(Self::StreamEnd { nonce, total })
                        }
                        Some(STREAM_FAULT) => {
                            let total = uint_at(parts.next(), "total")?;
                            let reason = parts.next().unwrap_or(Value::Null);
                            no_more(parts, "stream fault")?;
                            Ok(Self::StreamFault {
                                nonce,
                                total,
                                reason,
                            })
                        }
                        _ => Err(invalid(format!("unknown stream frame type {n}"))),
                    },
                    other => Err(invalid(format!(
                        "streaming position 2 must be a string or number, got {}",
                        describe(other.as_ref())
                    ))),
                }
            }
            Kind::Event => {
                let name = match parts.next() {
                    Some(Value::String(name)) => name,
                    other => {
                        return Err(invalid(format!(
                            "event name must be a string, got {}",
                            describe(other.as_ref())
                        )));
                    }
                };
                let seq = uint_at(parts.next(), "sequence")?;
                Ok(Self::Event {
                    name,
                    seq,
                    args: parts.collect(),
                })
            }
        }
    }

    /// Encodes the frame with `codec`.
    pub fn encode<C: Codec>(&self, codec: &C) -> Result<Vec<u8>, ProtocolError> {
        codec.encode(&self.to_parts())
    }

    /// Decodes and validates a frame with `codec`.
    pub fn decode<C: Codec>(codec: &C, data: &[u8]) -> Result<Self, ProtocolError> {
        let parts: Vec<Value> = codec.decode(data)?;
        Self::from_parts(parts)
    }
}

fn invalid(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidMessage(reason.into())
}

fn describe(value: Option<&Value>) -> String {
    match value {
        None => "nothing".to_string(),
        Some(value) => value.to_string(),
    }
}

fn uint_at(value: Option<Value>, field: &str) -> Result<u64, ProtocolError> {
    value
        .as_ref()
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            invalid(format!(
                "{field} must be a non-negative integer, got {}",
                describe(value.as_ref())
            ))
        })
}

fn nonce_at(value: Option<Value>) -> Result<Nonce, ProtocolError> {
    uint_at(value, "nonce").map(Nonce)
}

fn no_more(
    mut rest: impl Iterator<Item = Value>,
    what: &str,
) -> Result<(), ProtocolError> {
    match rest.next() {
        None => Ok(()),
        Some(_) => Err(invalid(format!("too many elements in {what}"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
