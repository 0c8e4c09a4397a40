//! Wire protocol for relaywire.
//!
//! This crate defines the messages two multiplexers exchange:
//!
//! - **Types** ([`Frame`], [`Kind`], [`Nonce`]): the three message kinds
//!   and their positional layouts.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how a frame's array of
//!   dynamic values is turned into bytes and back.
//! - **Errors** ([`ProtocolError`]): what can go wrong while encoding,
//!   decoding, or validating a frame.
//!
//! Every frame is an array whose first element is the kind:
//!
//! ```text
//! [0, nonce, procedure, input?]         unary request
//! [0, nonce, success, payload]          unary response
//! [1, nonce, procedure, input?]         streaming request
//! [1, nonce, 0, index, value]           stream data
//! [1, nonce, 1, total]                  stream end
//! [1, nonce, 2, total, reason]          stream fault
//! [2, name, sequence, ...args]          ordered event
//! ```
//!
//! The protocol layer knows nothing about connections or pending calls;
//! it only shapes and validates messages.

mod codec;
mod error;
mod types;

pub use codec::{Codec, JsonCodec};
pub use error::ProtocolError;
pub use types::{Frame, Kind, Nonce};

/// The dynamic value type carried by every frame.
pub use serde_json::Value;
