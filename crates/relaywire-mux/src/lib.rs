//! Connection multiplexer for relaywire.
//!
//! A [`Multiplexer`] sits on top of one [`Socket`](relaywire_transport::Socket)
//! and carries any number of concurrent conversations over it:
//!
//! - **Unary calls** ([`Multiplexer::call`]) correlated by nonce.
//! - **Streaming calls** ([`Multiplexer::stream`]) whose data frames are
//!   reassembled in index order, with backpressure applied by the sender.
//! - **Ordered events** ([`Multiplexer::emit`], [`Multiplexer::on`]),
//!   sequenced per event name and reordered on arrival.
//!
//! The multiplexer is symmetric. A client uses it to call a server, and
//! a server session uses the same type, with a [`RequestHandler`]
//! attached, to serve those calls and emit events back.
//!
//! # Transport replacement
//!
//! When the transport reports that it could not resume and hands over a
//! fresh link, every call and stream still pending fails with
//! [`CallError::ConnectionLost`] and the multiplexer carries on with the
//! new link. Event sequence counters are kept as they are.
//!
//! ```text
//! Attached ──Replaced──▶ Replacing ──▶ Attached
//!     │                                   │
//!     └──────── closed / shutdown ────────┴──▶ Closed
//! ```

mod error;
mod events;
mod mux;
mod reorder;
mod stream;

pub use error::{CONNECTION_LOST, CallError, PROCEDURE_NOT_FOUND};
pub use mux::{
    Driver, InboundRequest, LinkState, Multiplexer, RequestHandler,
    RequestKind,
};
pub use reorder::ReorderBuffer;
pub use stream::CallStream;
