//! Server-side sessions for relaywire.
//!
//! A [`Server`] owns the procedure table and the application state, and
//! turns every accepted socket into a [`Session`]:
//!
//! 1. **Identity**: the session id is the hex SHA-512 digest of the
//!    socket's connection key ([`SessionId`]).
//! 2. **Dispatch**: inbound calls are routed by name to a
//!    [`Procedure`](relaywire_procedure::Procedure) and executed with a
//!    [`Context`] carrying the global state, the session's private state,
//!    and the session itself.
//! 3. **Rooms**: sessions join named rooms; [`BroadcastOperator`] emits
//!    an event to everyone in a set of rooms.
//!
//! # How it fits in the stack
//!
//! ```text
//! relaywire (above)          ← accept loop, unified errors
//!     ↕
//! Session Layer (this crate) ← identity, state, dispatch, rooms
//!     ↕
//! relaywire-mux (below)      ← calls, streams, ordered events
//! ```

mod broadcast;
mod context;
mod dispatch;
mod error;
mod id;
mod server;
mod session;

pub use broadcast::BroadcastOperator;
pub use context::Context;
pub use error::SessionError;
pub use id::SessionId;
pub use server::{SESSION_EVENT, Server, ServerBuilder};
pub use session::Session;
