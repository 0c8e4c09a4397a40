//! # relaywire
//!
//! Bidirectional remote procedure calls and ordered events over a
//! resumable transport.
//!
//! A client calls named procedures on a server, unary or streaming; both
//! sides emit ordered events to each other; the server groups sessions
//! into rooms for broadcast. When the transport cannot resume and hands
//! over a fresh link, calls that were in flight fail with
//! "Old connection closed" and everything else carries on.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relaywire::prelude::*;
//!
//! #[derive(serde::Deserialize)]
//! struct Add {
//!     a: i64,
//!     b: i64,
//! }
//!
//! type Ctx = Context<(), (), ServerSocket>;
//!
//! # async fn run() -> Result<(), RelaywireError> {
//! let server = Server::<(), (), ServerSocket>::builder(())
//!     .procedure(
//!         "add",
//!         input(Json::<Add>::new()).resolve(|_ctx: Ctx, Add { a, b }| async move {
//!             Ok::<_, String>(a + b)
//!         }),
//!     )
//!     .build();
//!
//! let listener = WebSocketListener::bind("127.0.0.1:8080").await?;
//! serve(listener, server).await
//! # }
//! ```
//!
//! ## Crates
//!
//! | Crate | Layer |
//! |---|---|
//! | `relaywire-transport` | [`Socket`](relaywire_transport::Socket) capability, WebSocket and in-memory sockets |
//! | `relaywire-protocol` | Wire frames and codecs |
//! | `relaywire-procedure` | Procedure definitions and input parsing |
//! | `relaywire-mux` | Call correlation, stream reassembly, ordered events |
//! | `relaywire-room` | Room membership |
//! | `relaywire-session` | Server sessions, state, dispatch, broadcast |

mod error;
mod serve;

pub use error::RelaywireError;
#[cfg(feature = "websocket")]
pub use serve::{connect, connect_with_key};
pub use serve::{serve, serve_with_shutdown};

pub use relaywire_mux as mux;
pub use relaywire_procedure as procedure;
pub use relaywire_protocol as protocol;
pub use relaywire_room as room;
pub use relaywire_session as session;
pub use relaywire_transport as transport;

/// Everything needed to define a server and talk to it.
pub mod prelude {
    pub use crate::{RelaywireError, serve, serve_with_shutdown};
    #[cfg(feature = "websocket")]
    pub use crate::{connect, connect_with_key};

    pub use relaywire_mux::{
        CONNECTION_LOST, CallError, CallStream, LinkState, Multiplexer,
        PROCEDURE_NOT_FOUND,
    };
    pub use relaywire_procedure::{
        Json, NoInput, Parser, Procedure, ProcedureError, ProcedureTable,
        ValidationError, input, parser_fn,
    };
    pub use relaywire_protocol::{Codec, JsonCodec, Value};
    pub use relaywire_room::IntoRooms;
    pub use relaywire_session::{
        BroadcastOperator, Context, Server, ServerBuilder, Session,
        SessionError, SessionId,
    };
    pub use relaywire_transport::memory::MemorySocket;
    pub use relaywire_transport::{Listener, Qos, Socket, TransportError};
    #[cfg(feature = "websocket")]
    pub use relaywire_transport::{
        ClientSocket, ServerSocket, WebSocketListener, WebSocketSocket,
    };
}
