//! Transport capability for relaywire.
//!
//! The multiplexer never talks to a network directly. It consumes a
//! [`Socket`]: something that can send a payload tagged with a [`Qos`]
//! flag, report arrivals, and announce that it has been replaced by a
//! fresh handle after a failed resume.
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket adapter via `tokio-tungstenite`
//!
//! The [`memory`] module is always available; it backs the test suites
//! of every crate above this one.

mod error;
pub mod memory;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use memory::{MemoryLink, MemorySocket};
#[cfg(feature = "websocket")]
pub use websocket::{
    ClientSocket, DEFAULT_HANDSHAKE_TIMEOUT, ServerSocket, WebSocketListener,
    WebSocketSocket,
};

use std::fmt;
use std::future::Future;

// ---------------------------------------------------------------------------
// Qos
// ---------------------------------------------------------------------------

/// Delivery-confirmation flag attached to every payload.
///
/// The relaywire protocol only ever sends [`Qos::Confirmed`]; receivers
/// drop anything tagged [`Qos::Unconfirmed`] without reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Qos {
    /// Fire-and-forget. The send future resolves immediately.
    Unconfirmed,
    /// The send future resolves once the peer has taken delivery.
    #[default]
    Confirmed,
}

impl Qos {
    /// The flag's single-byte wire value (`0` or `1`).
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Unconfirmed => 0,
            Self::Confirmed => 1,
        }
    }

    /// Parses a wire flag. Any non-zero byte means confirmed.
    pub fn from_u8(value: u8) -> Self {
        if value == 0 {
            Self::Unconfirmed
        } else {
            Self::Confirmed
        }
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qos-{}", self.as_u8())
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// A notification produced by [`Socket::recv`].
#[derive(Debug)]
pub enum SocketEvent<S> {
    /// A payload arrived from the peer.
    Data {
        /// Delivery flag the peer sent the payload with.
        qos: Qos,
        /// Raw bytes, still encoded.
        payload: Vec<u8>,
    },

    /// The transport could not resume the previous link and hands over a
    /// fresh handle. Anything in flight on the old handle is gone.
    Replaced(S),
}

/// A single logical connection that can send and receive tagged payloads.
///
/// `send` and `recv` take `&self` and must be callable concurrently: the
/// multiplexer receives on one task while any number of tasks send.
pub trait Socket: Send + Sync + Sized + 'static {
    /// The peer's connection public key. Session identity is derived from
    /// these bytes, so they must stay stable across replacement.
    fn connection_key(&self) -> &[u8];

    /// Sends a payload. For [`Qos::Confirmed`] the future resolves once
    /// the peer has taken delivery.
    fn send(
        &self,
        qos: Qos,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Waits for the next notification.
    ///
    /// Returns `Ok(None)` when the connection is closed for good.
    fn recv(
        &self,
    ) -> impl Future<Output = Result<Option<SocketEvent<Self>>, TransportError>>
    + Send;

    /// Closes the connection. A pending or later `recv` returns `Ok(None)`.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Accepts new incoming sockets.
pub trait Listener: Send + 'static {
    /// The socket type produced by this listener.
    type Socket: Socket;

    /// Waits for and accepts the next incoming socket.
    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<Self::Socket, TransportError>> + Send;
}
