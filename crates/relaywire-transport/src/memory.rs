//! In-process sockets connected by channels.
//!
//! [`pair`] returns two connected ends. A confirmed send resolves only
//! when the other end has pulled the payload out of [`Socket::recv`], which
//! makes delivery confirmation observable in tests. [`resumable_pair`]
//! additionally returns a [`MemoryLink`] that can force a transport
//! replacement on both ends at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};

use crate::{Qos, Socket, SocketEvent, TransportError};

/// What travels through the channel between the two ends.
enum Inbound {
    Data {
        qos: Qos,
        payload: Vec<u8>,
        ack: Option<oneshot::Sender<()>>,
    },
    Replaced(MemorySocket),
    Closed,
}

/// One end of an in-memory connection.
pub struct MemorySocket {
    key: Vec<u8>,
    /// Sender into the peer's inbound channel. `None` once closed.
    outbound: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    /// Weak handle to our own inbound channel, used to wake `recv` on close.
    own: mpsc::WeakUnboundedSender<Inbound>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MemorySocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySocket")
            .field("key_len", &self.key.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Creates two connected sockets sharing the same connection key.
pub fn pair(connection_key: impl Into<Vec<u8>>) -> (MemorySocket, MemorySocket) {
    let (first, second, _link) = resumable_pair(connection_key);
    (first, second)
}

/// Like [`pair`], plus a [`MemoryLink`] that can replace the connection.
pub fn resumable_pair(
    connection_key: impl Into<Vec<u8>>,
) -> (MemorySocket, MemorySocket, MemoryLink) {
    let key = connection_key.into();
    let (first, second) = connect(&key);
    let link = MemoryLink {
        ends: Mutex::new((first.own.clone(), second.own.clone())),
        key,
    };
    (first, second, link)
}

fn connect(key: &[u8]) -> (MemorySocket, MemorySocket) {
    let (to_first, first_rx) = mpsc::unbounded_channel();
    let (to_second, second_rx) = mpsc::unbounded_channel();
    let first_own = to_first.downgrade();
    let second_own = to_second.downgrade();

    let first = MemorySocket {
        key: key.to_vec(),
        own: first_own,
        outbound: Mutex::new(Some(to_second)),
        inbound: tokio::sync::Mutex::new(first_rx),
        closed: AtomicBool::new(false),
    };
    let second = MemorySocket {
        key: key.to_vec(),
        own: second_own,
        outbound: Mutex::new(Some(to_first)),
        inbound: tokio::sync::Mutex::new(second_rx),
        closed: AtomicBool::new(false),
    };
    (first, second)
}

impl Socket for MemorySocket {
    fn connection_key(&self) -> &[u8] {
        &self.key
    }

    async fn send(
        &self,
        qos: Qos,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let (ack, confirmation) = match qos {
            Qos::Confirmed => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
            Qos::Unconfirmed => (None, None),
        };

        {
            let outbound =
                self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
            let tx = outbound.as_ref().ok_or_else(|| {
                TransportError::ConnectionClosed("socket closed".into())
            })?;
            tx.send(Inbound::Data { qos, payload, ack }).map_err(|_| {
                TransportError::ConnectionClosed("peer dropped".into())
            })?;
        }

        if let Some(confirmation) = confirmation {
            confirmation.await.map_err(|_| TransportError::Unconfirmed)?;
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Option<SocketEvent<Self>>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }

        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(Inbound::Data { qos, payload, ack }) => {
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                Ok(Some(SocketEvent::Data { qos, payload }))
            }
            Some(Inbound::Replaced(next)) => {
                Ok(Some(SocketEvent::Replaced(next)))
            }
            Some(Inbound::Closed) | None => {
                self.closed.store(true, Ordering::Release);
                Ok(None)
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(own) = self.own.upgrade() {
            let _ = own.send(Inbound::Closed);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryLink
// ---------------------------------------------------------------------------

/// Test control over a [`resumable_pair`].
///
/// Holds only weak handles, so it never keeps a connection open.
pub struct MemoryLink {
    key: Vec<u8>,
    ends: Mutex<(
        mpsc::WeakUnboundedSender<Inbound>,
        mpsc::WeakUnboundedSender<Inbound>,
    )>,
}

impl MemoryLink {
    /// Simulates a failed resume: builds a fresh connected pair with the
    /// same key and delivers [`SocketEvent::Replaced`] to both current ends.
    ///
    /// Payloads already queued on the old ends are still delivered before
    /// the replacement notification.
    pub fn replace(&self) -> Result<(), TransportError> {
        let mut ends = self.ends.lock().unwrap_or_else(PoisonError::into_inner);

        let first = ends.0.upgrade().ok_or_else(|| {
            TransportError::ConnectionClosed("first end dropped".into())
        })?;
        let second = ends.1.upgrade().ok_or_else(|| {
            TransportError::ConnectionClosed("second end dropped".into())
        })?;

        let (next_first, next_second) = connect(&self.key);
        let next_ends = (next_first.own.clone(), next_second.own.clone());

        first.send(Inbound::Replaced(next_first)).map_err(|_| {
            TransportError::ConnectionClosed("first end dropped".into())
        })?;
        second.send(Inbound::Replaced(next_second)).map_err(|_| {
            TransportError::ConnectionClosed("second end dropped".into())
        })?;

        *ends = next_ends;
        tracing::debug!("memory link replaced");
        Ok(())
    }
}
