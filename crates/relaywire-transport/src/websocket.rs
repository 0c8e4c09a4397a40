//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! Every binary message carries one leading byte with the [`Qos`] flag,
//! followed by the encoded payload. Right after the upgrade the client
//! sends its connection key as a bare binary message; the server adopts
//! it as [`Socket::connection_key`].
//!
//! A plain WebSocket cannot resume, so these sockets never produce
//! [`SocketEvent::Replaced`]. A confirmed send resolves once the message
//! has been flushed to the peer.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::{Listener, Qos, Socket, SocketEvent, TransportError};

/// Length of generated client keys.
const KEY_LEN: usize = 32;

fn io_error<E>(kind: std::io::ErrorKind, e: E) -> std::io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    std::io::Error::new(kind, e)
}

/// The socket [`WebSocketSocket::connect`] produces.
pub type ClientSocket = WebSocketSocket<MaybeTlsStream<TcpStream>>;

/// The socket [`WebSocketListener`] accepts.
pub type ServerSocket = WebSocketSocket<TcpStream>;

/// How long a new connection may take to upgrade and present its key.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A WebSocket [`Listener`] bound to a TCP address.
///
/// Each accepted TCP stream is upgraded on its own task, so a client that
/// stalls mid-handshake never holds up the connections behind it.
pub struct WebSocketListener {
    listener: TcpListener,
    handshakes: JoinSet<Result<ServerSocket, TransportError>>,
    handshake_timeout: Duration,
}

impl WebSocketListener {
    /// Binds a new listener to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "WebSocket listener bound");
        Ok(Self {
            listener,
            handshakes: JoinSet::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        })
    }

    /// Sets how long a connection may take to upgrade and send its key
    /// before it is dropped.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// The address the listener is actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(TransportError::AcceptFailed)
    }
}

impl fmt::Debug for WebSocketListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketListener")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("handshakes", &self.handshakes.len())
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl Listener for WebSocketListener {
    type Socket = ServerSocket;

    /// Returns the next connection that completed its handshake.
    ///
    /// Cancel safe: in-flight handshakes stay in the listener and are
    /// picked up by the next call.
    async fn accept(&mut self) -> Result<Self::Socket, TransportError> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) =
                        accepted.map_err(TransportError::AcceptFailed)?;
                    self.handshakes.spawn(handshake(
                        stream,
                        addr,
                        self.handshake_timeout,
                    ));
                }
                Some(done) = self.handshakes.join_next() => {
                    return done.map_err(|e| {
                        TransportError::AcceptFailed(io_error(
                            std::io::ErrorKind::Other,
                            e,
                        ))
                    })?;
                }
            }
        }
    }
}

async fn handshake(
    stream: TcpStream,
    addr: SocketAddr,
    limit: Duration,
) -> Result<ServerSocket, TransportError> {
    match tokio::time::timeout(limit, upgrade(stream, addr)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(%addr, "WebSocket handshake timed out");
            Err(TransportError::AcceptFailed(io_error(
                std::io::ErrorKind::TimedOut,
                "handshake timed out",
            )))
        }
    }
}

/// Upgrades `stream` and reads the client's connection key.
async fn upgrade(
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<ServerSocket, TransportError> {
    let mut ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| {
            TransportError::AcceptFailed(io_error(
                std::io::ErrorKind::ConnectionRefused,
                e,
            ))
        })?;

    let key = match ws.next().await {
        Some(Ok(Message::Binary(key))) if !key.is_empty() => key.to_vec(),
        Some(Err(e)) => {
            return Err(TransportError::AcceptFailed(io_error(
                std::io::ErrorKind::ConnectionReset,
                e,
            )));
        }
        _ => {
            return Err(TransportError::AcceptFailed(io_error(
                std::io::ErrorKind::InvalidData,
                "expected a connection key",
            )));
        }
    };

    tracing::debug!(
        %addr,
        key_len = key.len(),
        "accepted WebSocket connection"
    );
    Ok(WebSocketSocket::from_stream(ws, key))
}

/// One end of a WebSocket connection.
///
/// The sink and the stream halves are locked independently so a pending
/// `recv` never blocks a `send`.
pub struct WebSocketSocket<T> {
    key: Vec<u8>,
    sink: Mutex<SplitSink<WebSocketStream<T>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<T>>>,
}

impl<T> fmt::Debug for WebSocketSocket<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketSocket")
            .field("key_len", &self.key.len())
            .finish_non_exhaustive()
    }
}

impl ClientSocket {
    /// Connects to `url` with a freshly generated connection key.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let key: [u8; KEY_LEN] = rand::rng().random();
        Self::connect_with_key(url, key.to_vec()).await
    }

    /// Connects to `url` presenting `key` as the connection key.
    ///
    /// Reusing a key lets a reconnecting client land on the same server
    /// session.
    pub async fn connect_with_key(
        url: &str,
        key: Vec<u8>,
    ) -> Result<Self, TransportError> {
        let (mut ws, _) =
            tokio_tungstenite::connect_async(url).await.map_err(|e| {
                TransportError::ConnectionClosed(format!(
                    "failed to connect to {url}: {e}"
                ))
            })?;

        ws.send(Message::Binary(key.clone().into()))
            .await
            .map_err(|e| {
                TransportError::SendFailed(io_error(
                    std::io::ErrorKind::BrokenPipe,
                    e,
                ))
            })?;

        tracing::debug!(url, "connected WebSocket client");
        Ok(Self::from_stream(ws, key))
    }
}

impl<T> WebSocketSocket<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn from_stream(ws: WebSocketStream<T>, key: Vec<u8>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            key,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

impl<T> Socket for WebSocketSocket<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn connection_key(&self) -> &[u8] {
        &self.key
    }

    async fn send(
        &self,
        qos: Qos,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let mut data = Vec::with_capacity(payload.len() + 1);
        data.push(qos.as_u8());
        data.extend_from_slice(&payload);

        self.sink
            .lock()
            .await
            .send(Message::Binary(data.into()))
            .await
            .map_err(|e| {
                TransportError::SendFailed(io_error(
                    std::io::ErrorKind::BrokenPipe,
                    e,
                ))
            })
    }

    async fn recv(&self) -> Result<Option<SocketEvent<Self>>, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let Some((&flag, payload)) = data.split_first() else {
                        tracing::warn!("discarding empty WebSocket message");
                        continue;
                    };
                    return Ok(Some(SocketEvent::Data {
                        qos: Qos::from_u8(flag),
                        payload: payload.to_vec(),
                    }));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // skip text/ping/pong/frame
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(io_error(
                        std::io::ErrorKind::ConnectionReset,
                        e,
                    )));
                }
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.sink.lock().await.close().await.map_err(|e| {
            TransportError::SendFailed(io_error(
                std::io::ErrorKind::BrokenPipe,
                e,
            ))
        })
    }
}
