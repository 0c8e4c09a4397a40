//! The connection multiplexer and its receive driver.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use relaywire_protocol::{Codec, Frame, JsonCodec, Nonce, ProtocolError, Value};
use relaywire_transport::{Qos, Socket, SocketEvent};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot, watch};

use crate::events::{self, EventListeners};
use crate::stream::{StreamSlot, Terminal};
use crate::{CallError, CallStream, PROCEDURE_NOT_FOUND, ReorderBuffer};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Where the multiplexer's transport link stands.
///
/// `Attached → Replacing → Attached` on every transport replacement;
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Attached,
    Replacing,
    Closed,
}

/// Whether a request expects one reply or a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Unary,
    Streaming,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unary => f.write_str("unary"),
            Self::Streaming => f.write_str("streaming"),
        }
    }
}

/// A call received from the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRequest {
    pub kind: RequestKind,
    pub nonce: Nonce,
    pub procedure: String,
    pub input: Option<Value>,
}

/// Serves requests arriving on a multiplexer.
///
/// `handle` is called on the driver task for every request, in arrival
/// order, and must not block: spawn the actual work and answer through
/// the responder methods of the [`Multiplexer`] it is given.
pub trait RequestHandler<S: Socket, C: Codec>: Send + Sync + 'static {
    fn handle(&self, mux: Multiplexer<S, C>, request: InboundRequest);
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Per-connection bookkeeping. Guarded by one mutex that is never held
/// across an await.
struct Tables {
    state: LinkState,
    unary: HashMap<Nonce, oneshot::Sender<Result<Value, CallError>>>,
    streams: HashMap<Nonce, Arc<StreamSlot>>,
    inbound_events: HashMap<String, ReorderBuffer<Vec<Value>>>,
    outbound_events: HashMap<String, u64>,
}

impl Tables {
    fn ensure_open(&self) -> Result<(), CallError> {
        match self.state {
            LinkState::Closed => Err(CallError::Closed),
            LinkState::Attached | LinkState::Replacing => Ok(()),
        }
    }
}

type Pending = (
    HashMap<Nonce, oneshot::Sender<Result<Value, CallError>>>,
    HashMap<Nonce, Arc<StreamSlot>>,
);

struct Shared<S: Socket, C: Codec> {
    codec: C,
    link: RwLock<Arc<S>>,
    generation: AtomicU64,
    next_nonce: AtomicU64,
    tables: Mutex<Tables>,
    listeners: Mutex<EventListeners>,
    handler: Option<Arc<dyn RequestHandler<S, C>>>,
    closed: watch::Sender<bool>,
}

impl<S: Socket, C: Codec> Shared<S, C> {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, EventListeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn link(&self) -> Arc<S> {
        Arc::clone(&self.link.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn take_pending(tables: &mut Tables) -> Pending {
        (
            std::mem::take(&mut tables.unary),
            std::mem::take(&mut tables.streams),
        )
    }

    /// Moves to `Closed` and fails everything pending. Returns `false` if
    /// the connection was already closed.
    fn close(&self) -> bool {
        let (unary, streams) = {
            let mut tables = self.tables();
            if tables.state == LinkState::Closed {
                return false;
            }
            tables.state = LinkState::Closed;
            Self::take_pending(&mut tables)
        };

        let failed = unary.len() + streams.len();
        for (_, tx) in unary {
            let _ = tx.send(Err(CallError::Closed));
        }
        for (_, slot) in streams {
            slot.lose(Terminal::Closed);
        }
        self.closed.send_replace(true);
        tracing::debug!(failed, "multiplexer closed");
        true
    }
}

// ---------------------------------------------------------------------------
// Multiplexer
// ---------------------------------------------------------------------------

/// One side of a relaywire connection.
///
/// Correlates calls with responses by nonce, reassembles streams, and
/// delivers ordered events. The same type serves clients and every server
/// session; servers attach a [`RequestHandler`]. Cloning is cheap and all
/// clones drive the same connection.
///
/// Receiving is done by the [`Driver`] returned alongside the
/// multiplexer, which must be polled (usually spawned) for anything to
/// arrive.
pub struct Multiplexer<S: Socket, C: Codec = JsonCodec> {
    shared: Arc<Shared<S, C>>,
}

impl<S: Socket, C: Codec> Clone for Multiplexer<S, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Socket, C: Codec> fmt::Debug for Multiplexer<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("state", &self.link_state())
            .field("generation", &self.link_generation())
            .finish_non_exhaustive()
    }
}

impl<S: Socket, C: Codec> Multiplexer<S, C> {
    /// Creates a multiplexer without a request handler. Requests from the
    /// peer are answered with [`PROCEDURE_NOT_FOUND`].
    pub fn new(socket: S, codec: C) -> (Self, Driver<S, C>) {
        Self::build(socket, codec, None)
    }

    /// Creates a multiplexer whose inbound requests go to `handler`.
    pub fn with_handler(
        socket: S,
        codec: C,
        handler: Arc<dyn RequestHandler<S, C>>,
    ) -> (Self, Driver<S, C>) {
        Self::build(socket, codec, Some(handler))
    }

    /// Creates a client multiplexer and spawns its driver.
    ///
    /// Must be called within a Tokio runtime.
    pub fn connect(socket: S, codec: C) -> Self {
        let (mux, driver) = Self::new(socket, codec);
        tokio::spawn(driver.run());
        mux
    }

    fn build(
        socket: S,
        codec: C,
        handler: Option<Arc<dyn RequestHandler<S, C>>>,
    ) -> (Self, Driver<S, C>) {
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            codec,
            link: RwLock::new(Arc::new(socket)),
            generation: AtomicU64::new(0),
            next_nonce: AtomicU64::new(0),
            tables: Mutex::new(Tables {
                state: LinkState::Attached,
                unary: HashMap::new(),
                streams: HashMap::new(),
                inbound_events: HashMap::new(),
                outbound_events: HashMap::new(),
            }),
            listeners: Mutex::new(EventListeners::default()),
            handler,
            closed,
        });
        let driver = Driver {
            shared: Arc::clone(&shared),
        };
        (Self { shared }, driver)
    }

    // -- Calls ------------------------------------------------------------

    /// Calls a unary procedure with dynamic input and output.
    pub async fn call_value(
        &self,
        procedure: &str,
        input: Option<Value>,
    ) -> Result<Value, CallError> {
        let (tx, rx) = oneshot::channel();
        let nonce = self.next_nonce();
        {
            let mut tables = self.shared.tables();
            tables.ensure_open()?;
            tables.unary.insert(nonce, tx);
        }
        tracing::trace!(%nonce, procedure, "calling");

        let frame = Frame::Call {
            nonce,
            procedure: procedure.to_string(),
            input,
        };
        if let Err(e) = self.send_frame(&frame).await {
            // If the entry is gone, a replacement or close already
            // answered the call; report that instead.
            if self.shared.tables().unary.remove(&nonce).is_some() {
                return Err(e);
            }
        }

        rx.await.unwrap_or(Err(CallError::Closed))
    }

    /// Calls a unary procedure, serializing `input` and deserializing the
    /// result.
    pub async fn call<I, O>(
        &self,
        procedure: &str,
        input: &I,
    ) -> Result<O, CallError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let input = serde_json::to_value(input).map_err(ProtocolError::Encode)?;
        let output = self.call_value(procedure, Some(input)).await?;
        serde_json::from_value(output)
            .map_err(|e| CallError::Protocol(ProtocolError::Decode(e)))
    }

    /// Opens a streaming call with dynamic input and output.
    pub async fn stream_value(
        &self,
        procedure: &str,
        input: Option<Value>,
    ) -> Result<CallStream<Value>, CallError> {
        let (nonce, slot) = self.open_stream(procedure, input).await?;
        Ok(CallStream::new(nonce, slot))
    }

    /// Opens a streaming call, serializing `input` and deserializing each
    /// value.
    pub async fn stream<I, O>(
        &self,
        procedure: &str,
        input: &I,
    ) -> Result<CallStream<O>, CallError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let input = serde_json::to_value(input).map_err(ProtocolError::Encode)?;
        let (nonce, slot) = self.open_stream(procedure, Some(input)).await?;
        Ok(CallStream::new(nonce, slot))
    }

    async fn open_stream(
        &self,
        procedure: &str,
        input: Option<Value>,
    ) -> Result<(Nonce, Arc<StreamSlot>), CallError> {
        let slot = Arc::new(StreamSlot::default());
        let nonce = self.next_nonce();
        {
            let mut tables = self.shared.tables();
            tables.ensure_open()?;
            tables.streams.insert(nonce, Arc::clone(&slot));
        }
        tracing::trace!(%nonce, procedure, "opening stream");

        let frame = Frame::OpenStream {
            nonce,
            procedure: procedure.to_string(),
            input,
        };
        if let Err(e) = self.send_frame(&frame).await {
            // Already failed by a replacement or close: the slot carries
            // that outcome.
            if self.shared.tables().streams.remove(&nonce).is_some() {
                return Err(e);
            }
        }
        Ok((nonce, slot))
    }

    // -- Events -----------------------------------------------------------

    /// Emits an ordered event. Resolves once the peer confirmed delivery.
    ///
    /// Events with the same name arrive at the peer's listeners in emit
    /// order; there is no ordering across names.
    pub async fn emit(
        &self,
        event: &str,
        args: Vec<Value>,
    ) -> Result<(), CallError> {
        let seq = {
            let mut tables = self.shared.tables();
            tables.ensure_open()?;
            let counter =
                tables.outbound_events.entry(event.to_string()).or_insert(0);
            let seq = *counter;
            *counter += 1;
            seq
        };
        tracing::trace!(event, seq, "emitting");

        self.send_frame(&Frame::Event {
            name: event.to_string(),
            seq,
            args,
        })
        .await
    }

    /// Registers a listener for one event name.
    ///
    /// Listeners run on the driver task, in sequence order, and should
    /// return quickly.
    pub fn on<F>(&self, event: impl Into<String>, listener: F)
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.shared
            .listeners()
            .add(event.into(), events::keep(listener));
    }

    /// Registers a listener for every event name.
    pub fn on_any<F>(&self, listener: F)
    where
        F: Fn(&str, &[Value]) + Send + Sync + 'static,
    {
        self.shared.listeners().add_any(events::keep_any(listener));
    }

    /// Delivers one event name's arguments into a channel.
    ///
    /// The listener is removed once the receiver is dropped.
    pub fn events(
        &self,
        event: impl Into<String>,
    ) -> mpsc::UnboundedReceiver<Vec<Value>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.listeners().add(
            event.into(),
            Arc::new(move |args: &[Value]| tx.send(args.to_vec()).is_ok()),
        );
        rx
    }

    // -- Responders -------------------------------------------------------

    /// Answers a unary request.
    pub async fn reply(
        &self,
        nonce: Nonce,
        success: bool,
        payload: Value,
    ) -> Result<(), CallError> {
        self.send_frame(&Frame::Reply {
            nonce,
            success,
            payload,
        })
        .await
    }

    /// Sends one value of a streaming response.
    pub async fn send_stream_data(
        &self,
        nonce: Nonce,
        index: u64,
        value: Value,
    ) -> Result<(), CallError> {
        self.send_frame(&Frame::StreamData {
            nonce,
            index,
            value,
        })
        .await
    }

    /// Ends a streaming response after `total` values.
    pub async fn send_stream_end(
        &self,
        nonce: Nonce,
        total: u64,
    ) -> Result<(), CallError> {
        self.send_frame(&Frame::StreamEnd { nonce, total }).await
    }

    /// Fails a streaming response after `total` values.
    pub async fn send_stream_fault(
        &self,
        nonce: Nonce,
        total: u64,
        reason: Value,
    ) -> Result<(), CallError> {
        self.send_frame(&Frame::StreamFault {
            nonce,
            total,
            reason,
        })
        .await
    }

    /// Answers `request` with the routing failure [`PROCEDURE_NOT_FOUND`].
    pub async fn reject_not_found(
        &self,
        request: &InboundRequest,
    ) -> Result<(), CallError> {
        tracing::debug!(
            nonce = %request.nonce,
            procedure = %request.procedure,
            kind = %request.kind,
            "procedure not found"
        );
        let reason = Value::from(PROCEDURE_NOT_FOUND);
        match request.kind {
            RequestKind::Unary => self.reply(request.nonce, false, reason).await,
            RequestKind::Streaming => {
                self.send_stream_fault(request.nonce, 0, reason).await
            }
        }
    }

    // -- Introspection and lifecycle -------------------------------------

    pub fn link_state(&self) -> LinkState {
        self.shared.tables().state
    }

    /// How many times the transport has been replaced.
    pub fn link_generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// The attached transport's connection key.
    pub fn connection_key(&self) -> Vec<u8> {
        self.shared.link().connection_key().to_vec()
    }

    /// Resolves once the connection is closed for good.
    pub async fn closed(&self) {
        let mut closed = self.shared.closed.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Closes the connection. Pending calls fail with
    /// [`CallError::Closed`] and the driver stops.
    pub async fn shutdown(&self) {
        if !self.shared.close() {
            return;
        }
        if let Err(e) = self.shared.link().close().await {
            tracing::debug!(error = %e, "error closing transport");
        }
    }

    fn next_nonce(&self) -> Nonce {
        Nonce(self.shared.next_nonce.fetch_add(1, Ordering::Relaxed))
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), CallError> {
        let bytes = frame.encode(&self.shared.codec)?;
        let link = self.shared.link();
        link.send(Qos::Confirmed, bytes).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// The receive loop of one [`Multiplexer`].
///
/// Runs until the transport closes or the multiplexer is shut down.
pub struct Driver<S: Socket, C: Codec = JsonCodec> {
    shared: Arc<Shared<S, C>>,
}

impl<S: Socket, C: Codec> Driver<S, C> {
    pub async fn run(self) {
        loop {
            let link = self.shared.link();
            match link.recv().await {
                Ok(Some(SocketEvent::Data { qos, payload })) => {
                    self.on_data(qos, &payload);
                }
                Ok(Some(SocketEvent::Replaced(next))) => {
                    self.on_replaced(next);
                }
                Ok(None) => {
                    tracing::debug!("transport closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "transport receive failed");
                    break;
                }
            }
        }
        self.shared.close();
    }

    fn multiplexer(&self) -> Multiplexer<S, C> {
        Multiplexer {
            shared: Arc::clone(&self.shared),
        }
    }

    fn on_data(&self, qos: Qos, payload: &[u8]) {
        if qos == Qos::Unconfirmed {
            tracing::debug!(len = payload.len(), "dropping unconfirmed payload");
            return;
        }

        let frame = match Frame::decode(&self.shared.codec, payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "discarding malformed message");
                return;
            }
        };

        match frame {
            Frame::Call {
                nonce,
                procedure,
                input,
            } => self.on_request(InboundRequest {
                kind: RequestKind::Unary,
                nonce,
                procedure,
                input,
            }),
            Frame::OpenStream {
                nonce,
                procedure,
                input,
            } => self.on_request(InboundRequest {
                kind: RequestKind::Streaming,
                nonce,
                procedure,
                input,
            }),
            Frame::Reply {
                nonce,
                success,
                payload,
            } => {
                let pending = self.shared.tables().unary.remove(&nonce);
                match pending {
                    Some(tx) => {
                        let outcome = if success {
                            Ok(payload)
                        } else {
                            Err(CallError::Remote(payload))
                        };
                        let _ = tx.send(outcome);
                    }
                    None => {
                        tracing::debug!(%nonce, "reply for unknown nonce");
                    }
                }
            }
            Frame::StreamData {
                nonce,
                index,
                value,
            } => {
                let slot = self.shared.tables().streams.get(&nonce).cloned();
                match slot {
                    Some(slot) => {
                        if slot.push(index, value) {
                            self.shared.tables().streams.remove(&nonce);
                        }
                    }
                    None => {
                        tracing::debug!(%nonce, index, "data for unknown stream");
                    }
                }
            }
            Frame::StreamEnd { nonce, total } => {
                self.on_terminal(nonce, Terminal::End { total });
            }
            Frame::StreamFault {
                nonce,
                total,
                reason,
            } => {
                self.on_terminal(nonce, Terminal::Fault { total, reason });
            }
            Frame::Event { name, seq, args } => self.on_event(name, seq, args),
        }
    }

    fn on_request(&self, request: InboundRequest) {
        match &self.shared.handler {
            Some(handler) => handler.handle(self.multiplexer(), request),
            None => {
                let mux = self.multiplexer();
                tokio::spawn(async move {
                    if let Err(e) = mux.reject_not_found(&request).await {
                        tracing::debug!(error = %e, "failed to reject request");
                    }
                });
            }
        }
    }

    fn on_terminal(&self, nonce: Nonce, terminal: Terminal) {
        let slot = self.shared.tables().streams.get(&nonce).cloned();
        match slot {
            Some(slot) => {
                if slot.finish(terminal) {
                    self.shared.tables().streams.remove(&nonce);
                }
            }
            None => tracing::debug!(%nonce, "terminal for unknown stream"),
        }
    }

    fn on_event(&self, name: String, seq: u64, args: Vec<Value>) {
        let ready = {
            let mut tables = self.shared.tables();
            let buffer = tables.inbound_events.entry(name.clone()).or_default();
            if !buffer.insert(seq, args) {
                tracing::debug!(event = %name, seq, "discarding duplicate event");
                return;
            }
            buffer.drain_ready()
        };
        if ready.is_empty() {
            return;
        }

        let delivery = self.shared.listeners().snapshot(&name);
        if delivery.is_empty() {
            return;
        }
        let mut dead = Vec::new();
        for args in &ready {
            dead.extend(delivery.run(&name, args));
        }
        dead.sort_unstable();
        dead.dedup();
        self.shared.listeners().prune(&name, &dead);
    }

    fn on_replaced(&self, next: S) {
        let (unary, streams) = {
            let mut tables = self.shared.tables();
            if tables.state == LinkState::Closed {
                return;
            }
            tables.state = LinkState::Replacing;
            Shared::<S, C>::take_pending(&mut tables)
        };

        // Attach the new link before failing anything, so callers that
        // retry straight away already use it.
        *self
            .shared
            .link
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        let generation =
            self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut tables = self.shared.tables();
            if tables.state == LinkState::Replacing {
                tables.state = LinkState::Attached;
            }
        }

        let failed = unary.len() + streams.len();
        for (_, tx) in unary {
            let _ = tx.send(Err(CallError::ConnectionLost));
        }
        for (_, slot) in streams {
            slot.lose(Terminal::Replaced);
        }
        tracing::info!(generation, failed, "transport replaced");
    }
}
