//! The session manager: procedure table, state, registry, and rooms.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use relaywire_mux::{Multiplexer, RequestHandler};
use relaywire_procedure::{Procedure, ProcedureTable};
use relaywire_protocol::{Codec, JsonCodec, Value};
use relaywire_room::{IntoRooms, RoomTable};
use relaywire_transport::Socket;
use tokio::sync::Mutex as AsyncMutex;

use crate::broadcast::{self, BroadcastOperator};
use crate::dispatch::Dispatcher;
use crate::{Context, Session, SessionId};

/// Event name reserved for session announcements. Peers' events with this
/// name still reach session listeners but not server listeners.
pub const SESSION_EVENT: &str = "session";

type SessionObserver<G, L, S, C> =
    Arc<dyn Fn(&Session<G, L, S, C>) + Send + Sync>;
type EventObserver = Arc<dyn Fn(&SessionId, &[Value]) + Send + Sync>;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Everything keyed by session id. One lock, never held across an await.
pub(crate) struct Registry<G, L, S: Socket, C: Codec> {
    pub(crate) sessions: HashMap<SessionId, Session<G, L, S, C>>,
    pub(crate) local: HashMap<SessionId, Arc<AsyncMutex<L>>>,
    pub(crate) rooms: RoomTable<SessionId>,
}

pub(crate) struct ServerInner<G, L, S: Socket, C: Codec> {
    pub(crate) procedures: ProcedureTable<Context<G, L, S, C>>,
    pub(crate) codec: C,
    pub(crate) global: Arc<AsyncMutex<G>>,
    registry: Mutex<Registry<G, L, S, C>>,
    observers: Mutex<Vec<SessionObserver<G, L, S, C>>>,
    listeners: Mutex<Vec<(String, EventObserver)>>,
}

impl<G, L, S: Socket, C: Codec> ServerInner<G, L, S, C> {
    pub(crate) fn registry(&self) -> MutexGuard<'_, Registry<G, L, S, C>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live sessions in any of `rooms`, minus `exclude`.
    pub(crate) fn members_of<'a>(
        &self,
        rooms: impl IntoIterator<Item = &'a str>,
        exclude: &std::collections::HashSet<SessionId>,
    ) -> Vec<Session<G, L, S, C>> {
        let registry = self.registry();
        registry
            .rooms
            .union_members(rooms, exclude)
            .into_iter()
            .filter_map(|id| registry.sessions.get(&id).cloned())
            .collect()
    }

    /// Hands an event from session `from` to the server-level listeners.
    fn deliver_event(&self, from: &SessionId, event: &str, args: &[Value]) {
        if event == SESSION_EVENT {
            return;
        }
        let listeners: Vec<EventObserver> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(from, args);
        }
    }
}

impl<G, L: Default, S: Socket, C: Codec> ServerInner<G, L, S, C> {
    /// The private state for `id`, created if absent.
    pub(crate) fn local_state(&self, id: &SessionId) -> Arc<AsyncMutex<L>> {
        let mut registry = self.registry();
        let state = registry
            .local
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(L::default())));
        Arc::clone(state)
    }
}

// ---------------------------------------------------------------------------
// ServerBuilder
// ---------------------------------------------------------------------------

/// Builder for a [`Server`].
///
/// ```rust,ignore
/// let server = Server::<Counter, (), WebSocketSocket<_>>::builder(Counter::default())
///     .procedure("add", add)
///     .procedure("counter", counter)
///     .build();
/// ```
pub struct ServerBuilder<G, L, S: Socket, C: Codec = JsonCodec> {
    global: G,
    codec: C,
    procedures: ProcedureTable<Context<G, L, S, C>>,
}

impl<G, L, S, C> ServerBuilder<G, L, S, C>
where
    G: Send + 'static,
    L: Default + Send + 'static,
    S: Socket,
    C: Codec,
{
    /// Registers one procedure. A later definition replaces an earlier
    /// one with the same name.
    pub fn procedure(
        mut self,
        name: impl Into<String>,
        procedure: Procedure<Context<G, L, S, C>>,
    ) -> Self {
        self.procedures.insert(name, procedure);
        self
    }

    /// Registers every procedure of `table`.
    pub fn procedures(mut self, table: ProcedureTable<Context<G, L, S, C>>) -> Self {
        self.procedures.extend(table);
        self
    }

    pub fn build(self) -> Server<G, L, S, C> {
        tracing::debug!(procedures = ?self.procedures.names(), "server built");
        Server {
            inner: Arc::new(ServerInner {
                procedures: self.procedures,
                codec: self.codec,
                global: Arc::new(AsyncMutex::new(self.global)),
                registry: Mutex::new(Registry {
                    sessions: HashMap::new(),
                    local: HashMap::new(),
                    rooms: RoomTable::new(),
                }),
                observers: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A relaywire server.
///
/// Owns the procedure table, the global state `G`, one private state `L`
/// per session identity, and the room table. Sockets are handed to it
/// with [`process_session`](Self::process_session) by whatever accepts
/// them (see `relaywire::serve`). Cloning is cheap.
pub struct Server<G, L, S: Socket, C: Codec = JsonCodec> {
    inner: Arc<ServerInner<G, L, S, C>>,
}

impl<G, L, S: Socket, C: Codec> Clone for Server<G, L, S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G, L, S: Socket, C: Codec> fmt::Debug for Server<G, L, S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.registry();
        f.debug_struct("Server")
            .field("procedures", &self.inner.procedures.names())
            .field("sessions", &registry.sessions.len())
            .field("rooms", &registry.rooms.room_count())
            .finish()
    }
}

impl<G, L, S> Server<G, L, S, JsonCodec>
where
    G: Send + 'static,
    L: Default + Send + 'static,
    S: Socket,
{
    /// Starts a server definition with the JSON codec.
    pub fn builder(global: G) -> ServerBuilder<G, L, S, JsonCodec> {
        Self::builder_with_codec(global, JsonCodec)
    }
}

impl<G, L, S, C> Server<G, L, S, C>
where
    G: Send + 'static,
    L: Default + Send + 'static,
    S: Socket,
    C: Codec,
{
    /// Starts a server definition with a custom codec.
    pub fn builder_with_codec(global: G, codec: C) -> ServerBuilder<G, L, S, C> {
        ServerBuilder {
            global,
            codec,
            procedures: ProcedureTable::new(),
        }
    }

    /// Takes ownership of an accepted socket and starts serving it.
    ///
    /// The session joins the room named after its id and is announced to
    /// [`on_session`](Self::on_session) observers before its first message
    /// is read. If a session with the same id is already registered it is
    /// replaced; private state and rooms carry over.
    ///
    /// Must be called within a Tokio runtime.
    pub fn process_session(&self, socket: S) -> Session<G, L, S, C> {
        let id = SessionId::from_connection_key(socket.connection_key());
        let dispatcher = Arc::new(Dispatcher::new(Arc::downgrade(&self.inner)));
        let handler: Arc<dyn RequestHandler<S, C>> = dispatcher.clone();
        let (mux, driver) =
            Multiplexer::with_handler(socket, self.inner.codec.clone(), handler);
        let session = Session::new(id.clone(), mux, Arc::downgrade(&self.inner));
        dispatcher.attach(&session);

        let server = Arc::downgrade(&self.inner);
        let from = id.clone();
        session
            .multiplexer()
            .on_any(move |event: &str, args: &[Value]| {
                if let Some(server) = server.upgrade() {
                    server.deliver_event(&from, event, args);
                }
            });

        self.inner.registry().rooms.join(&id, id.as_str());

        let observers: Vec<SessionObserver<G, L, S, C>> = self
            .inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer(&session);
        }

        let previous = self
            .inner
            .registry()
            .sessions
            .insert(id.clone(), session.clone());
        if previous.is_some() {
            tracing::info!(session = %id, "session replaced by a new connection");
        } else {
            tracing::info!(session = %id, "session started");
        }

        tokio::spawn(driver.run());
        session
    }

    /// Forgets `session`: leaves every room, drops its private state, and
    /// closes its connection.
    ///
    /// Does nothing and returns `false` unless `session` is the one
    /// currently registered under its id.
    pub async fn remove_session(&self, session: &Session<G, L, S, C>) -> bool {
        {
            let mut registry = self.inner.registry();
            let current = registry
                .sessions
                .get(session.id())
                .is_some_and(|registered| registered.ptr_eq(session));
            if !current {
                tracing::debug!(
                    session = %session.id(),
                    "not removing a session that is no longer registered"
                );
                return false;
            }
            registry.sessions.remove(session.id());
            registry.local.remove(session.id());
            registry.rooms.leave_all(session.id());
        }

        session.multiplexer().shutdown().await;
        tracing::info!(session = %session.id(), "session removed");
        true
    }

    // -- Observers --------------------------------------------------------

    /// Calls `observer` with every new session, before it starts serving.
    pub fn on_session<F>(&self, observer: F)
    where
        F: Fn(&Session<G, L, S, C>) + Send + Sync + 'static,
    {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    /// Calls `listener` for every `event` arriving from any session.
    ///
    /// The reserved name [`SESSION_EVENT`] is never delivered here.
    pub fn on<F>(&self, event: impl Into<String>, listener: F)
    where
        F: Fn(&SessionId, &[Value]) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((event.into(), Arc::new(listener)));
    }

    // -- Broadcast --------------------------------------------------------

    /// Emits an event to every live session. Returns how many accepted it.
    pub async fn emit(&self, event: &str, args: Vec<Value>) -> usize {
        let sessions = self.sessions();
        broadcast::emit_all(&sessions, event, args).await
    }

    /// Targets everyone in `rooms`.
    pub fn to(&self, rooms: impl IntoRooms) -> BroadcastOperator<G, L, S, C> {
        BroadcastOperator::new(Arc::downgrade(&self.inner), rooms)
    }

    // -- Introspection ----------------------------------------------------

    pub fn session(&self, id: &SessionId) -> Option<Session<G, L, S, C>> {
        self.inner.registry().sessions.get(id).cloned()
    }

    pub fn sessions(&self) -> Vec<Session<G, L, S, C>> {
        self.inner.registry().sessions.values().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.inner.registry().sessions.len()
    }

    /// Ids of everyone in `room`. Unknown rooms are empty.
    pub fn room_members(&self, room: &str) -> Vec<SessionId> {
        self.inner.registry().rooms.members(room)
    }

    pub fn room_names(&self) -> Vec<String> {
        self.inner.registry().rooms.room_names()
    }

    /// The state shared by every session.
    pub fn global_state(&self) -> Arc<AsyncMutex<G>> {
        Arc::clone(&self.inner.global)
    }

    /// Private state of `id`, if it has been created.
    pub fn local_state(&self, id: &SessionId) -> Option<Arc<AsyncMutex<L>>> {
        self.inner.registry().local.get(id).cloned()
    }

    /// Registered procedure names, sorted.
    pub fn procedure_names(&self) -> Vec<String> {
        self.inner
            .procedures
            .names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }
}
