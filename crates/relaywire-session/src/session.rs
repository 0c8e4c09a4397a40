//! The server's handle on one connected peer.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Weak};

use relaywire_mux::{LinkState, Multiplexer};
use relaywire_protocol::{Codec, JsonCodec, Value};
use relaywire_room::IntoRooms;
use relaywire_transport::Socket;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use crate::server::ServerInner;
use crate::{BroadcastOperator, SessionError, SessionId};

pub(crate) struct SessionInner<G, L, S: Socket, C: Codec> {
    id: SessionId,
    mux: Multiplexer<S, C>,
    server: Weak<ServerInner<G, L, S, C>>,
}

/// One connection as seen by the server.
///
/// Cheap to clone; clones refer to the same connection. A session is
/// created by [`Server::process_session`](crate::Server::process_session)
/// and stays usable until its connection closes.
pub struct Session<G, L, S: Socket, C: Codec = JsonCodec> {
    inner: Arc<SessionInner<G, L, S, C>>,
}

/// A non-owning reference, held by the session's own request dispatcher.
pub(crate) struct WeakSession<G, L, S: Socket, C: Codec> {
    inner: Weak<SessionInner<G, L, S, C>>,
}

impl<G, L, S: Socket, C: Codec> WeakSession<G, L, S, C> {
    pub(crate) fn upgrade(&self) -> Option<Session<G, L, S, C>> {
        self.inner.upgrade().map(|inner| Session { inner })
    }
}

impl<G, L, S: Socket, C: Codec> Clone for Session<G, L, S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G, L, S: Socket, C: Codec> fmt::Debug for Session<G, L, S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("link", &self.inner.mux.link_state())
            .finish()
    }
}

impl<G, L, S: Socket, C: Codec> Session<G, L, S, C> {
    pub(crate) fn new(
        id: SessionId,
        mux: Multiplexer<S, C>,
        server: Weak<ServerInner<G, L, S, C>>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner { id, mux, server }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakSession<G, L, S, C> {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    /// The multiplexer carrying this session's connection.
    pub fn multiplexer(&self) -> &Multiplexer<S, C> {
        &self.inner.mux
    }

    /// Resolves once the connection has closed for good.
    pub async fn closed(&self) {
        self.inner.mux.closed().await;
    }

    // -- Events -----------------------------------------------------------

    /// Emits an ordered event to this session's peer.
    pub async fn emit(
        &self,
        event: &str,
        args: Vec<Value>,
    ) -> Result<(), SessionError> {
        self.inner.mux.emit(event, args).await?;
        Ok(())
    }

    /// Listens for one event name from this session's peer.
    pub fn on<F>(&self, event: impl Into<String>, listener: F)
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.inner.mux.on(event, listener);
    }

    /// Delivers one event name's arguments from this peer into a channel.
    pub fn events(
        &self,
        event: impl Into<String>,
    ) -> mpsc::UnboundedReceiver<Vec<Value>> {
        self.inner.mux.events(event)
    }

    // -- Rooms ------------------------------------------------------------

    /// Joins one or more rooms. Returns how many were newly joined.
    pub fn join(&self, rooms: impl IntoRooms) -> Result<usize, SessionError> {
        let server = self.server_for_rooms()?;
        let joined = server.registry().rooms.join(&self.inner.id, rooms);
        Ok(joined)
    }

    /// Leaves one or more rooms. Returns how many were actually left.
    pub fn leave(&self, rooms: impl IntoRooms) -> Result<usize, SessionError> {
        let server = self.server_for_rooms()?;
        let left = server.registry().rooms.leave(&self.inner.id, rooms);
        Ok(left)
    }

    /// Leaves every room, including the one named after the session's id.
    pub fn leave_all(&self) -> Result<BTreeSet<String>, SessionError> {
        let server = self.server_for_rooms()?;
        let left = server.registry().rooms.leave_all(&self.inner.id);
        Ok(left)
    }

    /// The rooms this session is in, sorted by name.
    pub fn rooms(&self) -> BTreeSet<String> {
        match self.inner.server.upgrade() {
            Some(server) => server.registry().rooms.rooms_of(&self.inner.id),
            None => BTreeSet::new(),
        }
    }

    /// Targets everyone in `rooms` except this session.
    pub fn to(&self, rooms: impl IntoRooms) -> BroadcastOperator<G, L, S, C> {
        BroadcastOperator::new(Weak::clone(&self.inner.server), rooms)
            .except(self.inner.id.clone())
    }

    fn server_for_rooms(
        &self,
    ) -> Result<Arc<ServerInner<G, L, S, C>>, SessionError> {
        if self.inner.mux.link_state() == LinkState::Closed {
            return Err(SessionError::Closed(self.inner.id.clone()));
        }
        self.inner.server.upgrade().ok_or(SessionError::ServerGone)
    }
}

impl<G, L, S, C> Session<G, L, S, C>
where
    L: Default,
    S: Socket,
    C: Codec,
{
    /// This session's private state, created on first use.
    pub fn local_state(&self) -> Result<Arc<AsyncMutex<L>>, SessionError> {
        let server = self.inner.server.upgrade().ok_or(SessionError::ServerGone)?;
        Ok(server.local_state(&self.inner.id))
    }
}
