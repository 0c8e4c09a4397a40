//! Room-targeted event fan-out.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Weak;

use futures_util::future::join_all;
use relaywire_protocol::{Codec, JsonCodec, Value};
use relaywire_room::IntoRooms;
use relaywire_transport::Socket;

use crate::server::ServerInner;
use crate::{Session, SessionId};

/// A set of target rooms plus a set of excluded sessions.
///
/// Built by [`Server::to`](crate::Server::to) and
/// [`Session::to`](crate::Session::to); chain [`to`](Self::to) to add
/// rooms. Membership is resolved when [`emit`](Self::emit) is called, not
/// when the operator is built.
pub struct BroadcastOperator<G, L, S: Socket, C: Codec = JsonCodec> {
    server: Weak<ServerInner<G, L, S, C>>,
    rooms: BTreeSet<String>,
    exclude: HashSet<SessionId>,
}

impl<G, L, S: Socket, C: Codec> Clone for BroadcastOperator<G, L, S, C> {
    fn clone(&self) -> Self {
        Self {
            server: Weak::clone(&self.server),
            rooms: self.rooms.clone(),
            exclude: self.exclude.clone(),
        }
    }
}

impl<G, L, S: Socket, C: Codec> fmt::Debug for BroadcastOperator<G, L, S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastOperator")
            .field("rooms", &self.rooms)
            .field("exclude", &self.exclude.len())
            .finish()
    }
}

impl<G, L, S: Socket, C: Codec> BroadcastOperator<G, L, S, C> {
    pub(crate) fn new(
        server: Weak<ServerInner<G, L, S, C>>,
        rooms: impl IntoRooms,
    ) -> Self {
        Self {
            server,
            rooms: rooms.into_rooms().into_iter().collect(),
            exclude: HashSet::new(),
        }
    }

    /// A new operator that also targets `rooms`. Exclusions are kept.
    pub fn to(&self, rooms: impl IntoRooms) -> Self {
        let mut next = self.clone();
        next.rooms.extend(rooms.into_rooms());
        next
    }

    /// A new operator that skips `id` even if it is in a target room.
    pub fn except(mut self, id: SessionId) -> Self {
        self.exclude.insert(id);
        self
    }

    /// Target rooms, sorted.
    pub fn rooms(&self) -> impl Iterator<Item = &str> {
        self.rooms.iter().map(String::as_str)
    }

    /// The sessions an emit would reach right now.
    pub fn recipients(&self) -> Vec<Session<G, L, S, C>> {
        match self.server.upgrade() {
            Some(server) => {
                server.members_of(self.rooms.iter().map(String::as_str), &self.exclude)
            }
            None => Vec::new(),
        }
    }

    /// Emits to every current member of the target rooms, concurrently.
    ///
    /// Each recipient numbers the event with its own sequence. A failure
    /// for one recipient is logged and does not affect the others.
    /// Returns how many recipients accepted the event.
    pub async fn emit(&self, event: &str, args: Vec<Value>) -> usize {
        let recipients = self.recipients();
        emit_all(&recipients, event, args).await
    }
}

pub(crate) async fn emit_all<G, L, S: Socket, C: Codec>(
    sessions: &[Session<G, L, S, C>],
    event: &str,
    args: Vec<Value>,
) -> usize {
    let sends = sessions.iter().map(|session| {
        let args = args.clone();
        async move { (session, session.emit(event, args).await) }
    });

    let mut delivered = 0;
    for (session, result) in join_all(sends).await {
        match result {
            Ok(()) => delivered += 1,
            Err(e) => {
                tracing::warn!(session = %session.id(), %event, error = %e, "broadcast emit failed");
            }
        }
    }
    tracing::trace!(%event, delivered, targeted = sessions.len(), "broadcast");
    delivered
}
