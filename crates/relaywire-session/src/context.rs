//! What a procedure resolver gets to work with.

use std::fmt;
use std::sync::Arc;

use relaywire_protocol::{Codec, JsonCodec};
use relaywire_transport::Socket;
use tokio::sync::Mutex as AsyncMutex;

use crate::Session;

/// The execution context handed to every procedure.
///
/// `global` is shared by every session of the server; `local` belongs to
/// the calling session and survives reconnects under the same identity.
/// Both are async mutexes because resolvers hold them across awaits.
pub struct Context<G, L, S: Socket, C: Codec = JsonCodec> {
    pub global: Arc<AsyncMutex<G>>,
    pub local: Arc<AsyncMutex<L>>,
    pub session: Session<G, L, S, C>,
}

impl<G, L, S: Socket, C: Codec> Clone for Context<G, L, S, C> {
    fn clone(&self) -> Self {
        Self {
            global: Arc::clone(&self.global),
            local: Arc::clone(&self.local),
            session: self.session.clone(),
        }
    }
}

impl<G, L, S: Socket, C: Codec> fmt::Debug for Context<G, L, S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("session", self.session.id())
            .finish_non_exhaustive()
    }
}
