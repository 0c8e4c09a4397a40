//! Routes inbound requests of one session to the server's procedures.

use std::sync::{Arc, OnceLock, Weak};

use futures_util::StreamExt;
use relaywire_mux::{InboundRequest, Multiplexer, RequestHandler, RequestKind};
use relaywire_procedure::{Procedure, ProcedureKind, StandardFn, StreamingFn};
use relaywire_protocol::{Codec, Nonce, Value};
use relaywire_transport::Socket;

use crate::server::ServerInner;
use crate::session::WeakSession;
use crate::{Context, Session};

/// The [`RequestHandler`] attached to every server-side multiplexer.
pub(crate) struct Dispatcher<G, L, S: Socket, C: Codec> {
    server: Weak<ServerInner<G, L, S, C>>,
    /// Set right after the session is built, before its driver starts.
    session: OnceLock<WeakSession<G, L, S, C>>,
}

impl<G, L, S: Socket, C: Codec> Dispatcher<G, L, S, C> {
    pub(crate) fn new(server: Weak<ServerInner<G, L, S, C>>) -> Self {
        Self {
            server,
            session: OnceLock::new(),
        }
    }

    pub(crate) fn attach(&self, session: &Session<G, L, S, C>) {
        if self.session.set(session.downgrade()).is_err() {
            tracing::warn!(session = %session.id(), "dispatcher already attached");
        }
    }
}

impl<G, L, S, C> RequestHandler<S, C> for Dispatcher<G, L, S, C>
where
    G: Send + 'static,
    L: Default + Send + 'static,
    S: Socket,
    C: Codec,
{
    fn handle(&self, mux: Multiplexer<S, C>, request: InboundRequest) {
        let target = self
            .server
            .upgrade()
            .zip(self.session.get().and_then(WeakSession::upgrade));
        let Some((server, session)) = target else {
            reject(mux, request);
            return;
        };

        let procedure = server
            .procedures
            .get(&request.procedure)
            .filter(|procedure| accepts(procedure.kind(), request.kind))
            .cloned();
        let Some(procedure) = procedure else {
            reject(mux, request);
            return;
        };

        let ctx = Context {
            global: Arc::clone(&server.global),
            local: server.local_state(session.id()),
            session,
        };
        drop(server);

        tracing::debug!(
            session = %ctx.session.id(),
            nonce = %request.nonce,
            procedure = %request.procedure,
            kind = %request.kind,
            "executing procedure"
        );
        let InboundRequest { nonce, input, .. } = request;
        match procedure {
            Procedure::Standard(resolver) => {
                tokio::spawn(run_standard(mux, nonce, resolver, ctx, input));
            }
            Procedure::Streaming { resolver, burst } => {
                tokio::spawn(run_streaming(
                    mux, nonce, resolver, burst, ctx, input,
                ));
            }
        }
    }
}

fn accepts(procedure: ProcedureKind, request: RequestKind) -> bool {
    matches!(
        (procedure, request),
        (ProcedureKind::Standard, RequestKind::Unary)
            | (ProcedureKind::Streaming, RequestKind::Streaming)
    )
}

fn reject<S: Socket, C: Codec>(mux: Multiplexer<S, C>, request: InboundRequest) {
    tokio::spawn(async move {
        if let Err(e) = mux.reject_not_found(&request).await {
            tracing::debug!(error = %e, "failed to reject request");
        }
    });
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

async fn run_standard<Ctx, S: Socket, C: Codec>(
    mux: Multiplexer<S, C>,
    nonce: Nonce,
    resolver: Arc<StandardFn<Ctx>>,
    ctx: Ctx,
    input: Option<Value>,
) {
    let (success, payload) = match resolver(ctx, input).await {
        Ok(value) => (true, value),
        Err(e) => {
            tracing::debug!(%nonce, error = %e, "procedure failed");
            (false, Value::String(e.to_string()))
        }
    };
    if let Err(e) = mux.reply(nonce, success, payload).await {
        tracing::debug!(%nonce, error = %e, "failed to send reply");
    }
}

/// Pulls the resolver's stream and forwards every value.
///
/// Without `burst`, the next value is only pulled once the previous data
/// frame has been confirmed by the peer. With `burst`, each frame is sent
/// from its own task and the peer puts them back in order.
async fn run_streaming<Ctx, S: Socket, C: Codec>(
    mux: Multiplexer<S, C>,
    nonce: Nonce,
    resolver: Arc<StreamingFn<Ctx>>,
    burst: bool,
    ctx: Ctx,
    input: Option<Value>,
) {
    let mut values = match resolver(ctx, input) {
        Ok(values) => values,
        Err(e) => {
            fault(&mux, nonce, 0, e.to_string()).await;
            return;
        }
    };

    let mut sent = 0u64;
    while let Some(item) = values.next().await {
        let value = match item {
            Ok(value) => value,
            Err(e) => {
                fault(&mux, nonce, sent, e.to_string()).await;
                return;
            }
        };

        let index = sent;
        sent += 1;
        if burst {
            let mux = mux.clone();
            tokio::spawn(async move {
                if let Err(e) = mux.send_stream_data(nonce, index, value).await {
                    tracing::debug!(%nonce, index, error = %e, "failed to send stream data");
                }
            });
        } else if let Err(e) = mux.send_stream_data(nonce, index, value).await {
            tracing::debug!(%nonce, index, error = %e, "stream aborted");
            return;
        }
    }

    tracing::trace!(%nonce, total = sent, "stream finished");
    if let Err(e) = mux.send_stream_end(nonce, sent).await {
        tracing::debug!(%nonce, error = %e, "failed to send stream end");
    }
}

async fn fault<S: Socket, C: Codec>(
    mux: &Multiplexer<S, C>,
    nonce: Nonce,
    total: u64,
    reason: String,
) {
    tracing::debug!(%nonce, total, %reason, "stream failed");
    if let Err(e) = mux.send_stream_fault(nonce, total, Value::String(reason)).await {
        tracing::debug!(%nonce, error = %e, "failed to send stream fault");
    }
}
