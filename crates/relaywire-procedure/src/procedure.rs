//! Procedure descriptors and the builder that creates them.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;

use crate::{Parser, ProcedureError};

/// Type-erased standard resolver: parses, runs, and serializes.
pub type StandardFn<Ctx> = dyn Fn(Ctx, Option<Value>) -> BoxFuture<'static, Result<Value, ProcedureError>>
    + Send
    + Sync;

/// The value sequence produced by a streaming resolver.
pub type ProcedureStream = BoxStream<'static, Result<Value, ProcedureError>>;

/// Type-erased streaming resolver.
///
/// Parsing happens when the resolver is called, so an invalid input is
/// reported before any stream exists.
pub type StreamingFn<Ctx> = dyn Fn(Ctx, Option<Value>) -> Result<ProcedureStream, ProcedureError>
    + Send
    + Sync;

/// Whether a procedure answers once or with a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcedureKind {
    Standard,
    Streaming,
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => f.write_str("standard"),
            Self::Streaming => f.write_str("streaming"),
        }
    }
}

/// An immutable procedure descriptor.
pub enum Procedure<Ctx> {
    /// Produces exactly one result.
    Standard(Arc<StandardFn<Ctx>>),

    /// Produces a finite sequence of results.
    ///
    /// With `burst` set the server sends values as fast as the resolver
    /// yields them; otherwise it waits for each value's delivery
    /// confirmation before pulling the next one.
    Streaming {
        resolver: Arc<StreamingFn<Ctx>>,
        burst: bool,
    },
}

impl<Ctx> Clone for Procedure<Ctx> {
    fn clone(&self) -> Self {
        match self {
            Self::Standard(resolver) => Self::Standard(Arc::clone(resolver)),
            Self::Streaming { resolver, burst } => Self::Streaming {
                resolver: Arc::clone(resolver),
                burst: *burst,
            },
        }
    }
}

impl<Ctx> fmt::Debug for Procedure<Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard(_) => f.write_str("Procedure::Standard"),
            Self::Streaming { burst, .. } => f
                .debug_struct("Procedure::Streaming")
                .field("burst", burst)
                .finish(),
        }
    }
}

impl<Ctx> Procedure<Ctx> {
    pub fn kind(&self) -> ProcedureKind {
        match self {
            Self::Standard(_) => ProcedureKind::Standard,
            Self::Streaming { .. } => ProcedureKind::Streaming,
        }
    }

    /// `true` only for streaming procedures defined with `burst`.
    pub fn is_burst(&self) -> bool {
        matches!(self, Self::Streaming { burst: true, .. })
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Starts a procedure definition with the given input parser.
pub fn input<P: Parser>(parser: P) -> ProcedureBuilder<P> {
    ProcedureBuilder { parser }
}

/// A parser waiting for its resolver. See [`input`].
#[derive(Debug)]
pub struct ProcedureBuilder<P> {
    parser: P,
}

impl<P: Parser> ProcedureBuilder<P> {
    /// Finishes a standard procedure.
    ///
    /// The resolver's error is relayed by its `Display` text. A panic
    /// inside the resolver is caught and relayed the same way.
    pub fn resolve<Ctx, F, Fut, O, E>(self, resolver: F) -> Procedure<Ctx>
    where
        Ctx: Send + 'static,
        F: Fn(Ctx, P::Output) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
        O: Serialize + 'static,
        E: fmt::Display + 'static,
    {
        let parser = self.parser;
        let run = move |ctx: Ctx, raw: Option<Value>| {
            let parsed = match parser.parse(raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    return future::ready(Err(ProcedureError::from(e))).boxed();
                }
            };

            let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| {
                resolver(ctx, parsed)
            })) {
                Ok(fut) => fut,
                Err(panic) => {
                    return future::ready(Err(panicked(panic))).boxed();
                }
            };

            async move {
                match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(Ok(output)) => to_value(output),
                    Ok(Err(e)) => Err(ProcedureError::Failed(e.to_string())),
                    Err(panic) => Err(panicked(panic)),
                }
            }
            .boxed()
        };
        Procedure::Standard(Arc::new(run))
    }

    /// Finishes a streaming procedure.
    ///
    /// Each `Err` item is relayed by its `Display` text. The server stops
    /// pulling at the first one and sends a fault.
    pub fn stream_resolve<Ctx, F, St, O, E>(
        self,
        resolver: F,
        burst: bool,
    ) -> Procedure<Ctx>
    where
        Ctx: Send + 'static,
        F: Fn(Ctx, P::Output) -> St + Send + Sync + 'static,
        St: Stream<Item = Result<O, E>> + Send + 'static,
        O: Serialize + 'static,
        E: fmt::Display + 'static,
    {
        let parser = self.parser;
        let open = move |ctx: Ctx,
                         raw: Option<Value>|
              -> Result<ProcedureStream, ProcedureError> {
            let parsed = parser.parse(raw)?;
            let stream = std::panic::catch_unwind(AssertUnwindSafe(|| {
                resolver(ctx, parsed)
            }))
            .map_err(panicked)?;

            let values = AssertUnwindSafe(stream).catch_unwind().map(|item| {
                match item {
                    Ok(Ok(output)) => to_value(output),
                    Ok(Err(e)) => Err(ProcedureError::Failed(e.to_string())),
                    Err(panic) => Err(panicked(panic)),
                }
            });
            Ok(values.boxed())
        };
        Procedure::Streaming {
            resolver: Arc::new(open),
            burst,
        }
    }
}

fn to_value<O: Serialize>(output: O) -> Result<Value, ProcedureError> {
    serde_json::to_value(output).map_err(|e| {
        ProcedureError::Failed(format!("failed to serialize output: {e}"))
    })
}

fn panicked(panic: Box<dyn Any + Send>) -> ProcedureError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "resolver panicked".to_string());
    tracing::error!(%message, "procedure resolver panicked");
    ProcedureError::Failed(message)
}

#[cfg(test)]
mod tests {
    use futures_util::stream;
    use serde_json::json;

    use super::*;
    use crate::{Json, NoInput, parser_fn};

    async fn run_standard(
        procedure: &Procedure<()>,
        raw: Option<Value>,
    ) -> Result<Value, ProcedureError> {
        match procedure {
            Procedure::Standard(resolver) => resolver((), raw).await,
            Procedure::Streaming { .. } => panic!("expected a standard procedure"),
        }
    }

    fn open_stream(
        procedure: &Procedure<()>,
        raw: Option<Value>,
    ) -> Result<ProcedureStream, ProcedureError> {
        match procedure {
            Procedure::Streaming { resolver, .. } => resolver((), raw),
            Procedure::Standard(_) => panic!("expected a streaming procedure"),
        }
    }

    #[tokio::test]
    async fn test_standard_resolves_serialized_output() {
        let double: Procedure<()> = input(Json::<i64>::new())
            .resolve(|_, n| async move { Ok::<_, String>(n * 2) });

        assert_eq!(double.kind(), ProcedureKind::Standard);
        assert!(!double.is_burst());
        assert_eq!(run_standard(&double, Some(json!(21))).await, Ok(json!(42)));
    }

    #[tokio::test]
    async fn test_validation_failure_skips_resolver() {
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen = Arc::clone(&called);
        let procedure: Procedure<()> = input(parser_fn(|_| {
            Err::<(), _>(crate::ValidationError::new("nope"))
        }))
        .resolve(move |_, ()| {
            seen.store(true, std::sync::atomic::Ordering::SeqCst);
            async { Ok::<_, String>(()) }
        });

        let result = run_standard(&procedure, None).await;
        assert!(matches!(result, Err(ProcedureError::Validation(_))));
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_resolver_error_relays_display_text() {
        let procedure: Procedure<()> = input(NoInput)
            .resolve(|_, ()| async { Err::<(), _>("out of coffee") });

        let err = run_standard(&procedure, None).await.unwrap_err();
        assert_eq!(err, ProcedureError::Failed("out of coffee".into()));
        assert_eq!(err.to_string(), "out of coffee");
    }

    #[tokio::test]
    async fn test_panicking_resolver_becomes_failure() {
        let procedure: Procedure<()> =
            input(NoInput).resolve(|_, ()| async {
                if true {
                    panic!("resolver blew up");
                }
                Ok::<(), String>(())
            });

        let err = run_standard(&procedure, None).await.unwrap_err();
        assert_eq!(err.to_string(), "resolver blew up");
    }

    #[tokio::test]
    async fn test_streaming_yields_values_then_failure() {
        let procedure: Procedure<()> = input(NoInput).stream_resolve(
            |_, ()| {
                stream::iter(vec![Ok(1), Ok(2), Err("broken"), Ok(3)])
            },
            true,
        );
        assert_eq!(procedure.kind(), ProcedureKind::Streaming);
        assert!(procedure.is_burst());

        let items: Vec<_> =
            open_stream(&procedure, None).unwrap().collect().await;
        assert_eq!(
            items,
            vec![
                Ok(json!(1)),
                Ok(json!(2)),
                Err(ProcedureError::Failed("broken".into())),
                Ok(json!(3)),
            ]
        );
    }

    #[test]
    fn test_streaming_validation_fails_before_opening() {
        let procedure: Procedure<()> = input(Json::<u32>::new())
            .stream_resolve(
                |_, n| stream::iter((0..n).map(Ok::<_, String>)),
                false,
            );

        assert!(matches!(
            open_stream(&procedure, Some(json!("three"))),
            Err(ProcedureError::Validation(_))
        ));
    }
}
