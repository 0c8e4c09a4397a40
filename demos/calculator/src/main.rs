use std::time::Duration;

use futures_util::stream;
use relaywire::prelude::*;
use serde::Deserialize;
use serde_json::json;

// ---------------------------------------------------------------------------
// State and procedures
// ---------------------------------------------------------------------------

/// Shared by every session.
#[derive(Default)]
struct Totals {
    calculations: u64,
}

/// One per session.
#[derive(Default)]
struct Memory {
    last: Option<f64>,
}

type Ctx = Context<Totals, Memory, ServerSocket>;
type Calculator = Server<Totals, Memory, ServerSocket>;

#[derive(Deserialize)]
struct Operands {
    a: f64,
    b: f64,
}

#[derive(Deserialize)]
struct Division {
    dividend: f64,
    divisor: f64,
}

async fn remember(ctx: &Ctx, result: f64) {
    ctx.local.lock().await.last = Some(result);
    let calculations = {
        let mut totals = ctx.global.lock().await;
        totals.calculations += 1;
        totals.calculations
    };
    ctx.session
        .to("audit")
        .emit("calculated", vec![json!(ctx.session.id().as_str()), json!(result)])
        .await;
    tracing::debug!(calculations, result, "calculation done");
}

fn calculator() -> Calculator {
    let add = input(Json::<Operands>::new()).resolve(|ctx: Ctx, Operands { a, b }| async move {
        let sum = a + b;
        remember(&ctx, sum).await;
        Ok::<_, String>(sum)
    });

    let divide = input(parser_fn(|raw: Option<Value>| -> Result<(f64, f64), ValidationError> {
        let Division { dividend, divisor } = serde_json::from_value(raw.unwrap_or(Value::Null))
            .map_err(|e| ValidationError::new(e.to_string()))?;
        if divisor == 0.0 {
            return Err(ValidationError::new("divisor must not be zero"));
        }
        Ok((dividend, divisor))
    }))
    .resolve(|ctx: Ctx, (dividend, divisor): (f64, f64)| async move {
        let quotient = dividend / divisor;
        remember(&ctx, quotient).await;
        Ok::<_, String>(quotient)
    });

    let recall = input(NoInput).resolve(|ctx: Ctx, ()| async move {
        ctx.local
            .lock()
            .await
            .last
            .ok_or_else(|| "nothing calculated yet".to_string())
    });

    let counter = input(Json::<u64>::new()).stream_resolve(
        |_ctx: Ctx, to: u64| {
            stream::unfold(0u64, move |i| async move {
                if i >= to {
                    return None;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
                Some((Ok::<_, String>(i), i + 1))
            })
        },
        false,
    );

    Calculator::builder(Totals::default())
        .procedure("add", add)
        .procedure("divide", divide)
        .procedure("recall", recall)
        .procedure("counter", counter)
        .build()
}

// ---------------------------------------------------------------------------
// Client walkthrough
// ---------------------------------------------------------------------------

async fn walkthrough(url: &str) -> Result<(), RelaywireError> {
    let client = connect(url).await?;

    let sum: f64 = client.call("add", &json!({ "a": 2, "b": 3 })).await?;
    tracing::info!(sum, "add");

    match client.call::<_, f64>("divide", &json!({ "dividend": 1, "divisor": 0 })).await {
        Ok(quotient) => tracing::info!(quotient, "divide"),
        Err(e) => tracing::info!(error = %e, "divide refused"),
    }

    let last: f64 = client.call("recall", &()).await?;
    tracing::info!(last, "recall");

    let mut counter = client.stream::<_, u64>("counter", &5).await?;
    while let Some(value) = counter.next().await {
        let value = value?;
        tracing::info!(value, "counter");
    }

    client.emit("note", vec![json!("walkthrough done")]).await?;
    client.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let addr = std::env::var("RELAYWIRE_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let listener = WebSocketListener::bind(&addr).await?;
    let url = format!("ws://{}", listener.local_addr()?);

    let server = calculator();
    server.on_session(|session| {
        if let Err(e) = session.join("audit") {
            tracing::warn!(error = %e, "could not join audit room");
        }
    });
    server.on("note", |from: &SessionId, args: &[Value]| {
        tracing::info!(session = %from, ?args, "note");
    });

    let serving = tokio::spawn(serve_with_shutdown(listener, server, async {
        let _ = tokio::signal::ctrl_c().await;
    }));

    if let Err(e) = walkthrough(&url).await {
        tracing::error!(error = %e, "walkthrough failed");
    }

    tracing::info!(%url, "serving; press Ctrl-C to stop");
    serving.await??;
    Ok(())
}
