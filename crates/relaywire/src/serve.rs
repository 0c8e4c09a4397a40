//! Accept loop and client connection helpers.

use std::future::Future;

use relaywire_protocol::Codec;
use relaywire_session::Server;
use relaywire_transport::Listener;

use crate::RelaywireError;

/// Serves every socket `listener` accepts, forever.
///
/// Each socket becomes a session of `server`; when its connection closes
/// the session is removed again. Accept failures are logged and the loop
/// carries on.
pub async fn serve<Li, G, L, C>(
    listener: Li,
    server: Server<G, L, Li::Socket, C>,
) -> Result<(), RelaywireError>
where
    Li: Listener,
    G: Send + 'static,
    L: Default + Send + 'static,
    C: Codec,
{
    serve_with_shutdown(listener, server, std::future::pending()).await
}

/// Like [`serve`], but stops accepting once `shutdown` resolves.
///
/// Sessions already running are left alone.
pub async fn serve_with_shutdown<Li, G, L, C, F>(
    mut listener: Li,
    server: Server<G, L, Li::Socket, C>,
    shutdown: F,
) -> Result<(), RelaywireError>
where
    Li: Listener,
    G: Send + 'static,
    L: Default + Send + 'static,
    C: Codec,
    F: Future<Output = ()>,
{
    tracing::info!("relaywire server running");
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                tracing::info!("relaywire server stopped accepting");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(socket) => {
                    let session = server.process_session(socket);
                    let server = server.clone();
                    tokio::spawn(async move {
                        session.closed().await;
                        server.remove_session(&session).await;
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            },
        }
    }
}

/// Connects to a relaywire server over WebSocket and starts the
/// multiplexer's driver.
#[cfg(feature = "websocket")]
pub async fn connect(
    url: &str,
) -> Result<relaywire_mux::Multiplexer<relaywire_transport::ClientSocket>, RelaywireError>
{
    let socket = relaywire_transport::ClientSocket::connect(url).await?;
    Ok(relaywire_mux::Multiplexer::connect(
        socket,
        relaywire_protocol::JsonCodec,
    ))
}

/// Like [`connect`], presenting `key` so a reconnect lands on the same
/// server session.
#[cfg(feature = "websocket")]
pub async fn connect_with_key(
    url: &str,
    key: Vec<u8>,
) -> Result<relaywire_mux::Multiplexer<relaywire_transport::ClientSocket>, RelaywireError>
{
    let socket =
        relaywire_transport::ClientSocket::connect_with_key(url, key).await?;
    Ok(relaywire_mux::Multiplexer::connect(
        socket,
        relaywire_protocol::JsonCodec,
    ))
}
