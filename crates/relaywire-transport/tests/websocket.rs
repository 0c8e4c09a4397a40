//! Integration tests for the WebSocket transport.
//!
//! These tests spin up a real listener on an OS-assigned port and connect
//! to it, once with a raw tokio-tungstenite client to pin the wire framing
//! and once with [`WebSocketSocket`] on both ends.

#[cfg(feature = "websocket")]
mod websocket {
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;

    use relaywire_transport::{
        Listener, Qos, Socket, SocketEvent, TransportError, WebSocketListener,
        WebSocketSocket,
    };
    use tokio_tungstenite::tungstenite::Message;

    async fn bind() -> (WebSocketListener, String) {
        let listener = WebSocketListener::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = listener.local_addr().expect("should have an address");
        (listener, format!("ws://{addr}"))
    }

    #[tokio::test]
    async fn test_raw_client_sees_qos_prefix() {
        let (mut listener, url) = bind().await;

        let server_handle = tokio::spawn(async move {
            listener.accept().await.expect("should accept")
        });

        let (mut client_ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("client should connect");
        client_ws
            .send(Message::Binary(b"raw-key".to_vec().into()))
            .await
            .unwrap();

        let server = server_handle.await.expect("task should complete");
        assert_eq!(server.connection_key(), b"raw-key");

        // --- Server sends, client receives ---
        server
            .send(Qos::Confirmed, b"hello".to_vec())
            .await
            .expect("send should succeed");
        let msg = client_ws.next().await.unwrap().unwrap();
        assert_eq!(msg.into_data().as_ref(), b"\x01hello");

        // --- Client sends, server receives ---
        client_ws
            .send(Message::Binary(b"\x00from client".to_vec().into()))
            .await
            .unwrap();
        match server.recv().await.expect("recv should succeed") {
            Some(SocketEvent::Data { qos, payload }) => {
                assert_eq!(qos, Qos::Unconfirmed);
                assert_eq!(payload, b"from client");
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_socket_to_socket_round_trip() {
        let (mut listener, url) = bind().await;

        let server_handle = tokio::spawn(async move {
            listener.accept().await.expect("should accept")
        });
        let client = WebSocketSocket::connect_with_key(&url, vec![7; 4])
            .await
            .expect("client should connect");
        let server = server_handle.await.unwrap();

        assert_eq!(server.connection_key(), &[7, 7, 7, 7]);

        client.send(Qos::Confirmed, b"ping".to_vec()).await.unwrap();
        match server.recv().await.unwrap() {
            Some(SocketEvent::Data { qos, payload }) => {
                assert_eq!(qos, Qos::Confirmed);
                assert_eq!(payload, b"ping");
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generated_keys_differ() {
        let (mut listener, url) = bind().await;

        let accept = tokio::spawn(async move {
            let a = listener.accept().await.expect("first accept");
            let b = listener.accept().await.expect("second accept");
            (a, b)
        });
        let _c1 = WebSocketSocket::connect(&url).await.unwrap();
        let _c2 = WebSocketSocket::connect(&url).await.unwrap();
        let (a, b) = accept.await.unwrap();

        assert_eq!(a.connection_key().len(), 32);
        assert_ne!(a.connection_key(), b.connection_key());
    }

    #[tokio::test]
    async fn test_recv_returns_none_on_client_close() {
        let (mut listener, url) = bind().await;

        let server_handle = tokio::spawn(async move {
            listener.accept().await.expect("should accept")
        });
        let client = WebSocketSocket::connect(&url).await.unwrap();
        let server = server_handle.await.unwrap();

        client.close().await.expect("close should succeed");

        let result = server.recv().await.expect("recv should not error");
        assert!(result.is_none(), "should return None on client close");
    }

    #[tokio::test]
    async fn test_silent_client_does_not_block_accept() {
        let (listener, url) = bind().await;
        let mut listener =
            listener.with_handshake_timeout(Duration::from_millis(200));

        let accept = tokio::spawn(async move {
            let first = listener.accept().await;
            let second = listener.accept().await;
            (first, second)
        });

        // Upgrades but never sends its connection key.
        let (_silent, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("raw client should connect");
        let _client = WebSocketSocket::connect_with_key(&url, vec![9; 3])
            .await
            .expect("client should connect");

        let (first, second) =
            tokio::time::timeout(Duration::from_secs(2), accept)
                .await
                .expect("accept should not hang")
                .unwrap();
        let first = first.expect("keyed client should be accepted first");
        assert_eq!(first.connection_key(), &[9, 9, 9]);
        assert!(format!("{first:?}").contains("key_len: 3"));
        assert!(matches!(second, Err(TransportError::AcceptFailed(_))));
    }
}
