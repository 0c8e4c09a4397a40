//! Integration tests for sessions, dispatch, state, and rooms, over
//! in-memory sockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream;
use relaywire_mux::{CallError, Multiplexer, PROCEDURE_NOT_FOUND};
use relaywire_procedure::{Json, NoInput, Procedure, input};
use relaywire_protocol::{Frame, JsonCodec, Nonce};
use relaywire_session::{Context, Server, Session, SessionId};
use relaywire_transport::memory::{self, MemorySocket};
use relaywire_transport::{Qos, Socket, SocketEvent};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;

// =========================================================================
// Test server
// =========================================================================

#[derive(Default)]
struct Global {
    hits: u64,
}

#[derive(Default)]
struct Local {
    calls: u64,
}

type Ctx = Context<Global, Local, MemorySocket>;
type TestServer = Server<Global, Local, MemorySocket>;
type TestSession = Session<Global, Local, MemorySocket>;

#[derive(Deserialize)]
struct Add {
    a: i64,
    b: i64,
}

fn add() -> Procedure<Ctx> {
    input(Json::<Add>::new())
        .resolve(|_ctx: Ctx, Add { a, b }| async move { Ok::<_, String>(a + b) })
}

fn counter() -> Procedure<Ctx> {
    input(Json::<u64>::new()).stream_resolve(
        |_ctx: Ctx, n: u64| stream::iter((0..n).map(Ok::<_, String>)),
        false,
    )
}

fn server() -> TestServer {
    TestServer::builder(Global::default())
        .procedure("add", add())
        .procedure("counter", counter())
        .procedure(
            "fail_after",
            input(Json::<u64>::new()).stream_resolve(
                |_ctx: Ctx, k: u64| {
                    let values = (0..k).map(Ok::<u64, &str>);
                    stream::iter(
                        values.chain(std::iter::once(Err("resolver gave up"))),
                    )
                },
                true,
            ),
        )
        .procedure(
            "hits",
            input(NoInput).resolve(|ctx: Ctx, ()| async move {
                let mut global = ctx.global.lock().await;
                global.hits += 1;
                Ok::<_, String>(global.hits)
            }),
        )
        .procedure(
            "calls",
            input(NoInput).resolve(|ctx: Ctx, ()| async move {
                let mut local = ctx.local.lock().await;
                local.calls += 1;
                Ok::<_, String>(local.calls)
            }),
        )
        .procedure(
            "whoami",
            input(NoInput).resolve(|ctx: Ctx, ()| async move {
                Ok::<_, String>(ctx.session.id().to_string())
            }),
        )
        .procedure(
            "slow",
            input(NoInput).resolve(|_ctx: Ctx, ()| async {
                std::future::pending::<()>().await;
                Ok::<_, String>(())
            }),
        )
        .procedure(
            "stall",
            input(NoInput).stream_resolve(
                |_ctx: Ctx, ()| stream::pending::<Result<u64, String>>(),
                false,
            ),
        )
        .build()
}

fn connect(
    server: &TestServer,
    key: &str,
) -> (Multiplexer<MemorySocket>, TestSession) {
    let (client, remote) = memory::pair(key);
    let session = server.process_session(remote);
    (Multiplexer::connect(client, JsonCodec), session)
}

/// A server session whose peer is a bare socket, for frame-level checks.
fn connect_raw(server: &TestServer, key: &str) -> (MemorySocket, TestSession) {
    let (raw, remote) = memory::pair(key);
    let session = server.process_session(remote);
    (raw, session)
}

async fn recv_frame(socket: &MemorySocket) -> Frame {
    match socket.recv().await.expect("recv should succeed") {
        Some(SocketEvent::Data { payload, .. }) => {
            Frame::decode(&JsonCodec, &payload).expect("valid frame")
        }
        other => panic!("expected data, got {other:?}"),
    }
}

async fn send_frame(socket: &MemorySocket, frame: Frame) {
    let bytes = frame.encode(&JsonCodec).unwrap();
    socket.send(Qos::Confirmed, bytes).await.expect("send should succeed");
}

// =========================================================================
// Dispatch
// =========================================================================

#[tokio::test]
async fn test_add_returns_sum() {
    let server = server();
    let (client, _session) = connect(&server, "alice");

    let sum: i64 = client.call("add", &json!({ "a": 2, "b": 3 })).await.unwrap();
    assert_eq!(sum, 5);
}

#[tokio::test]
async fn test_unknown_procedure_is_not_found() {
    let server = server();
    let (client, _session) = connect(&server, "alice");

    let err = client.call_value("nope", None).await.unwrap_err();
    assert_eq!(err.remote(), Some(&json!(PROCEDURE_NOT_FOUND)));
    assert_eq!(err.to_string(), "Procedure not found");
}

#[tokio::test]
async fn test_kind_mismatch_is_not_found() {
    let server = server();
    let (client, _session) = connect(&server, "alice");

    let err = client.call_value("counter", Some(json!(3))).await.unwrap_err();
    assert_eq!(err.remote(), Some(&json!(PROCEDURE_NOT_FOUND)));

    let mut stream = client.stream_value("add", None).await.unwrap();
    let err = stream.next().await.unwrap().unwrap_err();
    assert_eq!(err.remote(), Some(&json!(PROCEDURE_NOT_FOUND)));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_invalid_input_is_relayed_as_failure() {
    let server = server();
    let (client, _session) = connect(&server, "alice");

    let err = client
        .call_value("add", Some(json!({ "a": "two", "b": 3 })))
        .await
        .unwrap_err();
    let text = err.to_string();
    assert!(text.starts_with("invalid input"), "got {text}");
}

#[tokio::test]
async fn test_counter_with_slow_consumer() {
    let server = server();
    let (client, _session) = connect(&server, "alice");

    let mut stream = client.stream::<_, u64>("counter", &5).await.unwrap();
    let mut values = Vec::new();
    while let Some(value) = stream.next().await {
        values.push(value.unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(values, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_stream_failure_after_values() {
    let server = server();
    let (client, _session) = connect(&server, "alice");

    let mut stream = client.stream::<_, u64>("fail_after", &3).await.unwrap();
    for expected in 0..3 {
        assert_eq!(stream.next().await.unwrap().unwrap(), expected);
    }
    let err = stream.next().await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "resolver gave up");
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_streaming_validation_faults_with_zero_total() {
    let server = server();
    let (raw, _session) = connect_raw(&server, "alice");

    send_frame(
        &raw,
        Frame::OpenStream {
            nonce: Nonce(0),
            procedure: "counter".into(),
            input: Some(json!("five")),
        },
    )
    .await;

    match recv_frame(&raw).await {
        Frame::StreamFault { nonce, total, reason } => {
            assert_eq!(nonce, Nonce(0));
            assert_eq!(total, 0);
            assert!(reason.as_str().unwrap().starts_with("invalid input"));
        }
        other => panic!("expected a fault, got {other:?}"),
    }
}

// =========================================================================
// Flow control
// =========================================================================

fn ticking_server(produced: Arc<AtomicU64>, burst: bool) -> TestServer {
    let ticks = input(NoInput).stream_resolve(
        move |_ctx: Ctx, ()| {
            let produced = Arc::clone(&produced);
            stream::unfold(0u64, move |i| {
                let produced = Arc::clone(&produced);
                async move {
                    if i == 5 {
                        return None;
                    }
                    produced.fetch_add(1, Ordering::SeqCst);
                    Some((Ok::<_, String>(i), i + 1))
                }
            })
        },
        burst,
    );
    TestServer::builder(Global::default())
        .procedure("ticks", ticks)
        .build()
}

async fn open_ticks(raw: &MemorySocket) {
    send_frame(
        raw,
        Frame::OpenStream {
            nonce: Nonce(0),
            procedure: "ticks".into(),
            input: None,
        },
    )
    .await;
}

#[tokio::test]
async fn test_non_burst_waits_for_each_confirmation() {
    let produced = Arc::new(AtomicU64::new(0));
    let server = ticking_server(Arc::clone(&produced), false);
    let (raw, _session) = connect_raw(&server, "alice");

    open_ticks(&raw).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(produced.load(Ordering::SeqCst), 1);

    // Taking delivery of frame 0 confirms it and lets frame 1 be produced.
    match recv_frame(&raw).await {
        Frame::StreamData { index, .. } => assert_eq!(index, 0),
        other => panic!("expected data, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(produced.load(Ordering::SeqCst), 2);

    for expected in 1..5 {
        match recv_frame(&raw).await {
            Frame::StreamData { index, value, .. } => {
                assert_eq!(index, expected);
                assert_eq!(value, json!(expected));
            }
            other => panic!("expected data, got {other:?}"),
        }
    }
    match recv_frame(&raw).await {
        Frame::StreamEnd { total, .. } => assert_eq!(total, 5),
        other => panic!("expected end, got {other:?}"),
    }
}

#[tokio::test]
async fn test_burst_does_not_wait_for_confirmation() {
    let produced = Arc::new(AtomicU64::new(0));
    let server = ticking_server(Arc::clone(&produced), true);
    let (raw, _session) = connect_raw(&server, "alice");

    open_ticks(&raw).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(produced.load(Ordering::SeqCst), 5);

    let mut indexes = Vec::new();
    let mut total = None;
    for _ in 0..6 {
        match recv_frame(&raw).await {
            Frame::StreamData { index, .. } => indexes.push(index),
            Frame::StreamEnd { total: t, .. } => total = Some(t),
            other => panic!("unexpected frame {other:?}"),
        }
    }
    indexes.sort_unstable();
    assert_eq!(indexes, vec![0, 1, 2, 3, 4]);
    assert_eq!(total, Some(5));
}

// =========================================================================
// State
// =========================================================================

#[tokio::test]
async fn test_global_state_is_shared_and_local_is_per_session() {
    let server = server();
    let (alice, _a) = connect(&server, "alice");
    let (bob, _b) = connect(&server, "bob");

    assert_eq!(alice.call::<_, u64>("calls", &()).await.unwrap(), 1);
    assert_eq!(alice.call::<_, u64>("calls", &()).await.unwrap(), 2);
    assert_eq!(bob.call::<_, u64>("calls", &()).await.unwrap(), 1);

    assert_eq!(alice.call::<_, u64>("hits", &()).await.unwrap(), 1);
    assert_eq!(bob.call::<_, u64>("hits", &()).await.unwrap(), 2);
    assert_eq!(server.global_state().lock().await.hits, 2);
}

#[tokio::test]
async fn test_local_state_is_created_lazily() {
    let server = server();
    let (client, session) = connect(&server, "alice");

    assert!(server.local_state(session.id()).is_none());
    client.call::<_, i64>("add", &json!({ "a": 1, "b": 1 })).await.unwrap();
    assert!(server.local_state(session.id()).is_some());
}

#[tokio::test]
async fn test_same_key_keeps_local_state_and_rooms() {
    let server = server();
    let (first, old) = connect(&server, "alice");
    old.join("lobby").unwrap();
    assert_eq!(first.call::<_, u64>("calls", &()).await.unwrap(), 1);

    let (second, new) = connect(&server, "alice");
    assert_eq!(new.id(), old.id());
    assert!(!new.ptr_eq(&old));
    assert_eq!(server.session_count(), 1);
    assert!(server.session(new.id()).unwrap().ptr_eq(&new));

    assert_eq!(second.call::<_, u64>("calls", &()).await.unwrap(), 2);
    assert!(new.rooms().contains("lobby"));

    // The stale handle no longer owns the registry entry.
    assert!(!server.remove_session(&old).await);
    assert_eq!(server.session_count(), 1);
}

// =========================================================================
// Sessions and rooms
// =========================================================================

#[tokio::test]
async fn test_session_id_is_digest_of_connection_key() {
    let server = server();
    let (client, session) = connect(&server, "alice");

    assert_eq!(session.id(), &SessionId::from_connection_key(b"alice"));
    let reported: String = client.call("whoami", &()).await.unwrap();
    assert_eq!(reported, session.id().as_str());
}

#[tokio::test]
async fn test_session_is_in_its_own_room() {
    let server = server();
    let (_client, session) = connect(&server, "alice");

    assert_eq!(server.room_members(session.id().as_str()), vec![session.id().clone()]);
    assert!(session.rooms().contains(session.id().as_str()));
}

#[tokio::test]
async fn test_join_leave_and_leave_all() {
    let server = server();
    let (_client, session) = connect(&server, "alice");

    assert_eq!(session.join(["red", "blue"]).unwrap(), 2);
    assert_eq!(session.join("red").unwrap(), 0);
    assert_eq!(server.room_members("red"), vec![session.id().clone()]);

    assert_eq!(session.leave("red").unwrap(), 1);
    assert!(server.room_members("red").is_empty());
    assert!(server.room_names().contains(&"red".to_string()));

    let left = session.leave_all().unwrap();
    assert!(left.contains("blue"));
    assert!(left.contains(session.id().as_str()));
    assert!(session.rooms().is_empty());
}

#[tokio::test]
async fn test_remove_session_cleans_up_and_closes() {
    let server = server();
    let (client, session) = connect(&server, "alice");
    session.join("lobby").unwrap();
    client.call::<_, u64>("calls", &()).await.unwrap();

    assert!(server.remove_session(&session).await);
    assert_eq!(server.session_count(), 0);
    assert!(server.room_members("lobby").is_empty());
    assert!(server.local_state(session.id()).is_none());

    tokio::time::timeout(Duration::from_secs(1), client.closed())
        .await
        .expect("client should see the close");
    assert!(session.join("lobby").is_err());
}

#[tokio::test]
async fn test_on_session_runs_before_first_request() {
    let server = server();
    server.on_session(|session| {
        session.join("everyone").unwrap();
    });

    let (client, session) = connect(&server, "alice");
    assert_eq!(server.room_members("everyone"), vec![session.id().clone()]);
    assert_eq!(client.call::<_, i64>("add", &json!({ "a": 1, "b": 2 })).await.unwrap(), 3);
}

#[tokio::test]
async fn test_events_reach_session_and_server_listeners() {
    let server = server();
    let (tx, mut seen) = mpsc::unbounded_channel();
    server.on("chat", move |from: &SessionId, args: &[Value]| {
        let _ = tx.send((from.clone(), args.to_vec()));
    });
    let (reserved_tx, mut reserved) = mpsc::unbounded_channel();
    server.on("session", move |_: &SessionId, _: &[Value]| {
        let _ = reserved_tx.send(());
    });

    let (client, session) = connect(&server, "alice");
    let mut chat = session.events("chat");
    let mut hello = session.events("session");

    client.emit("session", vec![json!("hi")]).await.unwrap();
    client.emit("chat", vec![json!("first")]).await.unwrap();
    client.emit("chat", vec![json!("second")]).await.unwrap();

    assert_eq!(chat.recv().await.unwrap(), vec![json!("first")]);
    assert_eq!(chat.recv().await.unwrap(), vec![json!("second")]);
    assert_eq!(hello.recv().await.unwrap(), vec![json!("hi")]);

    let (from, args) = seen.recv().await.unwrap();
    assert_eq!(&from, session.id());
    assert_eq!(args, vec![json!("first")]);
    assert_eq!(seen.recv().await.unwrap().1, vec![json!("second")]);

    // Reserved for session announcements; never forwarded to the server.
    assert!(reserved.try_recv().is_err());
}

// =========================================================================
// Broadcast
// =========================================================================

#[tokio::test]
async fn test_broadcast_reaches_room_members_only() {
    let server = server();
    let mut members = Vec::new();
    for key in ["a", "b", "c"] {
        let (raw, session) = connect_raw(&server, key);
        session.join("lobby").unwrap();
        members.push((raw, session));
    }
    let (outsider, _outside) = connect_raw(&server, "d");

    let operator = server.to("lobby");
    let emit = tokio::spawn(async move {
        operator.emit("ping", vec![json!("hello")]).await
    });

    for (raw, _) in &members {
        match recv_frame(raw).await {
            Frame::Event { name, seq, args } => {
                assert_eq!(name, "ping");
                assert_eq!(seq, 0);
                assert_eq!(args, vec![json!("hello")]);
            }
            other => panic!("expected an event, got {other:?}"),
        }
    }
    assert_eq!(emit.await.unwrap(), 3);

    let nothing =
        tokio::time::timeout(Duration::from_millis(50), outsider.recv()).await;
    assert!(nothing.is_err(), "outsider should receive nothing");
}

#[tokio::test]
async fn test_broadcast_sequences_are_per_recipient() {
    let server = server();
    let (raw_a, a) = connect_raw(&server, "a");
    let (raw_b, b) = connect_raw(&server, "b");
    a.join("solo").unwrap();
    b.join("both").unwrap();
    a.join("both").unwrap();

    // a gets a "solo" ping first, so its "both" ping is its second.
    let solo = server.to("solo");
    let first = tokio::spawn(async move { solo.emit("ping", vec![]).await });
    assert!(matches!(recv_frame(&raw_a).await, Frame::Event { seq: 0, .. }));
    assert_eq!(first.await.unwrap(), 1);

    let both = server.to("solo").to("both");
    let second = tokio::spawn(async move { both.emit("ping", vec![]).await });
    assert!(matches!(recv_frame(&raw_a).await, Frame::Event { seq: 1, .. }));
    assert!(matches!(recv_frame(&raw_b).await, Frame::Event { seq: 0, .. }));
    assert_eq!(second.await.unwrap(), 2);
}

#[tokio::test]
async fn test_session_to_excludes_sender() {
    let server = server();
    let mut clients = Vec::new();
    for key in ["a", "b", "c"] {
        let (client, session) = connect(&server, key);
        session.join("room").unwrap();
        let rx = client.events("msg");
        clients.push((client, session, rx));
    }

    let sender = clients[0].1.clone();
    let operator = sender.to("room");
    assert_eq!(operator.recipients().len(), 2);
    assert_eq!(operator.emit("msg", vec![json!(1)]).await, 2);

    for (_, _, rx) in clients.iter_mut().skip(1) {
        let args = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("member should receive")
            .unwrap();
        assert_eq!(args, vec![json!(1)]);
    }
    let own = tokio::time::timeout(Duration::from_millis(50), clients[0].2.recv()).await;
    assert!(own.is_err(), "sender should be excluded");
}

#[tokio::test]
async fn test_server_emit_reaches_every_session() {
    let server = server();
    let mut receivers = Vec::new();
    let mut clients = Vec::new();
    for key in ["a", "b"] {
        let (client, _session) = connect(&server, key);
        receivers.push(client.events("news"));
        clients.push(client);
    }

    assert_eq!(server.emit("news", vec![json!("extra")]).await, 2);
    for rx in &mut receivers {
        assert_eq!(rx.recv().await.unwrap(), vec![json!("extra")]);
    }
}

// =========================================================================
// Transport replacement
// =========================================================================

#[tokio::test]
async fn test_replacement_fails_pending_then_recovers() {
    let server = server();
    let (a, b, link) = memory::resumable_pair("alice");
    let _session = server.process_session(b);
    let client = Multiplexer::connect(a, JsonCodec);

    let calls: Vec<_> = (0..2)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.call_value("slow", None).await })
        })
        .collect();
    let mut stall = client.stream_value("stall", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    link.replace().expect("replace should succeed");

    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CallError::ConnectionLost));
        assert_eq!(err.to_string(), "Old connection closed");
    }
    let err = stall.next().await.unwrap().unwrap_err();
    assert!(matches!(err, CallError::ConnectionLost));

    let sum: i64 = client.call("add", &json!({ "a": 2, "b": 3 })).await.unwrap();
    assert_eq!(sum, 5);
    assert_eq!(client.link_generation(), 1);
}
