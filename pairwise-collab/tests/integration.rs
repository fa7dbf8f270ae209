//! End-to-end tests over real sockets.
//!
//! Each test starts a server on an ephemeral port and drives it with
//! `SyncClient`s, exercising admission, ordering and relay behavior.

use pairwise_collab::claims::ChannelOrchestrator;
use pairwise_collab::client::{ClientError, ClientOptions, ConnectionState, SyncClient, SyncEvent};
use pairwise_collab::protocol::{Role, ServerEvent};
use pairwise_collab::server::{ServerConfig, SyncServer};
use pairwise_collab::storage::MemoryStore;
use pairwise_collab::{LogOrchestrator, Orchestrator, StaticTokens};
use pairwise_core::{OpId, ReplicaId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite;

const ORIGIN: &str = "http://localhost:5173";

struct TestServer {
    url: String,
    store: Arc<MemoryStore>,
    server: Arc<SyncServer>,
}

fn tokens() -> StaticTokens {
    StaticTokens::new()
        .with("alice-token", "alice", Role::Student)
        .with("bob-token", "bob", Role::Student)
        .with("mia-token", "mia", Role::Mentor)
        .with("max-token", "max", Role::Mentor)
}

async fn start_with(orchestrator: Arc<dyn Orchestrator>) -> TestServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let store = Arc::new(MemoryStore::new());
    let mut config = ServerConfig::default();
    config.room.grace_period = Duration::from_millis(100);
    config.room.save_interval = Duration::from_millis(20);
    let server = Arc::new(SyncServer::with_store(
        config,
        store.clone(),
        Arc::new(tokens()),
        orchestrator,
    ));
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    TestServer {
        url: format!("ws://127.0.0.1:{port}"),
        store,
        server,
    }
}

async fn start() -> TestServer {
    start_with(Arc::new(LogOrchestrator)).await
}

fn options(token: &str) -> ClientOptions {
    ClientOptions {
        origin: Some(ORIGIN.to_string()),
        token: Some(token.to_string()),
    }
}

/// Connect and consume `session-ready`, returning the assigned replica.
async fn connect(url: &str, token: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>, ReplicaId) {
    let mut client = SyncClient::connect(url, options(token)).await.unwrap();
    let mut events = client.take_event_rx().unwrap();
    let replica = match next(&mut events).await {
        SyncEvent::Server(ServerEvent::SessionReady { replica_id, .. }) => replica_id,
        other => panic!("expected session-ready first, got {other:?}"),
    };
    (client, events, replica)
}

async fn next(events: &mut mpsc::Receiver<SyncEvent>) -> SyncEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Skip presence traffic and return the next other event.
async fn next_non_presence(events: &mut mpsc::Receiver<SyncEvent>) -> SyncEvent {
    loop {
        match next(events).await {
            SyncEvent::Server(ServerEvent::PresenceUpdate { .. }) => continue,
            other => return other,
        }
    }
}

async fn snapshot_text(events: &mut mpsc::Receiver<SyncEvent>) -> String {
    match next_non_presence(events).await {
        SyncEvent::Server(ServerEvent::EditorSnapshot { text, .. }) => text,
        other => panic!("expected editor-snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn test_session_ready_then_snapshot() {
    let server = start().await;
    let (client, mut events, _) = connect(&server.url, "alice-token").await;
    assert_eq!(client.connection_state().await, ConnectionState::Connected);

    client.join("post-1").await.unwrap();
    assert_eq!(snapshot_text(&mut events).await, "");
}

#[tokio::test]
async fn test_untrusted_origin_refused_with_403() {
    let server = start().await;
    let result = SyncClient::connect(
        &server.url,
        ClientOptions {
            origin: Some("http://evil.example".to_string()),
            token: Some("alice-token".to_string()),
        },
    )
    .await;
    match result {
        Err(ClientError::Connect(tungstenite::Error::Http(response))) => {
            assert_eq!(response.status(), 403);
        }
        Err(other) => panic!("expected an HTTP refusal, got {other}"),
        Ok(_) => panic!("untrusted origin was admitted"),
    }
    let stats = server.server.stats().await;
    assert_eq!(stats.rejected_origins, 1);
    assert_eq!(stats.auth_failures, 0);
}

#[tokio::test]
async fn test_bad_token_closed_with_policy_code() {
    let server = start().await;
    let mut client = SyncClient::connect(&server.url, options("forged")).await.unwrap();
    assert_eq!(client.next_event().await, Some(SyncEvent::Closed(Some(1008))));
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    assert_eq!(server.server.stats().await.active_sessions, 0);
}

#[tokio::test]
async fn test_edits_converge_without_echo() {
    let server = start().await;
    let (alice, mut alice_events, alice_replica) = connect(&server.url, "alice-token").await;
    let (bob, mut bob_events, bob_replica) = connect(&server.url, "bob-token").await;

    alice.join("post-1").await.unwrap();
    snapshot_text(&mut alice_events).await;
    bob.join("post-1").await.unwrap();
    snapshot_text(&mut bob_events).await;

    let a = OpId::new(alice_replica, 1);
    alice.insert("post-1", a, None, "a").await.unwrap();
    match next_non_presence(&mut bob_events).await {
        SyncEvent::Server(ServerEvent::EditOp(edit)) => assert_eq!(edit.op_id, a),
        other => panic!("expected alice's edit, got {other:?}"),
    }

    bob.insert("post-1", OpId::new(bob_replica, 2), Some(a), "b").await.unwrap();
    match next_non_presence(&mut alice_events).await {
        SyncEvent::Server(ServerEvent::EditOp(edit)) => assert_eq!(edit.payload, "b"),
        other => panic!("expected bob's edit, got {other:?}"),
    }

    // A sync request is ordered after both edits; alice's own edit must not
    // show up before it.
    alice.sync_request("post-1").await.unwrap();
    assert_eq!(snapshot_text(&mut alice_events).await, "ab");
    bob.sync_request("post-1").await.unwrap();
    assert_eq!(snapshot_text(&mut bob_events).await, "ab");
}

#[tokio::test]
async fn test_forged_replica_is_dropped() {
    let server = start().await;
    let (alice, mut alice_events, alice_replica) = connect(&server.url, "alice-token").await;
    alice.join("post-1").await.unwrap();
    snapshot_text(&mut alice_events).await;

    let forged = ReplicaId(alice_replica.0.wrapping_add(1));
    alice.insert("post-1", OpId::new(forged, 1), None, "x").await.unwrap();
    alice.sync_request("post-1").await.unwrap();
    assert_eq!(snapshot_text(&mut alice_events).await, "");
    assert_eq!(server.server.stats().await.malformed_messages, 1);
}

#[tokio::test]
async fn test_garbage_does_not_kill_the_connection() {
    let server = start().await;
    let (alice, mut alice_events, _) = connect(&server.url, "alice-token").await;
    alice.send_raw("{not json".to_string()).await.unwrap();
    alice.join("post-1").await.unwrap();
    assert_eq!(snapshot_text(&mut alice_events).await, "");
}

#[tokio::test]
async fn test_chat_reaches_everyone_and_is_kept() {
    let server = start().await;
    let (alice, mut alice_events, _) = connect(&server.url, "alice-token").await;
    let (bob, mut bob_events, _) = connect(&server.url, "bob-token").await;
    alice.join("post-1").await.unwrap();
    snapshot_text(&mut alice_events).await;
    bob.join("post-1").await.unwrap();
    snapshot_text(&mut bob_events).await;

    alice.chat("post-1", "hello").await.unwrap();
    for events in [&mut alice_events, &mut bob_events] {
        match next_non_presence(events).await {
            SyncEvent::Server(ServerEvent::ChatMessage(message)) => {
                assert_eq!(message.author, "alice");
                assert_eq!(message.content, "hello");
                assert!(message.ts > 0);
            }
            other => panic!("expected chat, got {other:?}"),
        }
    }

    for _ in 0..50 {
        if !server.store.chat_log("post-1").is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.store.chat_log("post-1").len(), 1);
}

#[tokio::test]
async fn test_claim_flow() {
    let (orchestrator, mut started) = ChannelOrchestrator::new();
    let server = start_with(Arc::new(orchestrator)).await;
    let (mia, mut mia_events, _) = connect(&server.url, "mia-token").await;
    let (max, mut max_events, _) = connect(&server.url, "max-token").await;
    let (alice, mut alice_events, _) = connect(&server.url, "alice-token").await;
    for (client, events) in [
        (&mia, &mut mia_events),
        (&max, &mut max_events),
        (&alice, &mut alice_events),
    ] {
        client.join("post-1").await.unwrap();
        snapshot_text(events).await;
    }

    mia.claim("post-1", "p-1").await.unwrap();
    for events in [&mut mia_events, &mut max_events, &mut alice_events] {
        match next_non_presence(events).await {
            SyncEvent::Server(ServerEvent::SessionClaimed { mentor_id, .. }) => assert_eq!(mentor_id, "mia"),
            other => panic!("expected session-claimed, got {other:?}"),
        }
    }
    let signal = timeout(Duration::from_secs(1), started.recv()).await.unwrap().unwrap();
    assert_eq!(signal.post_id, "p-1");

    max.claim("post-1", "p-1").await.unwrap();
    match next_non_presence(&mut max_events).await {
        SyncEvent::Server(ServerEvent::ClaimRejected { holder, .. }) => assert_eq!(holder, "mia"),
        other => panic!("expected claim-rejected, got {other:?}"),
    }

    alice.claim("post-1", "p-2").await.unwrap();
    match next_non_presence(&mut alice_events).await {
        SyncEvent::Server(ServerEvent::ClaimRejected { reason, .. }) => assert_eq!(reason, "not-mentor"),
        other => panic!("expected claim-rejected, got {other:?}"),
    }
    assert!(started.try_recv().is_err());
}

#[tokio::test]
async fn test_disconnect_drains_room_into_store() {
    let server = start().await;
    let (alice, mut alice_events, replica) = connect(&server.url, "alice-token").await;
    alice.join("post-9").await.unwrap();
    snapshot_text(&mut alice_events).await;
    alice.insert("post-9", OpId::new(replica, 1), None, "kept").await.unwrap();
    alice.sync_request("post-9").await.unwrap();
    assert_eq!(snapshot_text(&mut alice_events).await, "kept");
    alice.close().await;

    for _ in 0..100 {
        if server.server.stats().await.active_rooms == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.server.stats().await.active_rooms, 0);
    assert_eq!(server.store.stored_text("post-9").as_deref(), Some("kept"));

    let (bob, mut bob_events, _) = connect(&server.url, "bob-token").await;
    bob.join("post-9").await.unwrap();
    assert_eq!(snapshot_text(&mut bob_events).await, "kept");
}

#[tokio::test]
async fn test_slow_join_does_not_hold_back_other_rooms() {
    let server = start().await;
    let (alice, mut alice_events, _) = connect(&server.url, "alice-token").await;
    let (bob, mut bob_events, bob_replica) = connect(&server.url, "bob-token").await;
    alice.join("post-1").await.unwrap();
    snapshot_text(&mut alice_events).await;
    bob.join("post-1").await.unwrap();
    snapshot_text(&mut bob_events).await;

    // four failed loads: the join waits out roughly 750 ms of backoff
    server.store.fail_next_loads(4);
    alice.join("post-slow").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    bob.insert("post-1", OpId::new(bob_replica, 1), None, "b").await.unwrap();
    match next_non_presence(&mut alice_events).await {
        SyncEvent::Server(ServerEvent::EditOp(edit)) => assert_eq!(edit.room_id, "post-1"),
        other => panic!("expected bob's edit ahead of the slow snapshot, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(snapshot_text(&mut alice_events).await, "");
}
