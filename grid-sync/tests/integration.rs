//! Integration tests for end-to-end WebSocket grid sync.
//!
//! These tests start a real server and connect real clients,
//! verifying the full edit pipeline.

use grid_core::CellRef;
use grid_sync::client::{ClientEvent, ConnectionState, GridClient};
use grid_sync::protocol::{ErrorKind, GridMessage, MessageType};
use grid_sync::server::{ServerConfig, SyncServer};
use grid_sync::storage::MemoryGridStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// Start a server on a free port, return it with its URL.
async fn start_test_server(config: ServerConfig) -> (Arc<SyncServer>, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SyncServer::with_store(config, Arc::new(MemoryGridStore::new())));
    let running = server.clone();
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

fn small_grid() -> ServerConfig {
    ServerConfig {
        rows: 2,
        cols: 2,
        broadcast_capacity: 64,
        reconcile_interval_secs: 0,
        ..ServerConfig::default()
    }
}

async fn next_event(rx: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Skip events until one matches.
async fn wait_for<F>(rx: &mut mpsc::Receiver<ClientEvent>, mut pred: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Events up to and including the next Pong.
async fn drain_until_pong(client: &GridClient, rx: &mut mpsc::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    client.send_ping().await.unwrap();
    let mut seen = Vec::new();
    loop {
        let event = next_event(rx).await;
        if matches!(event, ClientEvent::Pong) {
            return seen;
        }
        seen.push(event);
    }
}

/// Connect and wait for the initial snapshot.
async fn join(url: &str, identity: &str) -> (GridClient, mpsc::Receiver<ClientEvent>, Vec<Vec<String>>) {
    let mut client = GridClient::new(identity, url);
    let mut rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    assert!(matches!(next_event(&mut rx).await, ClientEvent::Connected));
    assert!(matches!(next_event(&mut rx).await, ClientEvent::Welcome(_)));
    let rows = match next_event(&mut rx).await {
        ClientEvent::Snapshot { rows, .. } => rows,
        other => panic!("expected Snapshot, got {other:?}"),
    };
    (client, rx, rows)
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (_server, url) = start_test_server(small_grid()).await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_receives_initial_snapshot() {
    let (server, url) = start_test_server(small_grid()).await;
    let (client, _rx, rows) = join(&url, "alice").await;

    assert_eq!(rows, vec![vec!["A1", "B1"], vec!["A2", "B2"]]);
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert_ne!(client.connection_id().await, uuid::Uuid::nil());
    assert_eq!(server.engine().registry().len().await, 1);
}

#[tokio::test]
async fn test_edit_broadcast_between_clients() {
    let (server, url) = start_test_server(small_grid()).await;
    let (alice, mut alice_rx, _) = join(&url, "alice").await;
    let (_bob, mut bob_rx, _) = join(&url, "bob").await;

    alice.send_edit("A1", "hello", Some("5".into())).await.unwrap();

    for rx in [&mut bob_rx, &mut alice_rx] {
        let event = wait_for(rx, |e| matches!(e, ClientEvent::CellUpdated { .. })).await;
        let ClientEvent::CellUpdated { update, .. } = event else { unreachable!() };
        assert_eq!(update.cell_id, "A1");
        assert_eq!(update.text, "hello");
        assert_eq!(update.label.as_deref(), Some("5"));
        assert_eq!(update.user.as_deref(), Some("alice"));
    }

    let snapshot = server.engine().snapshot().await.unwrap();
    assert_eq!(snapshot.get(CellRef::new(0, 0)), Some("hello"));
}

#[tokio::test]
async fn test_peer_join_and_leave_notifications() {
    let (_server, url) = start_test_server(small_grid()).await;
    let (_alice, mut alice_rx, _) = join(&url, "alice").await;

    let (bob, _bob_rx, _) = join(&url, "bob").await;
    let bob_id = bob.connection_id().await;
    let joined = wait_for(&mut alice_rx, |e| {
        matches!(e, ClientEvent::PeerJoined { identity, .. } if identity == "bob")
    })
    .await;
    assert!(matches!(joined, ClientEvent::PeerJoined { connection_id, .. } if connection_id == bob_id));

    drop(bob);
    let left = wait_for(&mut alice_rx, |e| matches!(e, ClientEvent::PeerLeft(_))).await;
    assert!(matches!(left, ClientEvent::PeerLeft(id) if id == bob_id));
}

#[tokio::test]
async fn test_echo_disabled_skips_sender() {
    let config = ServerConfig {
        echo_to_sender: false,
        ..small_grid()
    };
    let (_server, url) = start_test_server(config).await;
    let (alice, mut alice_rx, _) = join(&url, "alice").await;
    let (_bob, mut bob_rx, _) = join(&url, "bob").await;

    alice.send_edit("B1", "quiet", None).await.unwrap();
    wait_for(&mut bob_rx, |e| matches!(e, ClientEvent::CellUpdated { .. })).await;

    let seen = drain_until_pong(&alice, &mut alice_rx).await;
    assert!(
        !seen.iter().any(|e| matches!(e, ClientEvent::CellUpdated { .. })),
        "sender got its own edit back: {seen:?}"
    );
}

#[tokio::test]
async fn test_invalid_edit_reported_only_to_sender() {
    let (server, url) = start_test_server(small_grid()).await;
    let (alice, mut alice_rx, _) = join(&url, "alice").await;
    let (bob, mut bob_rx, _) = join(&url, "bob").await;

    let request_id = alice.send_edit("Z99", "nope", None).await.unwrap();
    let event = wait_for(&mut alice_rx, |e| matches!(e, ClientEvent::Error { .. })).await;
    let ClientEvent::Error { request_id: rid, reply } = event else { unreachable!() };
    assert_eq!(rid, request_id);
    assert_eq!(reply.kind, ErrorKind::InvalidCoordinate);

    let bad_label = alice.send_edit("not a cell", "nope", None).await.unwrap();
    let event = wait_for(&mut alice_rx, |e| matches!(e, ClientEvent::Error { .. })).await;
    assert!(matches!(
        event,
        ClientEvent::Error { request_id, reply } if request_id == bad_label && reply.kind == ErrorKind::InvalidCell
    ));

    let seen = drain_until_pong(&bob, &mut bob_rx).await;
    assert!(!seen
        .iter()
        .any(|e| matches!(e, ClientEvent::CellUpdated { .. } | ClientEvent::Error { .. })));

    assert_eq!(server.engine().stats().edits_rejected, 1);
    assert_eq!(server.stats().await.rejected_requests, 2);
}

#[tokio::test]
async fn test_snapshot_request_reflects_edits() {
    let (_server, url) = start_test_server(small_grid()).await;
    let (alice, mut alice_rx, _) = join(&url, "alice").await;

    alice.send_edit("B2", "x", None).await.unwrap();
    wait_for(&mut alice_rx, |e| matches!(e, ClientEvent::CellUpdated { .. })).await;

    let request_id = alice.request_snapshot().await.unwrap();
    let event = wait_for(&mut alice_rx, |e| matches!(e, ClientEvent::Snapshot { .. })).await;
    let ClientEvent::Snapshot { request_id: rid, rows } = event else { unreachable!() };
    assert_eq!(rid, request_id);
    assert_eq!(rows, vec![vec!["A1", "B1"], vec!["A2", "x"]]);
}

#[tokio::test]
async fn test_bulk_save_round_trip() {
    let (server, url) = start_test_server(small_grid()).await;
    let (alice, mut alice_rx, _) = join(&url, "alice").await;
    let (_bob, mut bob_rx, _) = join(&url, "bob").await;

    let rows = vec![
        vec!["A1".to_string(), "one".to_string()],
        vec!["two".to_string(), "B2".to_string()],
    ];
    let request_id = alice.bulk_save(&rows).await.unwrap();

    let event = wait_for(&mut alice_rx, |e| matches!(e, ClientEvent::BulkResult { .. })).await;
    let ClientEvent::BulkResult { request_id: rid, response } = event else { unreachable!() };
    assert_eq!(rid, request_id);
    assert_eq!(response.message.as_deref(), Some("Saved 4 cells"));
    assert!(response.error.is_none());
    assert_eq!(response.applied_count, 4);

    // Only the two changed cells are broadcast.
    let mut changed = Vec::new();
    for _ in 0..2 {
        if let ClientEvent::CellUpdated { update, .. } =
            wait_for(&mut bob_rx, |e| matches!(e, ClientEvent::CellUpdated { .. })).await
        {
            changed.push(update.cell_id);
        }
    }
    changed.sort();
    assert_eq!(changed, vec!["A2", "B1"]);

    assert_eq!(server.engine().export_snapshot().await.unwrap(), rows);
}

#[tokio::test]
async fn test_bulk_save_requires_hello() {
    let (_server, url) = start_test_server(small_grid()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let msg = GridMessage::bulk_save(uuid::Uuid::nil(), 9, &[vec!["x".to_string()]]);
    ws.send(Message::Binary(msg.encode().unwrap().into())).await.unwrap();

    let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    let Message::Binary(data) = reply else { panic!("expected binary frame") };
    let decoded = GridMessage::decode(&data).unwrap();
    assert_eq!(decoded.msg_type, MessageType::Error);
    assert_eq!(decoded.request_id, 9);
    assert_eq!(decoded.error_reply().unwrap().kind, ErrorKind::UnknownConnection);
}

#[tokio::test]
async fn test_garbage_frame_is_rejected() {
    let (_server, url) = start_test_server(small_grid()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    ws.send(Message::Binary(vec![0xFFu8, 0xFE, 0xFD].into())).await.unwrap();
    let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    let Message::Binary(data) = reply else { panic!("expected binary frame") };
    let decoded = GridMessage::decode(&data).unwrap();
    assert_eq!(decoded.error_reply().unwrap().kind, ErrorKind::Protocol);
}

#[tokio::test]
async fn test_concurrent_clients_converge() {
    let (server, url) = start_test_server(small_grid()).await;
    let mut clients = Vec::new();
    for i in 0..4 {
        clients.push(join(&url, &format!("user{i}")).await);
    }

    for (i, (client, _, _)) in clients.iter().enumerate() {
        for n in 0..10 {
            client.send_edit("A1", format!("{i}-{n}"), None).await.unwrap();
        }
    }

    // Every client sees all 40 edits.
    for (_, rx, _) in clients.iter_mut() {
        let mut seen = 0;
        while seen < 40 {
            if let ClientEvent::CellUpdated { .. } = next_event(rx).await {
                seen += 1;
            }
        }
    }

    let (client, rx, _) = &mut clients[0];
    client.request_snapshot().await.unwrap();
    let event = wait_for(rx, |e| matches!(e, ClientEvent::Snapshot { .. })).await;
    let ClientEvent::Snapshot { rows, .. } = event else { unreachable!() };

    let authoritative = server.engine().export_snapshot().await.unwrap();
    assert_eq!(rows, authoritative);
    assert!(rows[0][0].contains('-'));
    assert_eq!(server.engine().stats().edits_applied, 40);
    assert!(server.engine().pending_cells().await.is_empty());
}
