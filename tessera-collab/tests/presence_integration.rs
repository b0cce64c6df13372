//! Integration tests for cursor presence.
//!
//! These tests start a real relay and connect cursor clients, verifying
//! relaying, removal on disconnect, and the client-side presence table.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tessera_collab::client::CursorConnection;
use tessera_collab::cursor::{CursorBroadcaster, CursorConfig};
use tessera_collab::presence::{PresenceChange, RemotePresence};
use tessera_collab::server::{RelayServer, ServerConfig};
use tessera_core::{ClientId, ClientIdentity, ClientInfo, CursorPosition};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_test_server() -> (RelayServer, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::new(ServerConfig {
        bind_addr: addr.to_string(),
        status_interval_secs: 0,
        ..ServerConfig::default()
    });
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.serve(listener).await;
    });
    (server, addr)
}

async fn connect(addr: SocketAddr, path: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}{path}"))
        .await
        .expect("Should connect to relay");
    ws
}

async fn send_text(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.to_string().into())).await.unwrap();
}

async fn recv_text(ws: &mut Ws) -> String {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Should receive a frame within timeout")
            .expect("Stream ended")
            .expect("WebSocket error");
        if let Message::Text(text) = msg {
            return text.as_str().to_string();
        }
    }
}

/// No text frame arrives within `ms`.
async fn assert_quiet(ws: &mut Ws, ms: u64) {
    let result = timeout(Duration::from_millis(ms), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text.as_str().to_string(),
                Some(Ok(_)) => continue,
                _ => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(result.is_err(), "Unexpected frame: {result:?}");
}

fn cursor(client: &str, block: usize, offset: usize) -> String {
    json!({
        "type": "cursor",
        "clientId": client,
        "position": { "blockIndex": block, "offset": offset },
        "clientInfo": { "name": client.to_uppercase(), "color": "#FF6B6B" }
    })
    .to_string()
}

async fn wait_for_cursors(server: &RelayServer, name: &str, expected: usize) {
    for _ in 0..80 {
        if server.cursor_count(name).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(server.cursor_count(name).await, expected);
}

/// Send a position from `ws` and wait until the relay has registered it,
/// which also guarantees the connection has joined its room.
async fn announce(server: &RelayServer, ws: &mut Ws, client: &str, expected: usize) {
    send_text(ws, &cursor(client, 0, 0)).await;
    wait_for_cursors(server, "default", expected).await;
}

#[tokio::test]
async fn test_cursor_relayed_verbatim_to_others() {
    let (server, addr) = start_test_server().await;
    let mut alice = connect(addr, "/cursors").await;
    let mut bob = connect(addr, "/cursors").await;
    announce(&server, &mut bob, "bob", 1).await;

    let frame = cursor("alice", 2, 5);
    send_text(&mut alice, &frame).await;

    assert_eq!(recv_text(&mut bob).await, frame);
    wait_for_cursors(&server, "default", 2).await;
    assert_quiet(&mut bob, 100).await;
}

#[tokio::test]
async fn test_abrupt_close_synthesizes_one_removal() {
    let (server, addr) = start_test_server().await;
    let mut watcher = connect(addr, "/cursors").await;
    announce(&server, &mut watcher, "watcher", 1).await;

    let mut leaver = connect(addr, "/cursors").await;
    send_text(&mut leaver, &cursor("leaver", 1, 1)).await;
    recv_text(&mut watcher).await;
    wait_for_cursors(&server, "default", 2).await;

    drop(leaver);

    let removal: Value = serde_json::from_str(&recv_text(&mut watcher).await).unwrap();
    assert_eq!(removal, json!({ "type": "cursor", "clientId": "leaver", "action": "remove" }));
    assert_quiet(&mut watcher, 150).await;
    assert_eq!(server.cursor_count("default").await, 1);
}

#[tokio::test]
async fn test_explicit_remove_is_not_duplicated() {
    let (server, addr) = start_test_server().await;
    let mut watcher = connect(addr, "/cursors").await;
    announce(&server, &mut watcher, "watcher", 1).await;

    let mut leaver = connect(addr, "/cursors").await;
    send_text(&mut leaver, &cursor("leaver", 0, 3)).await;
    recv_text(&mut watcher).await;

    let remove = json!({ "type": "cursor", "clientId": "leaver", "action": "remove" }).to_string();
    send_text(&mut leaver, &remove).await;
    assert_eq!(recv_text(&mut watcher).await, remove);

    leaver.close(None).await.unwrap();
    drop(leaver);
    assert_quiet(&mut watcher, 150).await;
    assert_eq!(server.cursor_count("default").await, 1);
}

#[tokio::test]
async fn test_malformed_cursor_frames_dropped() {
    let (server, addr) = start_test_server().await;
    let mut watcher = connect(addr, "/cursors").await;
    announce(&server, &mut watcher, "watcher", 1).await;
    let mut sender = connect(addr, "/cursors").await;

    send_text(&mut sender, r#"{"type":"cursor","clientId":"x"}"#).await;
    send_text(&mut sender, "garbage").await;
    send_text(&mut sender, &cursor("x", 0, 0)).await;

    assert_eq!(recv_text(&mut watcher).await, cursor("x", 0, 0));
    assert_eq!(server.stats().await.malformed_messages, 2);
}

#[tokio::test]
async fn test_cursor_rooms_follow_document_name() {
    let (server, addr) = start_test_server().await;
    let mut in_notes = connect(addr, "/cursors/notes").await;
    let mut in_default = connect(addr, "/cursors").await;
    announce(&server, &mut in_default, "d", 1).await;

    send_text(&mut in_notes, &cursor("n", 0, 0)).await;
    wait_for_cursors(&server, "notes", 1).await;
    assert_quiet(&mut in_default, 100).await;
}

#[tokio::test]
async fn test_broadcaster_and_presence_end_to_end() {
    let (server, addr) = start_test_server().await;
    let url = format!("ws://{addr}/cursors");

    let (alice_conn, _alice_events) = CursorConnection::connect(&url).await.unwrap();
    let (bob_conn, mut bob_events) = CursorConnection::connect(&url).await.unwrap();

    // Make sure Bob's connection has joined before Alice moves.
    let bob_identity = ClientIdentity::new(ClientId::new("bob"), ClientInfo::new("Bob", "#82B1FF"));
    let mut bob_cursor = CursorBroadcaster::new(bob_conn, bob_identity, CursorConfig::default());
    bob_cursor.broadcast_position(CursorPosition::new(0, 0));
    wait_for_cursors(&server, "default", 1).await;

    let alice_identity = ClientIdentity::new(ClientId::new("alice"), ClientInfo::new("Alice", "#4ECDC4"));
    let mut alice_cursor = CursorBroadcaster::new(alice_conn, alice_identity, CursorConfig::default());
    for offset in 0..5 {
        alice_cursor.broadcast_position(CursorPosition::new(1, offset));
    }

    let mut presence = RemotePresence::new(ClientId::new("bob"));
    let mut changes = Vec::new();
    while changes.len() < 2 {
        let event = timeout(Duration::from_secs(2), bob_events.recv())
            .await
            .expect("Should receive an event")
            .expect("Event stream ended");
        match presence.handle_event(&event) {
            PresenceChange::Ignored => {}
            change => {
                changes.push(change);
                if changes.len() == 1 {
                    alice_cursor.teardown();
                }
            }
        }
    }

    assert_eq!(
        changes,
        vec![
            PresenceChange::Joined(ClientId::new("alice")),
            PresenceChange::Left(ClientId::new("alice")),
        ]
    );
    assert_eq!(presence.peer_count(), 0);
}
