//! End-to-end tests: real `chat-client` connection managers against a real
//! `ChatServer` over loopback TCP.
//!
//! # Purpose
//!
//! The unit tests of each crate stub out the other side.  These tests check
//! that the two halves agree on the wire:
//!
//! - The key exchange completes and application traffic is answered.
//! - Many concurrent requests are correlated by message ID.
//! - Server pushes reach one client (`push`) or every client (`broadcast`).
//! - Stopping the server drops clients into reconnection.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chat_client::{ClientConfig, ConnectionManager, ConnectionState, TcpConnector};
use chat_core::{Direction, Envelope, InboundMessage, MessageType, ServerKeyPair};
use chat_server::{AcknowledgeHandler, ChatServer, ServerConfig, SessionRegistry};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// ── Helpers ───────────────────────────────────────────────────────────────────

fn keypair() -> Arc<ServerKeyPair> {
    static K: OnceLock<Arc<ServerKeyPair>> = OnceLock::new();
    Arc::clone(K.get_or_init(|| Arc::new(ServerKeyPair::generate(1024).unwrap())))
}

struct RunningServer {
    port: u16,
    registry: SessionRegistry,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

async fn start_server() -> RunningServer {
    let config = ServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        rsa_key_bits: 1024,
        ..ServerConfig::default()
    };
    let server = ChatServer::bind(&config, keypair(), Arc::new(AcknowledgeHandler))
        .await
        .unwrap();
    let port = server.local_addr().unwrap().port();
    let registry = server.registry();
    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(server.run(stop_rx));
    RunningServer {
        port,
        registry,
        stop,
        task,
    }
}

async fn connect_client(port: u16) -> (ConnectionManager, mpsc::Receiver<InboundMessage>) {
    let mut config = ClientConfig::default();
    config.reconnect.base_delay_ms = 20;
    let connector = Arc::new(TcpConnector::new(config.connection.connect_timeout()));
    let (mgr, pushes) = ConnectionManager::new(&config, connector);
    mgr.connect("127.0.0.1", port).await.unwrap();
    (mgr, pushes)
}

async fn wait_for_sessions(registry: &SessionRegistry, n: usize) {
    for _ in 0..200 {
        if registry.len() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {n} sessions, have {}", registry.len());
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_client_exchanges_keys_and_gets_reply() {
    // Arrange
    let server = start_server().await;
    let (client, _pushes) = connect_client(server.port).await;

    // Act
    let request = Envelope::new(MessageType::SessionValidateRequest, b"token".to_vec());
    let reply = client.request(request.clone()).await.unwrap();

    // Assert
    assert!(client.is_encrypted());
    assert_eq!(reply.message_id, request.message_id);
    assert_eq!(reply.message_type, MessageType::SessionValidateResponse);
    assert_eq!(reply.payload, b"token".to_vec());
}

#[tokio::test]
async fn test_many_concurrent_requests_are_correlated() {
    // Arrange
    let server = start_server().await;
    let (client, _pushes) = connect_client(server.port).await;
    let requests: Vec<Envelope> = (0..50u32)
        .map(|i| Envelope::new(MessageType::MessageSendRequest, i.to_be_bytes().to_vec()))
        .collect();

    // Act
    let pending: Vec<_> = requests
        .iter()
        .map(|r| client.send(r.clone()).unwrap())
        .collect();
    let mut replies = Vec::new();
    for p in pending {
        replies.push(p.wait().await.unwrap());
    }

    // Assert
    for (req, reply) in requests.iter().zip(&replies) {
        assert_eq!(reply.message_id, req.message_id);
        assert_eq!(reply.payload, req.payload);
    }
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_push_reaches_only_target_session() {
    // Arrange
    let server = start_server().await;
    let (_a, mut pushes_a) = connect_client(server.port).await;
    let (_b, mut pushes_b) = connect_client(server.port).await;
    wait_for_sessions(&server.registry, 2).await;
    let target = server.registry.all()[0].id;

    // Act
    let message_id = server
        .registry
        .push(target, MessageType::Notification, b"direct".to_vec())
        .unwrap();

    // Assert: exactly one of the two clients receives it
    tokio::time::sleep(Duration::from_millis(100)).await;
    let received: Vec<InboundMessage> = [pushes_a.try_recv().ok(), pushes_b.try_recv().ok()]
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].message_id, message_id);
    assert_eq!(received[0].origin, Direction::ServerToClient);
}

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    // Arrange
    let server = start_server().await;
    let (_a, mut pushes_a) = connect_client(server.port).await;
    let (_b, mut pushes_b) = connect_client(server.port).await;
    wait_for_sessions(&server.registry, 2).await;

    // Act
    let delivered = server
        .registry
        .broadcast(MessageType::Notification, b"maintenance at noon");

    // Assert
    assert_eq!(delivered, 2);
    for pushes in [&mut pushes_a, &mut pushes_b] {
        let m = tokio::time::timeout(Duration::from_secs(5), pushes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(m.message_type, MessageType::Notification);
        assert_eq!(m.payload, b"maintenance at noon".to_vec());
    }
}

#[tokio::test]
async fn test_client_disconnect_unregisters_session() {
    let server = start_server().await;
    let (client, _pushes) = connect_client(server.port).await;
    wait_for_sessions(&server.registry, 1).await;

    client.disconnect();

    wait_for_sessions(&server.registry, 0).await;
}

#[tokio::test]
async fn test_server_shutdown_sends_client_into_reconnect() {
    // Arrange
    let server = start_server().await;
    let (client, _pushes) = connect_client(server.port).await;

    // Act
    server.stop.send(true).unwrap();
    server.task.await.unwrap();

    // Assert
    for _ in 0..200 {
        if client.state() != ConnectionState::Connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_ne!(client.state(), ConnectionState::Connected);
    assert!(!client.is_encrypted());
    client.shutdown();
}
