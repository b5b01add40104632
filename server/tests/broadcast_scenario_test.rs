//! End-to-end broadcast scenarios without a network transport.
//!
//! Connections are driven through the lifecycle handler with channel-backed
//! handles, and the producer reads from an in-memory duplex pipe, so these
//! tests exercise the same code paths as the WebSocket server.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use pipecast_server::auth::TokenVerifier;
use pipecast_server::broadcast::{BroadcastProducer, ProducerExit};
use pipecast_server::lifecycle::{ConnectionEvent, LifecycleHandler};
use pipecast_server::registry::{AuthState, ChannelHandle, ConnectionRegistry};
use pipecast_server::types::{Envelope, Frame, EVENT_BROADCAST};

// ============================================================================
// Test Helpers
// ============================================================================

const SECRET: &str = "secret key";

fn new_hub() -> (Arc<ConnectionRegistry>, LifecycleHandler) {
    let registry = Arc::new(ConnectionRegistry::new());
    let handler = LifecycleHandler::new(
        Arc::clone(&registry),
        Arc::new(TokenVerifier::new(SECRET)),
    );
    (registry, handler)
}

fn connect(handler: &LifecycleHandler, id: &str) -> UnboundedReceiver<Frame> {
    let (handle, rx) = ChannelHandle::channel();
    handler.handle(id, ConnectionEvent::Connect(Arc::new(handle)));
    rx
}

/// Waits for the next broadcast frame and returns its message text.
async fn next_message(rx: &mut UnboundedReceiver<Frame>) -> String {
    let frame = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for broadcast")
        .expect("channel closed");
    assert_eq!(frame.event, EVENT_BROADCAST);
    let envelope: Envelope = serde_json::from_str(&frame.data_text()).unwrap();
    envelope.message
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn late_joiner_only_sees_later_lines() {
    let (registry, handler) = new_hub();
    let mut first = connect(&handler, "first");
    let mut second = connect(&handler, "second");

    let (mut input, output) = tokio::io::duplex(1024);
    let producer = BroadcastProducer::new(Arc::clone(&registry)).spawn(BufReader::new(output));

    input.write_all(b"a\n").await.unwrap();
    assert_eq!(next_message(&mut first).await, "a");
    assert_eq!(next_message(&mut second).await, "a");

    let mut third = connect(&handler, "third");

    input.write_all(b"b\n").await.unwrap();
    assert_eq!(next_message(&mut first).await, "b");
    assert_eq!(next_message(&mut second).await, "b");
    assert_eq!(next_message(&mut third).await, "b");

    drop(input);
    let exit = producer.await.unwrap();
    assert!(matches!(exit, ProducerExit::EndOfStream { lines: 2 }));

    assert!(first.try_recv().is_err());
    assert!(second.try_recv().is_err());
    assert!(third.try_recv().is_err());
}

#[tokio::test]
async fn disconnected_client_stops_receiving_without_affecting_others() {
    let (registry, handler) = new_hub();
    let mut stays = connect(&handler, "stays");
    let leaves = connect(&handler, "leaves");
    let producer = BroadcastProducer::new(Arc::clone(&registry));

    handler.handle("leaves", ConnectionEvent::Disconnect);
    drop(leaves);

    let report = producer.broadcast_line("after leave");
    assert_eq!(report.attempted, 1);
    assert_eq!(next_message(&mut stays).await, "after leave");
}

#[tokio::test]
async fn authentication_outcome_never_gates_delivery() {
    let (registry, handler) = new_hub();
    let mut trusted = connect(&handler, "trusted");
    let mut rejected = connect(&handler, "rejected");
    let mut anonymous = connect(&handler, "anonymous");

    let good = encode(
        &Header::default(),
        &json!({ "user": "alice" }),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap();
    let bad = encode(
        &Header::default(),
        &json!({ "user": "mallory" }),
        &EncodingKey::from_secret(b"wrong"),
    )
    .unwrap();

    handler.handle(
        "trusted",
        ConnectionEvent::AuthRequest(json!({ "token": good }).to_string()),
    );
    handler.handle(
        "rejected",
        ConnectionEvent::AuthRequest(json!({ "token": bad }).to_string()),
    );

    assert_eq!(
        registry.get("trusted").unwrap().auth_state(),
        AuthState::Authenticated
    );
    assert_eq!(
        registry.get("rejected").unwrap().auth_state(),
        AuthState::Unauthenticated
    );
    assert_eq!(
        registry.get("anonymous").unwrap().auth_state(),
        AuthState::Pending
    );

    let report = BroadcastProducer::new(Arc::clone(&registry)).broadcast_line("for everyone");
    assert_eq!(report.delivered, 3);
    assert_eq!(next_message(&mut trusted).await, "for everyone");
    assert_eq!(next_message(&mut rejected).await, "for everyone");
    assert_eq!(next_message(&mut anonymous).await, "for everyone");
}

#[tokio::test]
async fn concurrent_connection_churn_during_broadcasts() {
    let (registry, handler) = new_hub();
    let mut steady = connect(&handler, "steady");
    let producer = BroadcastProducer::new(Arc::clone(&registry));

    let churn = {
        let handler = handler.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                let id = format!("churn-{i}");
                let _rx = connect(&handler, &id);
                tokio::task::yield_now().await;
                handler.handle(&id, ConnectionEvent::Disconnect);
            }
        })
    };

    for i in 0..50 {
        producer.broadcast_line(&format!("line {i}"));
        tokio::task::yield_now().await;
    }
    churn.await.unwrap();

    for i in 0..50 {
        assert_eq!(next_message(&mut steady).await, format!("line {i}"));
    }
    assert_eq!(registry.len(), 1);
}
