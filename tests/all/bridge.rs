use crate::fakes::{eventually, FakeTransport, Settlement};
use crate::scenarios::settings;
use carrot_relay::bridge::{Bridge, BridgeError, PublishRequest};
use carrot_relay::client::declarations::{ExchangeDeclaration, QueueBinding, QueueDeclaration};
use carrot_relay::config::{BridgeSettings, TopologySettings};
use carrot_relay::consumers::ConsumerDescriptor;
use carrot_relay::dispatch::{ClosureExecutor, TaskExecutor, TaskPayload, TaskResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

fn acking() -> impl TaskExecutor {
    ClosureExecutor(|_payload: TaskPayload| async move {
        Ok::<_, anyhow::Error>(TaskResult::new(*b"0"))
    })
}

fn with_topology(mut settings: BridgeSettings) -> BridgeSettings {
    settings.topology = TopologySettings {
        queues: vec![QueueDeclaration::new("orders").durable(true)],
        exchanges: vec![ExchangeDeclaration::new("orders", "topic")],
        bindings: vec![QueueBinding::new("orders", "orders", "order.#")],
    };
    settings
}

#[tokio::test]
async fn the_topology_is_declared_when_connecting() {
    // Arrange
    let transport = FakeTransport::new();
    let bridge = Bridge::new(transport.clone(), with_topology(settings(vec![], 1)), acking());

    // Act
    bridge.connect().await.unwrap();

    // Assert
    assert_eq!(
        transport.declared(),
        vec![
            "queue orders (durable)".to_string(),
            "exchange orders".to_string(),
            "binding orders -> orders (order.#)".to_string(),
        ]
    );
}

#[tokio::test]
async fn a_failed_declaration_aborts_the_connection() {
    // Arrange
    let transport = FakeTransport::new();
    transport.fail_declarations_of("orders");
    let bridge = Bridge::new(transport.clone(), with_topology(settings(vec![], 1)), acking());

    // Act
    let outcome = bridge.connect().await;

    // Assert
    assert!(matches!(outcome, Err(BridgeError::Declaration { .. })));
    assert_eq!(transport.open_connections(), 0);
    assert!(matches!(bridge.client().await, Err(BridgeError::NotConnected)));
}

#[tokio::test]
async fn there_is_nothing_to_serve_without_consumers_or_workers() {
    // Arrange
    let transport = FakeTransport::new();
    let without_consumers = Bridge::new(transport.clone(), settings(vec![], 2), acking());
    let without_workers = Bridge::new(
        transport.clone(),
        settings(vec![ConsumerDescriptor::new("orders")], 0),
        acking(),
    );

    // Act
    without_consumers.serve().await.unwrap();
    without_workers.serve().await.unwrap();

    // Assert
    assert_eq!(transport.connect_attempts(), 0);
}

#[tokio::test]
async fn a_bridge_can_only_serve_once() {
    // Arrange
    let transport = FakeTransport::new();
    let bridge = Bridge::new(
        transport.clone(),
        settings(vec![ConsumerDescriptor::new("orders")], 1),
        acking(),
    );
    bridge.serve().await.unwrap();

    // Act
    let outcome = bridge.serve().await;

    // Assert
    assert!(matches!(outcome, Err(BridgeError::AlreadyServing)));
    assert_eq!(transport.consumers_of("orders"), 1);
}

#[tokio::test]
async fn stopping_waits_for_deliveries_in_flight() {
    // Arrange
    let transport = FakeTransport::new();
    let gate = Arc::new(Semaphore::new(0));
    let started = Arc::new(AtomicBool::new(false));
    let executor = {
        let (gate, started) = (Arc::clone(&gate), Arc::clone(&started));
        ClosureExecutor(move |_payload: TaskPayload| {
            let (gate, started) = (Arc::clone(&gate), Arc::clone(&started));
            async move {
                started.store(true, Ordering::SeqCst);
                let _permit = gate.acquire().await?;
                Ok::<_, anyhow::Error>(TaskResult::new(*b"0"))
            }
        })
    };
    let bridge = Arc::new(Bridge::new(
        transport.clone(),
        settings(vec![ConsumerDescriptor::new("orders")], 1),
        executor,
    ));
    bridge.serve().await.unwrap();
    transport.deliver("orders", b"in flight");
    eventually(|| started.load(Ordering::SeqCst)).await;

    // Act
    let stopping = tokio::spawn({
        let bridge = Arc::clone(&bridge);
        async move { bridge.stop().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled_while_stopping = transport.settled().len();
    let connections_while_stopping = transport.open_connections();
    gate.add_permits(1);
    stopping.await.unwrap().unwrap();

    // Assert
    assert_eq!(settled_while_stopping, 0);
    assert_eq!(connections_while_stopping, 1);
    assert_eq!(transport.consumers_of("orders"), 0);
    let settled = transport.settled();
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].settlement, Settlement::Ack);
    assert_eq!(transport.open_connections(), 0);
}

#[tokio::test]
async fn the_bridge_stops_cleanly_while_the_broker_is_unreachable() {
    // Arrange
    let transport = FakeTransport::new();
    let bridge = Bridge::new(
        transport.clone(),
        settings(vec![ConsumerDescriptor::new("orders")], 1),
        acking(),
    );
    bridge.serve().await.unwrap();
    transport.refuse_connects(true);
    transport.drop_connection();

    // Act
    let outcome = bridge.stop().await;

    // Assert
    assert!(outcome.is_ok());
    assert!(matches!(bridge.client().await, Err(BridgeError::NotConnected)));
    assert_eq!(transport.connects(), 1);
}

#[tokio::test]
async fn publishing_connects_lazily() {
    // Arrange
    let transport = FakeTransport::new();
    let bridge = Bridge::new(transport.clone(), settings(vec![], 1), acking());
    assert!(matches!(bridge.client().await, Err(BridgeError::NotConnected)));
    let request: PublishRequest = serde_json::from_value(serde_json::json!({
        "exchange": "orders",
        "key": "order.created",
        "contentType": "application/json",
        "message": "{\"id\":1}"
    }))
    .unwrap();

    // Act
    bridge.publish(request).await.unwrap();

    // Assert
    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, "orders");
    assert_eq!(published[0].routing_key, "order.created");
    assert_eq!(published[0].payload, br#"{"id":1}"#);
    assert!(bridge.client().await.is_ok());
    assert_eq!(transport.connects(), 1);
}

#[tokio::test]
async fn declaration_failures_are_returned_through_the_facade() {
    // Arrange
    let transport = FakeTransport::new();
    let bridge = Bridge::new(transport.clone(), settings(vec![], 1), acking());
    transport.fail_declarations_of("payments");

    // Act
    let outcome = bridge
        .declare_queue(QueueDeclaration::new("payments"))
        .await;

    // Assert
    assert!(matches!(outcome, Err(BridgeError::Client(_))));
    bridge
        .declare_exchange(ExchangeDeclaration::new("orders", "direct"))
        .await
        .unwrap();
    bridge
        .bind_queue(QueueBinding::new("orders", "orders", "order.created"))
        .await
        .unwrap();
}
