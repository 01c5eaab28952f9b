use crate::fakes::{ConfirmMode, FakeTransport};
use carrot_relay::client::Client;
use carrot_relay::publishers::{MessageEnvelope, PublisherError};
use std::time::Duration;

fn envelope() -> MessageEnvelope {
    MessageEnvelope::new("orders", "order.created", r#"{"id":1}"#)
}

#[tokio::test]
async fn channels_are_reused_across_publishings() {
    // Arrange
    let transport = FakeTransport::new();
    let client = Client::dial(transport.clone()).await.unwrap();

    // Act
    for _ in 0..5 {
        client.publish(envelope()).await.unwrap();
    }

    // Assert
    assert_eq!(transport.channels_opened(), 1);
    assert_eq!(client.idle_channels(), 1);
}

#[tokio::test(start_paused = true)]
async fn channels_idle_for_more_than_a_minute_are_not_reused() {
    // Arrange
    let transport = FakeTransport::new();
    let client = Client::dial(transport.clone()).await.unwrap();
    client.publish(envelope()).await.unwrap();

    // Act
    tokio::time::advance(Duration::from_secs(61)).await;
    client.publish(envelope()).await.unwrap();

    // Assert
    assert_eq!(transport.channels_opened(), 2);
    assert_eq!(client.idle_channels(), 1);
}

#[tokio::test(start_paused = true)]
async fn the_idle_threshold_can_be_tuned() {
    // Arrange
    let transport = FakeTransport::new();
    let client = Client::builder(transport.clone())
        .channel_max_idle(Duration::from_secs(5 * 60))
        .dial()
        .await
        .unwrap();
    client.publish(envelope()).await.unwrap();

    // Act
    tokio::time::advance(Duration::from_secs(61)).await;
    client.publish(envelope()).await.unwrap();

    // Assert
    assert_eq!(transport.channels_opened(), 1);
}

#[tokio::test]
async fn closed_channels_are_not_returned_to_the_pool() {
    // Arrange
    let transport = FakeTransport::new();
    let client = Client::dial(transport.clone()).await.unwrap();
    transport.confirm_with(ConfirmMode::Drop);

    // Act
    let outcome = client.publish(envelope()).await;

    // Assert
    assert!(matches!(
        outcome,
        Err(PublisherError::ConfirmationChannelClosed(_))
    ));
    assert_eq!(client.idle_channels(), 0);

    transport.confirm_with(ConfirmMode::Ack);
    client.publish(envelope()).await.unwrap();
    assert_eq!(transport.channels_opened(), 2);
}

#[tokio::test]
async fn channels_broken_by_a_connection_failure_are_skipped() {
    // Arrange
    let transport = FakeTransport::new();
    let client = Client::builder(transport.clone())
        .reconnect_interval(Duration::from_millis(10))
        .dial()
        .await
        .unwrap();
    client.publish(envelope()).await.unwrap();

    // Act
    transport.drop_connection();
    crate::fakes::eventually(|| transport.connects() == 2).await;
    client.publish(envelope()).await.unwrap();

    // Assert
    assert_eq!(transport.channels_opened(), 2);
    assert_eq!(transport.published().len(), 2);
}
