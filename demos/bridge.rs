use carrot_relay::amqp::configuration::RabbitMqSettings;
use carrot_relay::bridge::{Bridge, PublishRequest};
use carrot_relay::client::declarations::QueueDeclaration;
use carrot_relay::config::{BridgeSettings, TopologySettings, WorkerPoolSettings};
use carrot_relay::consumers::ConsumerDescriptor;
use carrot_relay::dispatch::{ClosureExecutor, TaskPayload, TaskResult, STATUS_ACK, STATUS_REJECT};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // We are using the out-of-the-box parameters for the default RabbitMq Docker image.
    let settings = BridgeSettings {
        amqp: RabbitMqSettings::default(),
        client: Default::default(),
        // Four workers shared by every consumer.
        pool: Some(WorkerPoolSettings::with_workers(4)),
        // At most two "orders" deliveries are processed at any point in time.
        consumers: vec![ConsumerDescriptor::new("orders")
            .with_prefetch(10)
            .with_concurrency(2)],
        topology: TopologySettings {
            queues: vec![QueueDeclaration::new("orders")],
            ..Default::default()
        },
    };

    // The executor answers with a single status byte: ack well-formed orders, reject the rest.
    let executor = ClosureExecutor(|payload: TaskPayload| async move {
        let status = match serde_json::from_slice::<serde_json::Value>(&payload.body) {
            Ok(order) if order.get("id").is_some() => STATUS_ACK,
            _ => STATUS_REJECT,
        };
        Ok::<_, anyhow::Error>(TaskResult::new(vec![status]))
    });

    let bridge = Bridge::from_settings(settings, executor)?;

    // Publishing goes through the default exchange, straight into our queue.
    bridge
        .publish(PublishRequest {
            exchange: "".into(),
            key: "orders".into(),
            content_type: "application/json".into(),
            message: r#"{"id":1}"#.into(),
            headers: None,
        })
        .await?;

    // Serve until Ctrl+C: in-flight deliveries are settled before the connection is closed.
    bridge.run_until_signal().await?;
    Ok(())
}
