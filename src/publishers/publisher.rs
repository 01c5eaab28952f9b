use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::{timeout_at, Instant};
use tracing::warn;
use uuid::Uuid;

use crate::amqp::options::BasicPublishOptions;
use crate::client::Client;
use crate::publishers::MessageEnvelope;
use crate::transport::{BrokerChannel, Confirmation, Transport, TransportError};

/// Reply code used by the broker when a mandatory message cannot be routed to any queue.
const NO_ROUTE: u16 = 312;

/// Persistent delivery mode: the broker writes the message to disk.
const PERSISTENT: u8 = 2;

/// Error returned when trying to publish a message using [`Client::publish`].
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("Generic error encountered when interacting with the RabbitMq broker")]
    GenericError(#[source] anyhow::Error),
    #[error("The timeout threshold was reached while trying to publish the message")]
    TimeoutError,
    #[error("The channel was closed before the broker confirmed the publishing")]
    ConfirmationChannelClosed(#[source] TransportError),
    /// The broker returned a mandatory (or immediate) message. The reply code is 312
    /// (`NO_ROUTE`) when no queue is bound to the exchange with a matching routing key.
    #[error("The message could not be routed: {reply_code} {reply_text}")]
    UnroutableMessage { reply_code: u16, reply_text: String },
    #[error("The RabbitMq broker nacked the publishing of the message")]
    NegativeAck,
}

impl PublisherError {
    /// `true` if the broker returned the message because no queue could receive it.
    pub fn is_no_route(&self) -> bool {
        matches!(self, Self::UnroutableMessage { reply_code, .. } if *reply_code == NO_ROUTE)
    }
}

impl<T: Transport> Client<T> {
    /// Publish a message to RabbitMq and wait for the broker to confirm it.
    ///
    /// The message is neither mandatory nor immediate. See [`Client::publish_with_options`].
    pub async fn publish(&self, envelope: MessageEnvelope) -> Result<(), PublisherError> {
        self.publish_with_options(envelope, BasicPublishOptions::default())
            .await
    }

    /// Publish a message to RabbitMq and wait for the broker to confirm it.
    ///
    /// A `timestamp` and a `message_id` are injected when missing and messages are always
    /// published as persistent.
    ///
    /// Acquiring a channel waits for the connection to be healed if it is being replaced.
    /// The publishing itself and the confirmation are then bound by the client's publish
    /// timeout (1 minute unless configured otherwise).
    #[tracing::instrument(
        name = "publish",
        skip_all,
        fields(exchange = %envelope.exchange_name, routing_key = %envelope.routing_key)
    )]
    pub async fn publish_with_options(
        &self,
        envelope: MessageEnvelope,
        options: BasicPublishOptions,
    ) -> Result<(), PublisherError> {
        // Inject the current timestamp and a message_id to the message envelope
        let envelope = inject_amqp_properties(envelope);

        let channel = self.acquire_channel().await.map_err(|e| {
            PublisherError::GenericError(anyhow::Error::new(e).context(
                "Failed to acquire a healthy channel when trying to publish to RabbitMq",
            ))
        })?;

        let deadline = Instant::now() + self.publish_timeout();
        let outcome = match timeout_at(deadline, publish(&channel, envelope, options)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PublisherError::TimeoutError),
        };

        self.release_channel(channel);
        outcome
    }
}

async fn publish<C: BrokerChannel>(
    channel: &C,
    envelope: MessageEnvelope,
    options: BasicPublishOptions,
) -> Result<(), PublisherError> {
    let MessageEnvelope {
        payload,
        exchange_name,
        routing_key,
        properties,
    } = envelope;

    let confirm = channel
        .basic_publish(
            &exchange_name,
            &routing_key,
            options,
            &payload,
            properties.unwrap_or_default(),
        )
        .await
        .map_err(|e| PublisherError::GenericError(e.into()))?;

    match confirm
        .await
        .map_err(PublisherError::ConfirmationChannelClosed)?
    {
        Confirmation::Ack | Confirmation::NotRequested => Ok(()),
        Confirmation::Returned {
            reply_code,
            reply_text,
        } => Err(PublisherError::UnroutableMessage {
            reply_code,
            reply_text,
        }),
        Confirmation::Nack => Err(PublisherError::NegativeAck),
    }
}

fn inject_amqp_properties(mut envelope: MessageEnvelope) -> MessageEnvelope {
    let current_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|ct| ct.as_secs());

    let props = envelope.properties.unwrap_or_default();
    let props = if let Some(ct) = current_timestamp {
        let ts = *props.timestamp();
        props.with_timestamp(ts.unwrap_or(ct))
    } else {
        warn!("System time is before 1970");
        props
    };

    let message_id = props.message_id().clone();
    envelope.properties = Some(
        props
            .with_message_id(message_id.unwrap_or_else(|| Uuid::new_v4().to_string().into()))
            .with_delivery_mode(PERSISTENT),
    );

    envelope
}
