use crate::amqp::AMQPProperties;
use crate::transport::{Acknowledger, TransportError};
use amq_protocol_types::ShortString;
use futures_util::Stream;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// A message pushed by the broker to one of our consumers.
///
/// A delivery carries the capability to settle itself with the broker: call exactly one of
/// [`Delivery::ack`], [`Delivery::nack`] or [`Delivery::reject`] once it has been processed.
/// A delivery that is never settled is redelivered by the broker once its channel closes.
pub struct Delivery {
    /// Identifies the delivery on the channel it was received from.
    pub delivery_tag: u64,
    /// The exchange the message was originally published to.
    pub exchange: ShortString,
    pub routing_key: ShortString,
    /// `true` if the broker already tried to deliver this message.
    pub redelivered: bool,
    /// AMQP properties, headers included.
    pub properties: AMQPProperties,
    /// The body of the message - as a sequence of bytes.
    pub data: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, data: Vec<u8>, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            delivery_tag,
            exchange: ShortString::default(),
            routing_key: ShortString::default(),
            redelivered: false,
            properties: AMQPProperties::default(),
            data,
            acker,
        }
    }

    /// Positive acknowledgement: the message can be removed from the queue.
    pub async fn ack(&self) -> Result<(), TransportError> {
        self.acker.ack(false).await
    }

    /// Negative acknowledgement: the broker requeues the message if `requeue` is `true`,
    /// dead-letters or discards it otherwise.
    pub async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker.nack(false, requeue).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker.reject(requeue).await
    }

    /// `true` if the channel this delivery arrived on has been closed in the meantime.
    ///
    /// Deliveries from a closed channel cannot be settled: the broker has already requeued them.
    pub fn is_channel_closed(&self) -> bool {
        self.acker.is_channel_closed()
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("data", &self.data.len())
            .finish_non_exhaustive()
    }
}

/// The stream of deliveries produced by a [`Consumer`](super::Consumer).
///
/// It survives channel failures: deliveries received after a redial keep flowing through the
/// same stream. It ends once the consumer has been closed (or cancelled) and every delivery
/// already received has been yielded.
#[derive(Debug)]
pub struct Deliveries {
    receiver: mpsc::Receiver<Delivery>,
}

impl Deliveries {
    pub(crate) fn new(receiver: mpsc::Receiver<Delivery>) -> Self {
        Self { receiver }
    }

    /// Wait for the next delivery. `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

impl Stream for Deliveries {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Delivery>> {
        self.receiver.poll_recv(cx)
    }
}
