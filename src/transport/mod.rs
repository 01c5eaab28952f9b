//! The seam between the relay and the broker.
//!
//! The relay never talks to `lapin` directly: connection management, channel pooling,
//! publishing, consuming and acknowledging all go through the traits in this module.
//! [`ConnectionFactory`](crate::amqp::ConnectionFactory) is the production implementation;
//! the integration tests drive the exact same code paths with an in-memory broker.
mod error;

pub use error::TransportError;

use crate::client::declarations::{ExchangeDeclaration, QueueBinding, QueueDeclaration};
use crate::consumers::{ConsumerDescriptor, Delivery};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use lapin::options::BasicPublishOptions;
use lapin::BasicProperties;
use std::sync::Arc;
use tokio::sync::watch;

/// Why a connection or a channel went away, if it failed.
pub type CloseReason = Arc<TransportError>;

/// Resolves once the connection (or channel) it was obtained from is closed.
///
/// It yields `None` on a graceful, intentional closure and `Some(reason)` when the underlying
/// resource failed.
pub type CloseNotification = BoxFuture<'static, Option<CloseReason>>;

/// The broker's answer to a single publishing, resolved once it arrives.
///
/// It fails if the confirmation feed is torn down before the broker answers.
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation, TransportError>>;

/// The raw stream of deliveries pushed by the broker for a single `basic.consume`.
pub type InboundDeliveries = BoxStream<'static, Result<Delivery, TransportError>>;

/// The outcome of a publishing on a channel in confirm mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// The broker took responsibility for the message.
    Ack,
    /// The broker acked the message but returned it first (mandatory publishing).
    Returned { reply_code: u16, reply_text: String },
    /// The broker refused the message.
    Nack,
    /// The channel is not in confirm mode.
    NotRequested,
}

/// `Transport` opens connections to a broker.
///
/// An implementation holds everything required to (re)connect - address, credentials, TLS
/// configuration - since the [`Client`](crate::client::Client) calls [`Transport::connect`]
/// again every time the live connection is lost.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Channel: BrokerChannel;
    type Connection: BrokerConnection<Channel = Self::Channel>;

    /// Establish a new connection.
    async fn connect(&self) -> Result<Self::Connection, TransportError>;
}

/// A live connection to the broker.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    /// Open a new channel multiplexed on this connection.
    async fn create_channel(&self) -> Result<Self::Channel, TransportError>;

    /// Get notified when this connection closes.
    fn close_notification(&self) -> CloseNotification;

    /// `true` once the connection has failed or has been closed.
    fn is_closed(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A channel opened on a [`BrokerConnection`].
///
/// Cloning a channel yields another handle to the same underlying channel.
#[async_trait::async_trait]
pub trait BrokerChannel: Clone + Send + Sync + 'static {
    /// `true` once the channel has been closed, gracefully or not.
    fn is_closed(&self) -> bool;

    /// Put the channel in confirm mode.
    async fn confirm_select(&self) -> Result<(), TransportError>;

    /// Limit the number of unacknowledged deliveries pushed on this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PendingConfirm, TransportError>;

    async fn exchange_declare(
        &self,
        declaration: &ExchangeDeclaration,
    ) -> Result<(), TransportError>;

    async fn queue_declare(&self, declaration: &QueueDeclaration) -> Result<(), TransportError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), TransportError>;

    /// Start consuming from the queue described by `descriptor`.
    async fn basic_consume(
        &self,
        descriptor: &ConsumerDescriptor,
    ) -> Result<InboundDeliveries, TransportError>;

    /// Stop the consumer identified by `consumer_tag`, leaving the channel open.
    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    /// Get notified when this channel closes.
    fn close_notification(&self) -> CloseNotification;

    /// Close the channel gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}

/// The capability to settle a single delivery with the broker.
///
/// Each transport binding provides its own implementation, attached to every
/// [`Delivery`] it produces.
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    async fn ack(&self, multiple: bool) -> Result<(), TransportError>;

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), TransportError>;

    async fn reject(&self, requeue: bool) -> Result<(), TransportError>;

    /// `true` if the channel the delivery arrived on is already closed: settling the delivery
    /// is then impossible.
    fn is_channel_closed(&self) -> bool;
}

#[derive(Debug, Clone)]
enum Lifecycle {
    Open,
    Closed,
    Failed(CloseReason),
}

/// Tracks whether a connection or a channel is still open and hands out
/// [`CloseNotification`]s.
///
/// Transitions are one-way: the first call to [`CloseSignal::close`] or
/// [`CloseSignal::fail`] wins, later calls are ignored.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    lifecycle: Arc<watch::Sender<Lifecycle>>,
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseSignal {
    pub fn new() -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle::Open);
        Self {
            lifecycle: Arc::new(lifecycle),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.lifecycle.borrow(), Lifecycle::Open)
    }

    /// Record a graceful closure.
    pub fn close(&self) {
        self.transition(Lifecycle::Closed);
    }

    /// Record a failure.
    pub fn fail(&self, reason: TransportError) {
        self.transition(Lifecycle::Failed(Arc::new(reason)));
    }

    fn transition(&self, next: Lifecycle) {
        self.lifecycle.send_if_modified(|current| match current {
            Lifecycle::Open => {
                *current = next;
                true
            }
            _ => false,
        });
    }

    pub fn notification(&self) -> CloseNotification {
        let mut lifecycle = self.lifecycle.subscribe();
        Box::pin(async move {
            loop {
                let current = lifecycle.borrow_and_update().clone();
                match current {
                    Lifecycle::Open => {}
                    Lifecycle::Closed => return None,
                    Lifecycle::Failed(reason) => return Some(reason),
                }
                if lifecycle.changed().await.is_err() {
                    return None;
                }
            }
        })
    }
}
