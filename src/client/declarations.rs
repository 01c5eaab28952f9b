//! Exchange, queue and binding declarations.
//!
//! Declarations reuse pooled channels: each one acquires a channel, issues a single verb and
//! hands the channel back. A channel the broker closed because of a failed declaration (e.g.
//! `PRECONDITION_FAILED` on a mismatched queue) is not returned to the pool.
use crate::amqp::convenience::deserialize_field_table;
use crate::client::{Client, ClientError};
use crate::transport::{BrokerChannel, Transport};
use amq_protocol_types::FieldTable;
use serde::Deserialize;

/// Declare an exchange.
///
/// `kind` is one of `direct`, `fanout`, `topic`, `headers` or the name of a plugin-provided
/// exchange type (e.g. `x-delayed-message`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExchangeDeclaration {
    pub name: String,
    #[serde(alias = "type")]
    pub kind: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default, alias = "autoDelete")]
    pub auto_delete: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default, alias = "noWait")]
    pub no_wait: bool,
    #[serde(default, deserialize_with = "deserialize_field_table")]
    pub args: FieldTable,
}

impl ExchangeDeclaration {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            durable: false,
            auto_delete: false,
            internal: false,
            no_wait: false,
            args: FieldTable::default(),
        }
    }

    #[must_use]
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }
}

/// Declare a queue.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueDeclaration {
    pub name: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default, alias = "autoDelete")]
    pub auto_delete: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default, alias = "noWait")]
    pub no_wait: bool,
    /// Queue arguments, e.g. `x-message-ttl` or `x-dead-letter-exchange`.
    #[serde(default, deserialize_with = "deserialize_field_table")]
    pub args: FieldTable,
}

impl QueueDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            auto_delete: false,
            exclusive: false,
            no_wait: false,
            args: FieldTable::default(),
        }
    }

    #[must_use]
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }
}

/// Bind a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueBinding {
    pub queue: String,
    pub exchange: String,
    #[serde(default, alias = "key", alias = "routingKey")]
    pub routing_key: String,
    #[serde(default, alias = "noWait")]
    pub no_wait: bool,
    #[serde(default, deserialize_with = "deserialize_field_table")]
    pub args: FieldTable,
}

impl QueueBinding {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            no_wait: false,
            args: FieldTable::default(),
        }
    }
}

impl<T: Transport> Client<T> {
    #[tracing::instrument(skip_all, fields(exchange = %declaration.name, kind = %declaration.kind))]
    pub async fn declare_exchange(
        &self,
        declaration: &ExchangeDeclaration,
    ) -> Result<(), ClientError> {
        let channel = self.acquire_channel().await?;
        let outcome = channel.exchange_declare(declaration).await;
        self.release_channel(channel);
        outcome.map_err(ClientError::Broker)
    }

    #[tracing::instrument(skip_all, fields(queue = %declaration.name))]
    pub async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), ClientError> {
        let channel = self.acquire_channel().await?;
        let outcome = channel.queue_declare(declaration).await;
        self.release_channel(channel);
        outcome.map_err(ClientError::Broker)
    }

    #[tracing::instrument(
        skip_all,
        fields(queue = %binding.queue, exchange = %binding.exchange, routing_key = %binding.routing_key)
    )]
    pub async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), ClientError> {
        let channel = self.acquire_channel().await?;
        let outcome = channel.queue_bind(binding).await;
        self.release_channel(channel);
        outcome.map_err(ClientError::Broker)
    }
}
