//! Implements the [`transport`](crate::transport) traits on top of `lapin`.
use crate::amqp::convenience::exchange_kind;
use crate::client::declarations::{ExchangeDeclaration, QueueBinding, QueueDeclaration};
use crate::consumers::{ConsumerDescriptor, Delivery};
use crate::transport::{
    Acknowledger, BrokerChannel, BrokerConnection, CloseNotification, CloseSignal, Confirmation,
    InboundDeliveries, PendingConfirm, TransportError,
};
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm, BasicProperties, ChannelState,
};
use std::sync::Arc;
use tracing::warn;

/// Reply code used to close connections and channels on purpose.
const REPLY_SUCCESS: u16 = 200;

/// A `lapin` connection, tracking its own failures.
pub struct AmqpConnection {
    connection: lapin::Connection,
    signal: CloseSignal,
}

impl AmqpConnection {
    pub(crate) fn new(connection: lapin::Connection) -> Self {
        let signal = CloseSignal::new();
        connection.on_error({
            let signal = signal.clone();
            move |error| {
                warn!(error = %error, "RabbitMQ broken connection");
                signal.fail(error.into());
            }
        });
        Self { connection, signal }
    }

    /// Access the underlying `lapin` connection.
    pub fn raw(&self) -> &lapin::Connection {
        &self.connection
    }
}

#[async_trait::async_trait]
impl BrokerConnection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn create_channel(&self) -> Result<AmqpChannel, TransportError> {
        Ok(AmqpChannel::new(self.connection.create_channel().await?))
    }

    fn close_notification(&self) -> CloseNotification {
        self.signal.notification()
    }

    fn is_closed(&self) -> bool {
        !self.signal.is_open() || !self.connection.status().connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Mark the closure as intentional before `lapin` starts tearing things down.
        self.signal.close();
        self.connection.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

/// A `lapin` channel, tracking its own failures.
#[derive(Clone)]
pub struct AmqpChannel {
    channel: lapin::Channel,
    signal: CloseSignal,
}

impl AmqpChannel {
    fn new(channel: lapin::Channel) -> Self {
        let signal = CloseSignal::new();
        channel.on_error({
            let signal = signal.clone();
            move |error| signal.fail(error.into())
        });
        Self { channel, signal }
    }

    /// Access the underlying `lapin` channel.
    pub fn raw(&self) -> &lapin::Channel {
        &self.channel
    }

    fn into_delivery(&self, delivery: lapin::message::Delivery) -> Delivery {
        let lapin::message::Delivery {
            delivery_tag,
            exchange,
            routing_key,
            redelivered,
            properties,
            data,
            acker,
            ..
        } = delivery;
        let acker = AmqpAcknowledger {
            acker,
            channel: self.clone(),
        };
        let mut delivery = Delivery::new(delivery_tag, data, Arc::new(acker));
        delivery.exchange = exchange;
        delivery.routing_key = routing_key;
        delivery.redelivered = redelivered;
        delivery.properties = properties;
        delivery
    }
}

#[async_trait::async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_closed(&self) -> bool {
        !self.signal.is_open() || !matches!(self.channel.status().state(), ChannelState::Connected)
    }

    async fn confirm_select(&self) -> Result<(), TransportError> {
        self.channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await?;
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PendingConfirm, TransportError> {
        let confirm = self
            .channel
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await?;
        Ok(Box::pin(async move {
            let confirmation = match confirm.await? {
                publisher_confirm::Confirmation::Ack(None) => Confirmation::Ack,
                publisher_confirm::Confirmation::Ack(Some(returned)) => Confirmation::Returned {
                    reply_code: returned.reply_code,
                    reply_text: returned.reply_text.as_str().to_owned(),
                },
                publisher_confirm::Confirmation::Nack(_) => Confirmation::Nack,
                publisher_confirm::Confirmation::NotRequested => Confirmation::NotRequested,
            };
            Ok(confirmation)
        }))
    }

    async fn exchange_declare(
        &self,
        declaration: &ExchangeDeclaration,
    ) -> Result<(), TransportError> {
        self.channel
            .exchange_declare(
                &declaration.name,
                exchange_kind(&declaration.kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: declaration.durable,
                    auto_delete: declaration.auto_delete,
                    internal: declaration.internal,
                    nowait: declaration.no_wait,
                },
                declaration.args.clone(),
            )
            .await?;
        Ok(())
    }

    async fn queue_declare(&self, declaration: &QueueDeclaration) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                &declaration.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: declaration.durable,
                    exclusive: declaration.exclusive,
                    auto_delete: declaration.auto_delete,
                    nowait: declaration.no_wait,
                },
                declaration.args.clone(),
            )
            .await?;
        Ok(())
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions {
                    nowait: binding.no_wait,
                },
                binding.args.clone(),
            )
            .await?;
        Ok(())
    }

    async fn basic_consume(
        &self,
        descriptor: &ConsumerDescriptor,
    ) -> Result<InboundDeliveries, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                &descriptor.queue,
                &descriptor.consumer_tag,
                BasicConsumeOptions {
                    no_local: descriptor.no_local,
                    no_ack: descriptor.auto_ack,
                    exclusive: descriptor.exclusive,
                    nowait: descriptor.no_wait,
                },
                descriptor.consume_arguments(),
            )
            .await?;
        let channel = self.clone();
        Ok(consumer
            .map(move |delivery| {
                delivery
                    .map(|delivery| channel.into_delivery(delivery))
                    .map_err(TransportError::from)
            })
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    fn close_notification(&self) -> CloseNotification {
        self.signal.notification()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.signal.close();
        self.channel.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

/// Settles deliveries received on an [`AmqpChannel`].
struct AmqpAcknowledger {
    acker: Acker,
    channel: AmqpChannel,
}

#[async_trait::async_trait]
impl Acknowledger for AmqpAcknowledger {
    async fn ack(&self, multiple: bool) -> Result<(), TransportError> {
        self.acker.ack(BasicAckOptions { multiple }).await?;
        Ok(())
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), TransportError> {
        self.acker
            .nack(BasicNackOptions { multiple, requeue })
            .await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }

    fn is_channel_closed(&self) -> bool {
        self.channel.is_closed()
    }
}
