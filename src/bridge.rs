//! The lifecycle of the relay: connect, declare the topology, serve the configured consumers,
//! stop gracefully.
//!
//! [`Bridge`] also exposes the operations a host application needs to forward requests to the
//! broker: [`Bridge::publish`], [`Bridge::declare_exchange`], [`Bridge::declare_queue`] and
//! [`Bridge::bind_queue`]. They return the errors of the underlying operations unchanged.
use crate::amqp::convenience::json_to_field_table;
use crate::amqp::ConnectionFactory;
use crate::client::declarations::{ExchangeDeclaration, QueueBinding, QueueDeclaration};
use crate::client::{Client, ClientError, ClientState};
use crate::config::{BridgeSettings, TopologySettings};
use crate::consumers::{Consumer, ConsumerError};
use crate::dispatch::{TaskExecutor, WorkerPool};
use crate::publishers::{MessageEnvelope, PublisherError};
use crate::transport::Transport;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Publish(#[from] PublisherError),
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
    #[error("Failed to declare {entity}")]
    Declaration {
        entity: String,
        #[source]
        source: ClientError,
    },
    #[error("The bridge is already serving")]
    AlreadyServing,
    #[error("The bridge is not connected to RabbitMq")]
    NotConnected,
    #[error("Failed to listen for shutdown signals")]
    Signal(#[source] std::io::Error),
}

/// A message to publish, as received from the host application.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublishRequest {
    pub exchange: String,
    #[serde(default, alias = "routingKey", alias = "routing_key")]
    pub key: String,
    #[serde(default, rename = "contentType", alias = "content_type")]
    pub content_type: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub headers: Option<serde_json::Map<String, serde_json::Value>>,
}

impl PublishRequest {
    pub fn into_envelope(self) -> MessageEnvelope {
        let mut envelope = MessageEnvelope::new(self.exchange, self.key, self.message);
        if !self.content_type.is_empty() {
            envelope = envelope.with_content_type(self.content_type.into());
        }
        if let Some(headers) = self.headers {
            envelope = envelope.with_headers(json_to_field_table(&headers));
        }
        envelope
    }
}

/// Connects a RabbitMq broker to a [`TaskExecutor`].
///
/// The connection is established lazily, by [`Bridge::serve`] or by the first facade
/// operation, and the configured topology is declared right after connecting.
pub struct Bridge<T: Transport + Clone> {
    transport: T,
    settings: BridgeSettings,
    executor: Arc<dyn TaskExecutor>,
    state: Mutex<State<T>>,
}

struct State<T: Transport> {
    client: Option<Client<T>>,
    serving: Option<Serving<T>>,
}

struct Serving<T: Transport> {
    workers: WorkerPool,
    consumers: Vec<Consumer<T>>,
}

impl<T: Transport> Serving<T> {
    /// Stop consuming, let the workers finish what they have in flight, then close the
    /// consumer channels.
    async fn shutdown(self) {
        for consumer in &self.consumers {
            if let Err(e) = consumer.cancel().await {
                warn!(queue = %consumer.descriptor().queue, error = ?e, "Failed to cancel consumer");
            }
        }
        self.workers.wait_close().await;
        for consumer in &self.consumers {
            if let Err(e) = consumer.close().await {
                warn!(queue = %consumer.descriptor().queue, error = ?e, "Failed to close consumer");
            }
        }
    }
}

impl Bridge<ConnectionFactory> {
    /// Build a bridge connecting to the broker described by `settings.amqp`.
    pub fn from_settings(
        settings: BridgeSettings,
        executor: impl TaskExecutor,
    ) -> Result<Self, anyhow::Error> {
        let factory = ConnectionFactory::new_from_config(&settings.amqp)?;
        Ok(Self::new(factory, settings, executor))
    }
}

impl<T: Transport + Clone> Bridge<T> {
    pub fn new(transport: T, settings: BridgeSettings, executor: impl TaskExecutor) -> Self {
        Self {
            transport,
            settings,
            executor: Arc::new(executor),
            state: Mutex::new(State {
                client: None,
                serving: None,
            }),
        }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// The live client, if the bridge is connected.
    pub async fn client(&self) -> Result<Client<T>, BridgeError> {
        let state = self.state.lock().await;
        match &state.client {
            Some(client) if client.state() == ClientState::Open => Ok(client.clone()),
            _ => Err(BridgeError::NotConnected),
        }
    }

    /// Connect (and declare the topology) unless already connected.
    pub async fn connect(&self) -> Result<Client<T>, BridgeError> {
        let mut state = self.state.lock().await;
        self.connected(&mut state).await
    }

    async fn connected(&self, state: &mut State<T>) -> Result<Client<T>, BridgeError> {
        if let Some(client) = &state.client {
            if client.state() == ClientState::Open {
                return Ok(client.clone());
            }
        }

        let settings = &self.settings.client;
        let client = Client::builder(self.transport.clone())
            .reconnect_interval(settings.reconnect_interval())
            .publish_timeout(settings.publish_timeout())
            .channel_max_idle(settings.channel_max_idle())
            .dial()
            .await?;
        if let Err(e) = declare(&client, &self.settings.topology).await {
            if let Err(close_error) = client.close().await {
                debug!(error = %close_error, "Failed to close the client after a failed declaration");
            }
            return Err(e);
        }
        state.client = Some(client.clone());
        Ok(client)
    }

    /// Start consuming from the configured queues.
    ///
    /// Without a worker pool (or with zero workers) or without consumers, there is nothing to
    /// serve and `serve` returns immediately.
    #[tracing::instrument(name = "bridge_serve", skip(self))]
    pub async fn serve(&self) -> Result<(), BridgeError> {
        let mut state = self.state.lock().await;
        if state.serving.is_some() {
            return Err(BridgeError::AlreadyServing);
        }
        let pool = match &self.settings.pool {
            Some(pool) if pool.num_workers > 0 && !self.settings.consumers.is_empty() => pool,
            _ => {
                info!("No worker pool or no consumers configured, nothing to serve");
                return Ok(());
            }
        };

        let client = self.connected(&mut state).await?;
        let workers = WorkerPool::new(Arc::clone(&self.executor), pool);
        let mut consumers = Vec::with_capacity(self.settings.consumers.len());
        for descriptor in &self.settings.consumers {
            let consumer = client.consumer(descriptor.clone());
            match consumer.consume().await {
                Ok(deliveries) => {
                    workers.attach(deliveries, Arc::clone(consumer.descriptor()));
                    consumers.push(consumer);
                }
                Err(e) => {
                    Serving { workers, consumers }.shutdown().await;
                    return Err(e.into());
                }
            }
        }
        info!(consumers = consumers.len(), "Serving");
        state.serving = Some(Serving { workers, consumers });
        Ok(())
    }

    /// Stop gracefully.
    ///
    /// Consumers are cancelled first, deliveries in flight are processed and settled, then the
    /// consumer channels and finally the connection are closed.
    #[tracing::instrument(name = "bridge_stop", skip(self))]
    pub async fn stop(&self) -> Result<(), BridgeError> {
        let mut state = self.state.lock().await;
        if let Some(serving) = state.serving.take() {
            serving.shutdown().await;
        }
        if let Some(client) = state.client.take() {
            client.close().await?;
        }
        info!("Bridge stopped");
        Ok(())
    }

    /// Serve until `shutdown` resolves, then stop.
    pub async fn run_until_shutdown(
        &self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), BridgeError> {
        self.serve().await?;
        shutdown.await;
        info!("Shutdown requested");
        self.stop().await
    }

    /// Serve until the process receives `SIGINT` (or `SIGTERM`, on Unix), then stop.
    pub async fn run_until_signal(&self) -> Result<(), BridgeError> {
        self.serve().await?;
        shutdown_signal().await.map_err(BridgeError::Signal)?;
        info!("Shutdown signal received");
        self.stop().await
    }

    pub async fn publish(&self, request: PublishRequest) -> Result<(), BridgeError> {
        let client = self.connect().await?;
        client.publish(request.into_envelope()).await?;
        Ok(())
    }

    pub async fn declare_exchange(
        &self,
        declaration: ExchangeDeclaration,
    ) -> Result<(), BridgeError> {
        let client = self.connect().await?;
        client.declare_exchange(&declaration).await?;
        Ok(())
    }

    pub async fn declare_queue(&self, declaration: QueueDeclaration) -> Result<(), BridgeError> {
        let client = self.connect().await?;
        client.declare_queue(&declaration).await?;
        Ok(())
    }

    pub async fn bind_queue(&self, binding: QueueBinding) -> Result<(), BridgeError> {
        let client = self.connect().await?;
        client.bind_queue(&binding).await?;
        Ok(())
    }
}

/// Declare queues, then exchanges, then bindings. The first failure stops the declaration.
async fn declare<T: Transport>(
    client: &Client<T>,
    topology: &TopologySettings,
) -> Result<(), BridgeError> {
    for queue in &topology.queues {
        debug!(queue = %queue.name, "Declaring queue");
        client
            .declare_queue(queue)
            .await
            .map_err(|source| BridgeError::Declaration {
                entity: format!("queue {}", queue.name),
                source,
            })?;
    }
    for exchange in &topology.exchanges {
        debug!(exchange = %exchange.name, "Declaring exchange");
        client
            .declare_exchange(exchange)
            .await
            .map_err(|source| BridgeError::Declaration {
                entity: format!("exchange {}", exchange.name),
                source,
            })?;
    }
    for binding in &topology.bindings {
        debug!(queue = %binding.queue, exchange = %binding.exchange, "Binding queue");
        client
            .bind_queue(binding)
            .await
            .map_err(|source| BridgeError::Declaration {
                entity: format!(
                    "binding of queue {} to exchange {}",
                    binding.queue, binding.exchange
                ),
                source,
            })?;
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<(), std::io::Error> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        outcome = tokio::signal::ctrl_c() => outcome,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<(), std::io::Error> {
    tokio::signal::ctrl_c().await
}
