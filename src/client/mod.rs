//! The connection manager.
//!
//! [`Client`] owns the single broker connection of the relay. It heals the connection when it
//! drops, hands out channels from a [`ChannelPool`] for publishing and declarations, and opens
//! dedicated channels for [`Consumer`]s.
//!
//! # Fault tolerance
//!
//! A supervisor task waits for the connection to close. A graceful closure ends supervision.
//! A failure makes the supervisor take the connection lock and try to reconnect every
//! `reconnect_interval` until it succeeds or the client is closed: operations that need the
//! connection in the meantime wait for the lock, so they observe either the old connection or
//! the healed one, never a half-replaced state.
pub mod declarations;

use crate::consumers::{Consumer, ConsumerDescriptor};
use crate::pool::{ChannelPool, DEFAULT_MAX_IDLE};
use crate::transport::{
    BrokerChannel, BrokerConnection, CloseNotification, Transport, TransportError,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors returned by the connection manager.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("Failed to connect to the RabbitMq broker")]
    Connect(#[source] TransportError),
    #[error("Failed to open a channel")]
    Channel(#[source] TransportError),
    /// The broker refused an operation. The underlying error is returned unchanged.
    #[error(transparent)]
    Broker(TransportError),
    #[error("The client has been closed")]
    Closed,
}

/// The lifecycle of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Open = 0,
    /// [`Client::close`] has been called but has not completed yet.
    Closing = 1,
    Closed = 2,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// A handle to the broker connection. Cheap to clone: all clones share the same connection.
///
/// # How do I build a `Client`?
///
/// The starting point is [`Client::builder`]:
///
/// ```rust,no_run
/// use carrot_relay::amqp::{configuration::RabbitMqSettings, ConnectionFactory};
/// use carrot_relay::client::Client;
/// use std::time::Duration;
///
/// # async fn connect() -> Result<(), anyhow::Error> {
/// let factory = ConnectionFactory::new_from_config(&RabbitMqSettings::default())?;
/// let client = Client::builder(factory)
///     .reconnect_interval(Duration::from_secs(1))
///     .dial()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Client<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T: Transport> {
    transport: T,
    connection: Mutex<Arc<T::Connection>>,
    pool: ChannelPool<T::Channel>,
    state: AtomicU8,
    /// Wakes the supervisor up from its reconnection back-off.
    wake: Notify,
    reconnect_interval: Duration,
    publish_timeout: Duration,
    channel_max_idle: Duration,
}

impl<T: Transport> Inner<T> {
    fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn is_open(&self) -> bool {
        self.state() == ClientState::Open
    }
}

/// A builder for [`Client`].
///
/// Use [`Client::builder`] as entrypoint.
pub struct ClientBuilder<T: Transport> {
    transport: T,
    reconnect_interval: Duration,
    publish_timeout: Duration,
    channel_max_idle: Duration,
}

impl<T: Transport> ClientBuilder<T> {
    /// How long to wait between two reconnection attempts.
    /// Defaults to 3 seconds if left unspecified.
    #[must_use]
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Deadline for publishing a message and receiving the broker confirmation.
    /// Defaults to 1 minute if left unspecified.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Pooled channels idle for longer than this are closed instead of being reused.
    /// Defaults to 1 minute if left unspecified.
    #[must_use]
    pub fn channel_max_idle(mut self, max_idle: Duration) -> Self {
        self.channel_max_idle = max_idle;
        self
    }

    /// Connect to the broker and start supervising the connection.
    #[tracing::instrument(name = "client_dial", skip(self))]
    pub async fn dial(self) -> Result<Client<T>, ClientError> {
        let connection = self
            .transport
            .connect()
            .await
            .map_err(ClientError::Connect)?;
        let notification = connection.close_notification();
        let inner = Arc::new(Inner {
            transport: self.transport,
            connection: Mutex::new(Arc::new(connection)),
            pool: ChannelPool::new(),
            state: AtomicU8::new(ClientState::Open as u8),
            wake: Notify::new(),
            reconnect_interval: self.reconnect_interval,
            publish_timeout: self.publish_timeout,
            channel_max_idle: self.channel_max_idle,
        });
        tokio::spawn(supervise(Arc::downgrade(&inner), notification));
        debug!("Connected to RabbitMq");
        Ok(Client { inner })
    }
}

impl<T: Transport> Client<T> {
    pub fn builder(transport: T) -> ClientBuilder<T> {
        ClientBuilder {
            transport,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            channel_max_idle: DEFAULT_MAX_IDLE,
        }
    }

    /// Connect using the default settings.
    pub async fn dial(transport: T) -> Result<Self, ClientError> {
        Self::builder(transport).dial().await
    }

    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    pub fn reconnect_interval(&self) -> Duration {
        self.inner.reconnect_interval
    }

    pub(crate) fn publish_timeout(&self) -> Duration {
        self.inner.publish_timeout
    }

    /// Number of idle channels waiting in the pool.
    pub fn idle_channels(&self) -> usize {
        self.inner.pool.len()
    }

    /// Build a consumer for the queue described by `descriptor`.
    ///
    /// Nothing happens on the broker until [`Consumer::consume`] is called.
    pub fn consumer(&self, descriptor: ConsumerDescriptor) -> Consumer<T> {
        Consumer::new(self.clone(), descriptor)
    }

    /// Close the connection.
    ///
    /// The client stops reconnecting, new operations fail with [`ClientError::Closed`] and the
    /// pooled channels are discarded. Calling `close` more than once is a no-op.
    #[tracing::instrument(name = "client_close", skip(self))]
    pub async fn close(&self) -> Result<(), ClientError> {
        let transition = self.inner.state.compare_exchange(
            ClientState::Open as u8,
            ClientState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if transition.is_err() {
            return Ok(());
        }
        self.inner.wake.notify_one();

        let connection = self.inner.connection.lock().await;
        // A connection lost during an outage has nothing left to close.
        let outcome = if connection.is_closed() {
            debug!("RabbitMq connection already down, nothing to close");
            Ok(())
        } else {
            connection.close().await
        };
        drop(self.inner.pool.drain());
        self.inner
            .state
            .store(ClientState::Closed as u8, Ordering::Release);
        info!("RabbitMq connection closed");
        outcome.map_err(ClientError::Broker)
    }

    /// Open a new channel, outside of the pool.
    ///
    /// Waits for the connection to be healed if it is being replaced.
    pub(crate) async fn open_channel(&self) -> Result<T::Channel, ClientError> {
        self.ensure_open()?;
        let connection = self.inner.connection.lock().await;
        // The client might have been closed while we were waiting for the lock.
        self.ensure_open()?;
        connection
            .create_channel()
            .await
            .map_err(ClientError::Channel)
    }

    /// Get a channel in confirm mode, reusing a pooled one when possible.
    ///
    /// Pooled channels that are closed or have been idle for too long are closed in the
    /// background and skipped.
    pub(crate) async fn acquire_channel(&self) -> Result<T::Channel, ClientError> {
        self.ensure_open()?;
        while let Some(pooled) = self.inner.pool.pull() {
            if pooled.is_reusable(self.inner.channel_max_idle) {
                return Ok(pooled.into_inner());
            }
            let channel = pooled.into_inner();
            tokio::spawn(async move {
                if let Err(e) = channel.close().await {
                    debug!(error = %e, "Failed to close a discarded channel");
                }
            });
        }

        let channel = self.open_channel().await?;
        channel
            .confirm_select()
            .await
            .map_err(ClientError::Channel)?;
        Ok(channel)
    }

    /// Hand a channel back to the pool, unless it has been closed.
    pub(crate) fn release_channel(&self, channel: T::Channel) {
        if !channel.is_closed() && self.inner.is_open() {
            self.inner.pool.push(channel);
        }
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.inner.is_open() {
            Ok(())
        } else {
            Err(ClientError::Closed)
        }
    }
}

/// Watch the live connection and replace it when it fails.
///
/// The supervisor only holds a weak reference to the client: it stops once every handle has
/// been dropped.
async fn supervise<T: Transport>(client: Weak<Inner<T>>, mut notification: CloseNotification) {
    loop {
        let reason = notification.await;
        let Some(inner) = client.upgrade() else {
            return;
        };
        let Some(reason) = reason else {
            debug!("RabbitMq connection closed gracefully, supervision stopped");
            return;
        };
        if !inner.is_open() {
            return;
        }
        warn!(error = %reason, "RabbitMq connection lost, reconnecting");

        let mut connection = inner.connection.lock().await;
        notification = loop {
            tokio::select! {
                _ = tokio::time::sleep(inner.reconnect_interval) => {}
                _ = inner.wake.notified() => {}
            }
            if !inner.is_open() {
                debug!("Client closed while reconnecting, supervision stopped");
                return;
            }
            match inner.transport.connect().await {
                Ok(replacement) => {
                    let notification = replacement.close_notification();
                    *connection = Arc::new(replacement);
                    info!("RabbitMq connection re-established");
                    break notification;
                }
                Err(e) => warn!(error = %e, "Failed to reconnect to RabbitMq"),
            }
        };
    }
}
