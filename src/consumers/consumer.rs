use crate::client::{Client, ClientError, ClientState};
use crate::consumers::{ConsumerDescriptor, Deliveries, Delivery};
use crate::transport::{
    BrokerChannel, CloseNotification, InboundDeliveries, Transport, TransportError,
};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{debug, info, warn};

/// Where a [`Consumer`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Built, [`Consumer::consume`] has not been called yet.
    Idle,
    /// Opening a channel and registering with the broker.
    Dialing,
    Consuming,
    /// The channel failed: a fresh one is being opened.
    Redialing,
    /// Terminal.
    Closed,
}

#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error("`consume` has already been called on this consumer")]
    AlreadyStarted,
    #[error("Failed to start consuming from queue {queue}")]
    Dial {
        queue: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Failed to cancel the consumer or to close its channel")]
    Channel(#[source] TransportError),
    #[error("The consumer has been closed")]
    Closed,
}

/// A consumer that survives channel failures.
///
/// Once started, a supervisor task watches the consumer's channel. When the channel fails, it
/// opens a fresh one (waiting for the connection to be healed, if needed), registers the
/// consumer again and keeps forwarding deliveries into the same [`Deliveries`] stream.
///
/// A consumer is built from a [`Client`] with [`Client::consumer`].
pub struct Consumer<T: Transport> {
    inner: Arc<Inner<T>>,
    redial_interval: Duration,
}

impl<T: Transport> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            redial_interval: self.redial_interval,
        }
    }
}

struct Inner<T: Transport> {
    client: Client<T>,
    descriptor: Arc<ConsumerDescriptor>,
    /// The channel deliveries are currently received on.
    channel: Mutex<Option<T::Channel>>,
    state: watch::Sender<ConsumerState>,
    started: AtomicBool,
    /// Wakes the supervisor up when the consumer is closed or cancelled.
    shutdown: Notify,
}

impl<T: Transport> Consumer<T> {
    pub(crate) fn new(client: Client<T>, descriptor: ConsumerDescriptor) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            redial_interval: client.reconnect_interval(),
            inner: Arc::new(Inner {
                client,
                descriptor: Arc::new(descriptor),
                channel: Mutex::new(None),
                state,
                started: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        }
    }

    /// How long to wait after a redial before watching the new channel, and between two
    /// failed redials. Defaults to the client's reconnect interval.
    ///
    /// It only affects supervision started by a later call to [`Consumer::consume`].
    #[must_use]
    pub fn with_redial_interval(mut self, redial_interval: Duration) -> Self {
        self.redial_interval = redial_interval;
        self
    }

    pub fn descriptor(&self) -> &Arc<ConsumerDescriptor> {
        &self.inner.descriptor
    }

    pub fn state(&self) -> ConsumerState {
        *self.inner.state.borrow()
    }

    /// Subscribe to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.inner.state.subscribe()
    }

    /// Resolves once the consumer reaches [`ConsumerState::Closed`].
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        while *state.borrow_and_update() != ConsumerState::Closed {
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Start consuming.
    ///
    /// It can only be called once: the returned stream is the only output of the consumer,
    /// across redials.
    #[tracing::instrument(
        name = "consume",
        skip(self),
        fields(queue = %self.inner.descriptor.queue, consumer_tag = %self.inner.descriptor.consumer_tag)
    )]
    pub async fn consume(&self) -> Result<Deliveries, ConsumerError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(ConsumerError::AlreadyStarted);
        }
        if self.inner.is_closed() {
            self.inner.transition(ConsumerState::Closed);
            return Err(ConsumerError::Closed);
        }
        self.inner.transition(ConsumerState::Dialing);

        let dialed = tokio::select! {
            dialed = self.inner.dial() => dialed,
            _ = self.inner.shutdown.notified() => Err(ConsumerError::Closed),
        };
        let dialed = match dialed {
            Ok(dialed) => dialed,
            Err(e) => {
                self.inner.transition(ConsumerState::Closed);
                return Err(e);
            }
        };

        let (sender, receiver) = mpsc::channel(1);
        tokio::spawn(forward(
            dialed.inbound,
            sender.clone(),
            Arc::clone(&self.inner.descriptor),
        ));
        self.inner.transition(ConsumerState::Consuming);
        tokio::spawn(supervise(
            Arc::clone(&self.inner),
            sender,
            dialed.notification,
            self.redial_interval,
        ));

        Ok(Deliveries::new(receiver))
    }

    /// Stop the consumer and close its channel.
    ///
    /// Deliveries that have not been settled yet are requeued by the broker. Calling `close`
    /// more than once, or concurrently with a redial, is safe.
    #[tracing::instrument(
        name = "consumer_close",
        skip(self),
        fields(queue = %self.inner.descriptor.queue)
    )]
    pub async fn close(&self) -> Result<(), ConsumerError> {
        self.inner.transition(ConsumerState::Closed);
        self.inner.shutdown.notify_one();

        let channel = self.inner.channel.lock().await.take();
        match channel {
            Some(channel) if !channel.is_closed() => {
                channel.close().await.map_err(ConsumerError::Channel)
            }
            _ => Ok(()),
        }
    }

    /// Ask the broker to stop pushing deliveries, leaving the channel open.
    ///
    /// The stream ends once the broker acknowledges the cancellation, while deliveries
    /// already received can still be settled. Use [`Consumer::close`] afterwards to release
    /// the channel.
    #[tracing::instrument(
        name = "consumer_cancel",
        skip(self),
        fields(queue = %self.inner.descriptor.queue)
    )]
    pub async fn cancel(&self) -> Result<(), ConsumerError> {
        self.inner.transition(ConsumerState::Closed);
        self.inner.shutdown.notify_one();

        let channel = self.inner.channel.lock().await;
        match channel.as_ref() {
            Some(channel) if !channel.is_closed() => channel
                .basic_cancel(&self.inner.descriptor.consumer_tag)
                .await
                .map_err(ConsumerError::Channel),
            _ => Ok(()),
        }
    }
}

/// A freshly registered consumer.
struct Dialed<C> {
    inbound: InboundDeliveries,
    notification: CloseNotification,
    /// The channel the consumer was registered on before this dial, if any.
    replaced: Option<C>,
}

impl<T: Transport> Inner<T> {
    /// `Closed` is terminal: transitions out of it are ignored.
    fn transition(&self, next: ConsumerState) {
        self.state.send_if_modified(|current| {
            if *current == ConsumerState::Closed || *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn is_closed(&self) -> bool {
        *self.state.borrow() == ConsumerState::Closed || self.client.state() != ClientState::Open
    }

    /// Open a channel, apply the prefetch limit and register the consumer.
    ///
    /// The new channel replaces the current one, which is handed back to the caller.
    async fn dial(&self) -> Result<Dialed<T::Channel>, ConsumerError> {
        let dial_error = |source: anyhow::Error| ConsumerError::Dial {
            queue: self.descriptor.queue.clone(),
            source,
        };

        let channel = self.client.open_channel().await.map_err(|e| match e {
            ClientError::Closed => ConsumerError::Closed,
            e => dial_error(anyhow::Error::new(e)),
        })?;
        let registration = async {
            if self.descriptor.prefetch != 0 {
                channel
                    .basic_qos(self.descriptor.prefetch)
                    .await
                    .map_err(|e| dial_error(anyhow::Error::new(e).context("Failed to set QoS")))?;
            }
            channel
                .basic_consume(&self.descriptor)
                .await
                .map_err(|e| dial_error(anyhow::Error::new(e).context("Failed to consume")))
        };
        let inbound = match registration.await {
            Ok(inbound) => inbound,
            Err(e) => {
                close_in_background(channel);
                return Err(e);
            }
        };

        let notification = channel.close_notification();
        let replaced = self.channel.lock().await.replace(channel);
        Ok(Dialed {
            inbound,
            notification,
            replaced,
        })
    }

    /// Resolves after `duration` or as soon as the consumer is closed.
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.notified() => {
                // Keep the wake-up for the next wait.
                self.shutdown.notify_one();
            }
        }
    }
}

fn close_in_background<C: BrokerChannel>(channel: C) {
    tokio::spawn(async move {
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Failed to close a consumer channel");
        }
    });
}

/// Copy deliveries from a single channel into the consumer's output stream.
async fn forward(
    mut inbound: InboundDeliveries,
    output: mpsc::Sender<Delivery>,
    descriptor: Arc<ConsumerDescriptor>,
) {
    while let Some(next) = inbound.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(e) => {
                debug!(queue = %descriptor.queue, error = %e, "Consumer stream failed");
                break;
            }
        };
        if let Err(mpsc::error::SendError(delivery)) = output.send(delivery).await {
            // Nobody is listening anymore: let another consumer take it.
            if let Err(e) = delivery.nack(true).await {
                warn!(
                    queue = %descriptor.queue,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Failed to nack an undelivered message"
                );
            }
            break;
        }
    }
    debug!(queue = %descriptor.queue, "RabbitMq consume channel closed");
}

/// Watch the consumer channel and redial when it fails.
///
/// The supervisor owns one of the senders feeding the output stream: the stream ends when the
/// supervisor has stopped and every forwarder has drained its channel.
async fn supervise<T: Transport>(
    inner: Arc<Inner<T>>,
    output: mpsc::Sender<Delivery>,
    mut notification: CloseNotification,
    redial_interval: Duration,
) {
    let queue = inner.descriptor.queue.clone();
    'supervision: loop {
        let reason = tokio::select! {
            reason = &mut notification => reason,
            _ = inner.shutdown.notified() => None,
        };
        let Some(reason) = reason else {
            break 'supervision;
        };
        if inner.is_closed() {
            break 'supervision;
        }
        warn!(queue = %queue, error = %reason, "Consumer channel closed unexpectedly, redialing");
        inner.transition(ConsumerState::Redialing);

        loop {
            // Opening a channel waits for the connection to be healed: stay responsive to close.
            let dialed = tokio::select! {
                dialed = inner.dial() => dialed,
                _ = inner.shutdown.notified() => break 'supervision,
            };
            match dialed {
                Ok(dialed) => {
                    if let Some(replaced) = dialed.replaced {
                        close_in_background(replaced);
                    }
                    if inner.is_closed() {
                        // Closed while we were dialing: release the channel we just opened.
                        if let Some(channel) = inner.channel.lock().await.take() {
                            close_in_background(channel);
                        }
                        break 'supervision;
                    }
                    tokio::spawn(forward(
                        dialed.inbound,
                        output.clone(),
                        Arc::clone(&inner.descriptor),
                    ));
                    notification = dialed.notification;
                    inner.transition(ConsumerState::Consuming);
                    info!(queue = %queue, "Consumer redialed");
                    inner.pause(redial_interval).await;
                    break;
                }
                Err(ConsumerError::Closed) => break 'supervision,
                Err(e) => {
                    warn!(queue = %queue, error = ?e, "Failed to redial consumer");
                    if inner.is_closed() {
                        break 'supervision;
                    }
                    inner.pause(redial_interval).await;
                    if inner.is_closed() {
                        break 'supervision;
                    }
                }
            }
        }
    }
    inner.transition(ConsumerState::Closed);
    debug!(queue = %queue, "Consumer supervision stopped");
}
