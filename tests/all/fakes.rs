//! An in-memory broker, driving the relay through the same `Transport` seam `lapin` sits behind.
use amq_protocol_types::FieldTable;
use carrot_relay::amqp::options::BasicPublishOptions;
use carrot_relay::amqp::{AMQPProperties, BasicProperties};
use carrot_relay::client::declarations::{ExchangeDeclaration, QueueBinding, QueueDeclaration};
use carrot_relay::consumers::{ConsumerDescriptor, Delivery};
use carrot_relay::transport::{
    Acknowledger, BrokerChannel, BrokerConnection, CloseNotification, CloseSignal, Confirmation,
    InboundDeliveries, PendingConfirm, Transport, TransportError,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// How the broker answers publishings on channels in confirm mode.
#[derive(Debug, Clone)]
pub enum ConfirmMode {
    Ack,
    Nack,
    Returned(u16, String),
    /// The confirmation never arrives.
    Never,
    /// The channel goes away before the confirmation arrives.
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
    Reject { requeue: bool },
}

#[derive(Debug, Clone)]
pub struct Settled {
    pub body: Vec<u8>,
    pub settlement: Settlement,
    /// Whether every earlier unsettled delivery of the channel was settled along with this one.
    pub multiple: bool,
}

#[derive(Debug, Clone)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: AMQPProperties,
}

struct Message {
    body: Vec<u8>,
    headers: Option<FieldTable>,
}

struct Registration {
    channel: FakeChannel,
    consumer_tag: String,
    sender: mpsc::UnboundedSender<Result<Delivery, TransportError>>,
}

struct BrokerState {
    refuse_connects: bool,
    confirm_mode: ConfirmMode,
    failing_declarations: HashSet<String>,
    connections: Vec<CloseSignal>,
    channels: Vec<FakeChannel>,
    registrations: HashMap<String, Vec<Registration>>,
    ready: HashMap<String, VecDeque<Message>>,
    declared: Vec<String>,
    published: Vec<Published>,
    settled: Vec<Settled>,
    /// Every call to ack, nack or reject, including the ones the broker refused.
    settle_attempts: usize,
    prefetches: Vec<u16>,
    connect_attempts: usize,
    connects: usize,
    channels_opened: usize,
}

/// The state shared by every handle of a fake broker.
pub struct FakeBroker {
    state: Mutex<BrokerState>,
    delivery_tags: AtomicU64,
    channel_ids: AtomicU64,
}

impl FakeBroker {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }
}

/// The entrypoint of the fake broker: a cheap, cloneable handle implementing `Transport`.
#[derive(Clone)]
pub struct FakeTransport {
    broker: Arc<FakeBroker>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            broker: Arc::new(FakeBroker {
                state: Mutex::new(BrokerState {
                    refuse_connects: false,
                    confirm_mode: ConfirmMode::Ack,
                    failing_declarations: HashSet::new(),
                    connections: Vec::new(),
                    channels: Vec::new(),
                    registrations: HashMap::new(),
                    ready: HashMap::new(),
                    declared: Vec::new(),
                    published: Vec::new(),
                    settled: Vec::new(),
                    settle_attempts: 0,
                    prefetches: Vec::new(),
                    connect_attempts: 0,
                    connects: 0,
                    channels_opened: 0,
                }),
                delivery_tags: AtomicU64::new(1),
                channel_ids: AtomicU64::new(1),
            }),
        }
    }

    pub fn refuse_connects(&self, refuse: bool) {
        self.broker.state().refuse_connects = refuse;
    }

    pub fn confirm_with(&self, mode: ConfirmMode) {
        self.broker.state().confirm_mode = mode;
    }

    /// Declaring an exchange or a queue with this name fails and closes the channel.
    pub fn fail_declarations_of(&self, name: &str) {
        self.broker
            .state()
            .failing_declarations
            .insert(name.to_string());
    }

    /// Kill every live connection (and its channels) with an error.
    pub fn drop_connection(&self) {
        let (connections, channels) = {
            let mut state = self.broker.state();
            state.registrations.clear();
            (
                std::mem::take(&mut state.connections),
                std::mem::take(&mut state.channels),
            )
        };
        for channel in channels {
            channel
                .inner
                .signal
                .fail(TransportError::msg("connection reset by peer"));
        }
        for connection in connections {
            connection.fail(TransportError::msg("connection reset by peer"));
        }
    }

    /// Kill, with a channel-level error, every channel consuming from `queue`.
    pub fn fail_consumer_channels(&self, queue: &str) {
        let registrations = self
            .broker
            .state()
            .registrations
            .remove(queue)
            .unwrap_or_default();
        for registration in registrations {
            registration
                .channel
                .fail(TransportError::msg("PRECONDITION_FAILED - unknown delivery tag"));
        }
    }

    /// Publish `body` straight to `queue`. It is pushed to a consumer as soon as one is
    /// registered.
    pub fn deliver(&self, queue: &str, body: &[u8]) {
        self.deliver_with_headers(queue, body, None);
    }

    pub fn deliver_with_headers(&self, queue: &str, body: &[u8], headers: Option<FieldTable>) {
        let mut state = self.broker.state();
        state
            .ready
            .entry(queue.to_string())
            .or_default()
            .push_back(Message {
                body: body.to_vec(),
                headers,
            });
        self.flush(&mut state, queue);
    }

    fn flush(&self, state: &mut BrokerState, queue: &str) {
        loop {
            let has_consumer = state
                .registrations
                .get(queue)
                .map_or(false, |registrations| !registrations.is_empty());
            if !has_consumer {
                return;
            }
            let Some(message) = state.ready.get_mut(queue).and_then(VecDeque::pop_front) else {
                return;
            };
            let registration = &state.registrations[queue][0];
            let delivery_tag = self.broker.delivery_tags.fetch_add(1, Ordering::SeqCst);
            let acker = FakeAcker {
                broker: Arc::clone(&self.broker),
                channel: registration.channel.clone(),
                body: message.body.clone(),
                settled: AtomicBool::new(false),
            };
            let mut delivery = Delivery::new(delivery_tag, message.body, Arc::new(acker));
            delivery.exchange = "".into();
            delivery.routing_key = queue.into();
            if let Some(headers) = message.headers {
                delivery.properties = AMQPProperties::default().with_headers(headers);
            }
            // A consumer whose stream has gone away cannot receive anything.
            let _ = registration.sender.send(Ok(delivery));
        }
    }

    pub fn connect_attempts(&self) -> usize {
        self.broker.state().connect_attempts
    }

    pub fn connects(&self) -> usize {
        self.broker.state().connects
    }

    pub fn channels_opened(&self) -> usize {
        self.broker.state().channels_opened
    }

    pub fn open_connections(&self) -> usize {
        self.broker
            .state()
            .connections
            .iter()
            .filter(|c| c.is_open())
            .count()
    }

    pub fn declared(&self) -> Vec<String> {
        self.broker.state().declared.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.broker.state().published.clone()
    }

    pub fn settled(&self) -> Vec<Settled> {
        self.broker.state().settled.clone()
    }

    pub fn settle_attempts(&self) -> usize {
        self.broker.state().settle_attempts
    }

    pub fn prefetches(&self) -> Vec<u16> {
        self.broker.state().prefetches.clone()
    }

    pub fn consumers_of(&self, queue: &str) -> usize {
        self.broker
            .state()
            .registrations
            .get(queue)
            .map_or(0, Vec::len)
    }

    /// Wait (at most 5 seconds) until `n` deliveries have been settled.
    pub async fn wait_for_settlements(&self, n: usize) -> Vec<Settled> {
        eventually(|| self.settled().len() >= n).await;
        self.settled()
    }
}

/// Poll `condition` every 10 milliseconds, panicking if it does not hold within 5 seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    let polling = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), polling)
        .await
        .expect("The condition did not hold within 5 seconds");
}

/// Resolve `future`, panicking if it takes longer than 5 seconds.
pub async fn within_deadline<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("Timed out")
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    type Channel = FakeChannel;
    type Connection = FakeConnection;

    async fn connect(&self) -> Result<FakeConnection, TransportError> {
        let mut state = self.broker.state();
        state.connect_attempts += 1;
        if state.refuse_connects {
            return Err(TransportError::msg("connection refused"));
        }
        state.connects += 1;
        let signal = CloseSignal::new();
        state.connections.push(signal.clone());
        Ok(FakeConnection {
            transport: self.clone(),
            signal,
        })
    }
}

pub struct FakeConnection {
    transport: FakeTransport,
    signal: CloseSignal,
}

#[async_trait::async_trait]
impl BrokerConnection for FakeConnection {
    type Channel = FakeChannel;

    async fn create_channel(&self) -> Result<FakeChannel, TransportError> {
        if !self.signal.is_open() {
            return Err(TransportError::msg("the connection is closed"));
        }
        let channel = FakeChannel {
            inner: Arc::new(ChannelInner {
                id: self.transport.broker.channel_ids.fetch_add(1, Ordering::SeqCst),
                transport: self.transport.clone(),
                signal: CloseSignal::new(),
                confirms: AtomicBool::new(false),
            }),
        };
        let mut state = self.transport.broker.state();
        state.channels_opened += 1;
        state.channels.push(channel.clone());
        Ok(channel)
    }

    fn close_notification(&self) -> CloseNotification {
        self.signal.notification()
    }

    fn is_closed(&self) -> bool {
        !self.signal.is_open()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.signal.is_open() {
            return Err(TransportError::msg("invalid connection state: the connection is closed"));
        }
        let channels = {
            let mut state = self.transport.broker.state();
            state.registrations.clear();
            std::mem::take(&mut state.channels)
        };
        for channel in channels {
            channel.inner.signal.close();
        }
        self.signal.close();
        Ok(())
    }
}

struct ChannelInner {
    id: u64,
    transport: FakeTransport,
    signal: CloseSignal,
    confirms: AtomicBool,
}

#[derive(Clone)]
pub struct FakeChannel {
    inner: Arc<ChannelInner>,
}

impl FakeChannel {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.transport.broker.state()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.inner.signal.is_open() {
            Ok(())
        } else {
            Err(TransportError::msg("the channel is closed"))
        }
    }

    fn forget_registrations(&self) {
        let id = self.inner.id;
        for registrations in self.state().registrations.values_mut() {
            registrations.retain(|r| r.channel.inner.id != id);
        }
    }

    fn fail(&self, reason: TransportError) {
        self.forget_registrations();
        self.inner.signal.fail(reason);
    }

    fn declare(&self, name: &str, entry: String) -> Result<(), TransportError> {
        self.ensure_open()?;
        let failing = self.state().failing_declarations.contains(name);
        if failing {
            let reason = format!("PRECONDITION_FAILED - inequivalent arg for '{name}'");
            self.fail(TransportError::msg(reason.clone()));
            return Err(TransportError::msg(reason));
        }
        self.state().declared.push(entry);
        Ok(())
    }
}

#[async_trait::async_trait]
impl BrokerChannel for FakeChannel {
    fn is_closed(&self) -> bool {
        !self.inner.signal.is_open()
    }

    async fn confirm_select(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.inner.confirms.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.state().prefetches.push(prefetch_count);
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PendingConfirm, TransportError> {
        self.ensure_open()?;
        let mode = {
            let mut state = self.state();
            state.published.push(Published {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload: payload.to_vec(),
                properties,
            });
            state.confirm_mode.clone()
        };
        if !self.inner.confirms.load(Ordering::SeqCst) {
            let confirm: PendingConfirm =
                Box::pin(async { Ok::<_, TransportError>(Confirmation::NotRequested) });
            return Ok(confirm);
        }
        let confirm: PendingConfirm = match mode {
            ConfirmMode::Ack => Box::pin(async { Ok::<_, TransportError>(Confirmation::Ack) }),
            ConfirmMode::Nack => Box::pin(async { Ok::<_, TransportError>(Confirmation::Nack) }),
            ConfirmMode::Returned(reply_code, reply_text) => Box::pin(async move {
                Ok::<_, TransportError>(Confirmation::Returned {
                    reply_code,
                    reply_text,
                })
            }),
            ConfirmMode::Never => {
                Box::pin(futures_util::future::pending::<Result<Confirmation, TransportError>>())
            }
            ConfirmMode::Drop => {
                self.fail(TransportError::msg("channel closed by the broker"));
                Box::pin(async {
                    Err::<Confirmation, _>(TransportError::msg("the confirmation feed is gone"))
                })
            }
        };
        Ok(confirm)
    }

    async fn exchange_declare(
        &self,
        declaration: &ExchangeDeclaration,
    ) -> Result<(), TransportError> {
        self.declare(&declaration.name, format!("exchange {}", declaration.name))
    }

    async fn queue_declare(&self, declaration: &QueueDeclaration) -> Result<(), TransportError> {
        let durability = if declaration.durable { " (durable)" } else { "" };
        self.declare(
            &declaration.name,
            format!("queue {}{}", declaration.name, durability),
        )
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        self.declare(
            &binding.queue,
            format!(
                "binding {} -> {} ({})",
                binding.queue, binding.exchange, binding.routing_key
            ),
        )
    }

    async fn basic_consume(
        &self,
        descriptor: &ConsumerDescriptor,
    ) -> Result<InboundDeliveries, TransportError> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.state();
            state
                .registrations
                .entry(descriptor.queue.clone())
                .or_default()
                .push(Registration {
                    channel: self.clone(),
                    consumer_tag: descriptor.consumer_tag.clone(),
                    sender,
                });
            self.inner.transport.flush(&mut state, &descriptor.queue);
        }
        let inbound: InboundDeliveries = Box::pin(futures_util::stream::unfold(
            receiver,
            |mut receiver| async move { receiver.recv().await.map(|next| (next, receiver)) },
        ));
        Ok(inbound)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let id = self.inner.id;
        for registrations in self.state().registrations.values_mut() {
            registrations.retain(|r| !(r.channel.inner.id == id && r.consumer_tag == consumer_tag));
        }
        Ok(())
    }

    fn close_notification(&self) -> CloseNotification {
        self.inner.signal.notification()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.forget_registrations();
        self.inner.signal.close();
        Ok(())
    }
}

struct FakeAcker {
    broker: Arc<FakeBroker>,
    channel: FakeChannel,
    body: Vec<u8>,
    settled: AtomicBool,
}

impl FakeAcker {
    fn settle(&self, settlement: Settlement, multiple: bool) -> Result<(), TransportError> {
        self.broker.state().settle_attempts += 1;
        self.channel.ensure_open()?;
        if self.settled.swap(true, Ordering::SeqCst) {
            // Settling twice closes the channel on a real broker.
            return Err(TransportError::msg("PRECONDITION_FAILED - unknown delivery tag"));
        }
        self.broker.state().settled.push(Settled {
            body: self.body.clone(),
            settlement,
            multiple,
        });
        Ok(())
    }
}

#[async_trait::async_trait]
impl Acknowledger for FakeAcker {
    async fn ack(&self, multiple: bool) -> Result<(), TransportError> {
        self.settle(Settlement::Ack, multiple)
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), TransportError> {
        self.settle(Settlement::Nack { requeue }, multiple)
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.settle(Settlement::Reject { requeue }, false)
    }

    fn is_channel_closed(&self) -> bool {
        !self.channel.inner.signal.is_open()
    }
}
