//! The boundary with the external task executor.
use crate::amqp::convenience::field_table_to_json;
use crate::consumers::{ConsumerDescriptor, Delivery};
use crate::dispatch::DispatchError;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

/// Implementers of `TaskExecutor` process the deliveries dispatched by the
/// [`WorkerPool`](super::WorkerPool).
///
/// # Scope
///
/// `exec` does not get access to the underlying RabbitMq channel.
/// The worker pool takes care of acking/nacking the delivery with the broker according to the
/// status byte returned in [`TaskResult::body`]:
///
/// - `b'0'`: ack;
/// - `b'1'`: nack, the message is requeued;
/// - `b'2'`: reject, the message is dead-lettered or discarded.
///
/// Any other body, or an error, nacks the message and requeues it if the consumer's
/// `requeue_on_fail` is set.
///
/// # Implementors
///
/// You can implement `TaskExecutor` for a struct or wrap an async function or closure in a
/// [`ClosureExecutor`].
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    async fn exec(&self, payload: TaskPayload) -> Result<TaskResult, anyhow::Error>;
}

#[async_trait::async_trait]
impl<E> TaskExecutor for Arc<E>
where
    E: TaskExecutor + ?Sized,
{
    async fn exec(&self, payload: TaskPayload) -> Result<TaskResult, anyhow::Error> {
        E::exec(self, payload).await
    }
}

#[async_trait::async_trait]
impl<E> TaskExecutor for Box<E>
where
    E: TaskExecutor + ?Sized,
{
    async fn exec(&self, payload: TaskPayload) -> Result<TaskResult, anyhow::Error> {
        E::exec(self, payload).await
    }
}

/// Wrapper type to turn an async closure into a [`TaskExecutor`].
///
/// ```rust
/// use carrot_relay::dispatch::{ClosureExecutor, TaskPayload, TaskResult};
///
/// let executor = ClosureExecutor(|payload: TaskPayload| async move {
///     if payload.body.is_empty() {
///         // Reject: there is nothing to process.
///         return Ok::<_, anyhow::Error>(TaskResult::new(*b"2"));
///     }
///     Ok(TaskResult::new(*b"0"))
/// });
/// ```
pub struct ClosureExecutor<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> TaskExecutor for ClosureExecutor<F>
where
    F: Fn(TaskPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskResult, anyhow::Error>> + Send + 'static,
{
    async fn exec(&self, payload: TaskPayload) -> Result<TaskResult, anyhow::Error> {
        (self.0)(payload).await
    }
}

/// How the executor should interpret [`TaskPayload::body`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Opaque bytes.
    Raw,
    /// A JSON document.
    Json,
}

/// A delivery, as seen by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPayload {
    /// The body of the delivery, untouched.
    pub body: Vec<u8>,
    pub codec: Codec,
    /// A JSON object describing where the delivery comes from:
    /// `queue`, `headers`, `exchange`, `routingKey` and `deliveryTag`.
    pub context: Vec<u8>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskContext<'a> {
    queue: &'a str,
    headers: serde_json::Value,
    exchange: &'a str,
    routing_key: &'a str,
    delivery_tag: u64,
}

impl TaskPayload {
    pub(crate) fn from_delivery(
        delivery: &Delivery,
        descriptor: &ConsumerDescriptor,
    ) -> Result<Self, DispatchError> {
        let context = TaskContext {
            queue: &descriptor.queue,
            headers: delivery
                .properties
                .headers()
                .as_ref()
                .map(field_table_to_json)
                .unwrap_or(serde_json::Value::Null),
            exchange: delivery.exchange.as_str(),
            routing_key: delivery.routing_key.as_str(),
            delivery_tag: delivery.delivery_tag,
        };
        Ok(Self {
            body: delivery.data.clone(),
            codec: Codec::Json,
            context: serde_json::to_vec(&context).map_err(DispatchError::Payload)?,
        })
    }

    /// Parse [`TaskPayload::context`].
    pub fn context_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.context)
    }
}

/// What the executor answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    /// A single status byte: `b'0'`, `b'1'` or `b'2'`.
    pub body: Vec<u8>,
    /// Streamed responses are not supported: they nack the delivery.
    pub streamed: bool,
}

impl TaskResult {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            streamed: false,
        }
    }

    pub fn streamed(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            streamed: true,
        }
    }
}
