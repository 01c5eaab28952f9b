use crate::amqp::convenience::deserialize_field_table;
use amq_protocol_types::{AMQPValue, FieldTable};
use serde::Deserialize;
use uuid::Uuid;

/// Everything required to start consuming from a queue and to dispatch its deliveries.
///
/// Descriptors are immutable once a [`Consumer`](super::Consumer) has been built from them:
/// the consumer shares them with the dispatch engine behind an `Arc`.
///
/// # Defaults
///
/// When deserialized, a missing `consumer_tag` is replaced by a random UUID, `prefetch`
/// defaults to 1, `concurrency` to 0 (no per-consumer limit) and `requeue_on_fail` to `true`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConsumerDescriptor {
    /// The name of the queue we will be consuming messages from.
    pub queue: String,
    #[serde(
        default = "random_consumer_tag",
        alias = "consumer_id",
        alias = "consumerTag"
    )]
    pub consumer_tag: String,
    /// Let the broker consider deliveries acknowledged as soon as they are pushed.
    #[serde(default, alias = "autoAck")]
    pub auto_ack: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default, alias = "noLocal")]
    pub no_local: bool,
    #[serde(default, alias = "noWait")]
    pub no_wait: bool,
    #[serde(default, deserialize_with = "deserialize_field_table")]
    pub args: FieldTable,
    /// Consumer priority. See <https://www.rabbitmq.com/consumer-priority.html>.
    #[serde(default)]
    pub priority: Option<i32>,
    /// The maximum number of unacknowledged deliveries the broker pushes to this consumer.
    ///
    /// `0` leaves the channel without a limit.
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    /// The maximum number of deliveries from this consumer being processed at the same time.
    ///
    /// `0` means no limit other than the size of the worker pool.
    #[serde(default)]
    pub concurrency: usize,
    /// Whether deliveries that could not be processed are requeued when nacked.
    #[serde(default = "default_requeue_on_fail", alias = "requeueOnFail")]
    pub requeue_on_fail: bool,
}

fn random_consumer_tag() -> String {
    Uuid::new_v4().to_string()
}

fn default_prefetch() -> u16 {
    1
}

fn default_requeue_on_fail() -> bool {
    true
}

impl ConsumerDescriptor {
    /// A descriptor for `queue` with the default settings and a random consumer tag.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            consumer_tag: random_consumer_tag(),
            auto_ack: false,
            exclusive: false,
            no_local: false,
            no_wait: false,
            args: FieldTable::default(),
            priority: None,
            prefetch: default_prefetch(),
            concurrency: 0,
            requeue_on_fail: default_requeue_on_fail(),
        }
    }

    #[must_use]
    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = consumer_tag.into();
        self
    }

    #[must_use]
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_requeue_on_fail(mut self, requeue_on_fail: bool) -> Self {
        self.requeue_on_fail = requeue_on_fail;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// The arguments sent along with `basic.consume`: the configured ones plus `x-priority`,
    /// if a priority was set.
    pub fn consume_arguments(&self) -> FieldTable {
        let mut arguments = self.args.clone();
        if let Some(priority) = self.priority {
            arguments.insert("x-priority".into(), AMQPValue::LongInt(priority));
        }
        arguments
    }
}
