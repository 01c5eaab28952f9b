//! Configuration types.
//!
//! All types implement `serde::Deserialize`: load them from whatever source your application
//! uses (files, environment, a configuration service) and hand them to
//! [`Bridge`](crate::bridge::Bridge).
use crate::amqp::configuration::RabbitMqSettings;
use crate::client::declarations::{ExchangeDeclaration, QueueBinding, QueueDeclaration};
use crate::consumers::ConsumerDescriptor;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use std::time::Duration;

/// Everything required to run a [`Bridge`](crate::bridge::Bridge).
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSettings {
    pub amqp: RabbitMqSettings,
    #[serde(default)]
    pub client: ClientSettings,
    /// The worker pool. Without it (or with zero workers) nothing is consumed.
    #[serde(default)]
    pub pool: Option<WorkerPoolSettings>,
    #[serde(default)]
    pub consumers: Vec<ConsumerDescriptor>,
    /// Entities declared once connected.
    #[serde(default)]
    pub topology: TopologySettings,
}

/// Tuning of the connection manager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_reconnect_interval_seconds")]
    pub reconnect_interval_seconds: u64,
    #[serde(default = "default_publish_timeout_seconds")]
    pub publish_timeout_seconds: u64,
    #[serde(default = "default_channel_max_idle_seconds")]
    pub channel_max_idle_seconds: u64,
}

fn default_reconnect_interval_seconds() -> u64 {
    3
}

fn default_publish_timeout_seconds() -> u64 {
    60
}

fn default_channel_max_idle_seconds() -> u64 {
    60
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            reconnect_interval_seconds: default_reconnect_interval_seconds(),
            publish_timeout_seconds: default_publish_timeout_seconds(),
            channel_max_idle_seconds: default_channel_max_idle_seconds(),
        }
    }
}

impl ClientSettings {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_seconds)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_seconds)
    }

    pub fn channel_max_idle(&self) -> Duration {
        Duration::from_secs(self.channel_max_idle_seconds)
    }
}

/// Sizing of the [`WorkerPool`](crate::dispatch::WorkerPool).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkerPoolSettings {
    /// Defaults to the number of available CPUs.
    #[serde(
        default = "default_num_workers",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub num_workers: usize,
    /// How long a task executor can take to answer before the delivery is nacked.
    #[serde(default = "default_exec_timeout_seconds")]
    pub exec_timeout_seconds: u64,
}

fn default_num_workers() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
}

fn default_exec_timeout_seconds() -> u64 {
    60
}

impl Default for WorkerPoolSettings {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            exec_timeout_seconds: default_exec_timeout_seconds(),
        }
    }
}

impl WorkerPoolSettings {
    pub fn with_workers(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Self::default()
        }
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_seconds)
    }
}

/// Queues, exchanges and bindings to declare, in this order.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TopologySettings {
    #[serde(default, alias = "queue")]
    pub queues: Vec<QueueDeclaration>,
    #[serde(default, alias = "exchange")]
    pub exchanges: Vec<ExchangeDeclaration>,
    #[serde(default, alias = "queueBind")]
    pub bindings: Vec<QueueBinding>,
}
