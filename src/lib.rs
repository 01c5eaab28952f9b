//! `carrot-relay` is a resilient bridge, built on top of [`lapin`], between RabbitMQ queues and
//! a pool of external task executors.
//!
//! It keeps a single connection to the broker alive across network failures, streams
//! deliveries into a bounded pool of workers, hands each delivery to a
//! [`TaskExecutor`](crate::dispatch::TaskExecutor) and acks, nacks or rejects it according to
//! the executor's verdict.
//!
//! [`Bridge`](crate::bridge::Bridge) is the best starting point: it wires the
//! [`Client`](crate::client::Client), the [`Consumer`](crate::consumers::Consumer)s and the
//! [`WorkerPool`](crate::dispatch::WorkerPool) together from [`BridgeSettings`](crate::config::BridgeSettings).
//!
//! ## Examples
//!
//! Check the `demos` directory to see the relay in action.

pub mod amqp;
pub mod bridge;
pub mod client;
pub mod config;
pub mod consumers;
pub mod dispatch;
pub mod pool;
pub mod publishers;
pub mod transport;
