//! The `lapin` binding of the [`transport`](crate::transport) traits, plus helpers to configure
//! a connection to a RabbitMq broker.
//!
//! AMQP protocol types exposed by the public API of this crate are re-exported from here, so
//! that users do not have to add `lapin` as a direct dependency and keep it in sync.
pub mod configuration;
pub mod convenience;

mod channel;
mod factory;

pub use channel::{AmqpChannel, AmqpConnection};
pub use factory::ConnectionFactory;

/// The set of AMQP properties associated with a message. Re-exported from `lapin`.
pub use lapin::protocol::basic::AMQPProperties;
pub use lapin::{options, types as protocol_types, BasicProperties, ExchangeKind};
