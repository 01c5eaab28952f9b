//! Facilities to publish messages to a RabbitMq exchange. Check out [`Client::publish`] as a
//! starting point.
//!
//! [`Client::publish`]: crate::client::Client::publish
mod message_envelope;
mod publisher;

pub use message_envelope::MessageEnvelope;
pub use publisher::PublisherError;
