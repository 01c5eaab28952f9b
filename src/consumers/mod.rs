//! Facilities to consume messages from a RabbitMq queue. Check out [`Consumer`] as a
//! starting point.
pub use consumer::{Consumer, ConsumerError, ConsumerState};
pub use descriptor::ConsumerDescriptor;
pub use incoming_message::{Deliveries, Delivery};

mod consumer;
mod descriptor;
mod incoming_message;
