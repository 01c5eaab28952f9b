use amq_protocol_types::{FieldTable, ShortShortUInt, ShortString, Timestamp};

use crate::amqp::AMQPProperties;

/// A message to be published via [`Client::publish`](crate::client::Client::publish).
#[derive(Debug, Clone, Default)]
pub struct MessageEnvelope {
    // The body of the message - as a sequence of bytes.
    pub payload: Vec<u8>,
    // The name of the exchange we are publishing the message to.
    pub exchange_name: String,
    // The routing key used by exchange listeners to determine if they are interested or not
    // to the message.
    pub routing_key: String,
    // AMQP properties attached to the message.
    // It can be omitted by passing `None`.
    pub properties: Option<AMQPProperties>,
}

impl MessageEnvelope {
    pub fn new(
        exchange_name: impl Into<String>,
        routing_key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            payload: payload.into(),
            exchange_name: exchange_name.into(),
            routing_key: routing_key.into(),
            properties: None,
        }
    }

    pub fn with_payload(mut self, value: Vec<u8>) -> Self {
        self.payload = value;
        self
    }

    pub fn with_exchange_name(mut self, value: String) -> Self {
        self.exchange_name = value;
        self
    }

    pub fn with_routing_key(mut self, value: String) -> Self {
        self.routing_key = value;
        self
    }

    fn props(mut self, f: impl FnOnce(AMQPProperties) -> AMQPProperties) -> Self {
        self.properties = Some(f(self.properties.unwrap_or_default()));
        self
    }

    pub fn with_content_type(self, value: ShortString) -> Self {
        self.props(|p| p.with_content_type(value))
    }

    pub fn with_headers(self, value: FieldTable) -> Self {
        self.props(|p| p.with_headers(value))
    }

    pub fn with_priority(self, value: ShortShortUInt) -> Self {
        self.props(|p| p.with_priority(value))
    }

    pub fn with_correlation_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_correlation_id(value))
    }

    pub fn with_reply_to(self, value: ShortString) -> Self {
        self.props(|p| p.with_reply_to(value))
    }

    pub fn with_expiration(self, value: ShortString) -> Self {
        self.props(|p| p.with_expiration(value))
    }

    pub fn with_message_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_message_id(value))
    }

    pub fn with_timestamp(self, value: Timestamp) -> Self {
        self.props(|p| p.with_timestamp(value))
    }
}
