use crate::consumers::Delivery;
use crate::dispatch::DispatchError;
use crate::transport::TransportError;

pub const STATUS_ACK: u8 = b'0';
pub const STATUS_NACK: u8 = b'1';
pub const STATUS_REJECT: u8 = b'2';

/// The action we ask the broker to take when finalising the processing of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerAction {
    /// Positive acknowledgement - the message can be removed from the queue.
    Ack,
    /// Negative acknowledgement - the message was not processed successfully.
    /// It is requeued if `requeue` is `true`, dead-lettered or discarded otherwise.
    Nack { requeue: bool },
    /// The message is refused.
    Reject { requeue: bool },
}

impl BrokerAction {
    /// Interpret the status byte returned by a task executor.
    pub fn from_status(body: &[u8]) -> Result<Self, DispatchError> {
        match body {
            [STATUS_ACK] => Ok(Self::Ack),
            [STATUS_NACK] => Ok(Self::Nack { requeue: true }),
            [STATUS_REJECT] => Ok(Self::Reject { requeue: false }),
            [other] => Err(DispatchError::UnknownStatus(*other)),
            _ => Err(DispatchError::MalformedResponse(body.len())),
        }
    }

    /// The action taken when processing fails.
    pub fn on_failure(requeue_on_fail: bool) -> Self {
        Self::Nack {
            requeue: requeue_on_fail,
        }
    }

    pub(crate) async fn apply(self, delivery: &Delivery) -> Result<(), TransportError> {
        match self {
            Self::Ack => delivery.ack().await,
            Self::Nack { requeue } => delivery.nack(requeue).await,
            Self::Reject { requeue } => delivery.reject(requeue).await,
        }
    }
}
