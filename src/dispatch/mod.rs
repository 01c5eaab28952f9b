//! The dispatch engine: a fixed pool of workers handing deliveries to a [`TaskExecutor`] and
//! settling them with the broker according to the executor's verdict.
//!
//! Deliveries from every consumer attached to a [`WorkerPool`] flow into one bounded queue
//! drained by `num_workers` workers. Consumers with a `concurrency` limit go through an
//! [`Admission`] first: a delivery holds its admission token until its processing is over.
mod admission;
mod executor;
mod outcome;
mod worker_pool;

pub use admission::{Admission, AdmissionToken};
pub use executor::{ClosureExecutor, Codec, TaskExecutor, TaskPayload, TaskResult};
pub use outcome::{BrokerAction, STATUS_ACK, STATUS_NACK, STATUS_REJECT};
pub use worker_pool::WorkerPool;

/// Why the processing of a delivery failed. Every failure nacks the delivery.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("Failed to build the task payload")]
    Payload(#[source] serde_json::Error),
    #[error("The task executor failed")]
    Executor(#[source] anyhow::Error),
    #[error("The task executor did not answer within {0:?}")]
    Timeout(std::time::Duration),
    #[error("Streaming is not supported")]
    Streaming,
    #[error("Malformed response body: expected a single status byte, got {0} bytes")]
    MalformedResponse(usize),
    #[error("Unknown status byte {0:#04x}")]
    UnknownStatus(u8),
}
