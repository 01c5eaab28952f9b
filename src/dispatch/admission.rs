use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Caps the number of deliveries being processed at the same time, for a single consumer or
/// for the whole worker pool.
#[derive(Debug, Clone)]
pub struct Admission {
    permits: Arc<Semaphore>,
    limit: usize,
}

/// Proof that a delivery was admitted. Dropping it frees the slot.
#[derive(Debug)]
pub struct AdmissionToken {
    _permit: OwnedSemaphorePermit,
}

impl Admission {
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<AdmissionToken, AcquireError> {
        let permit = Arc::clone(&self.permits).acquire_owned().await?;
        Ok(AdmissionToken { _permit: permit })
    }

    /// Number of admitted deliveries that have not been released yet.
    pub fn in_flight(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
