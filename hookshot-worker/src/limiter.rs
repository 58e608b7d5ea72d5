//! # Limiter
//!
//! Bounds how many delivery attempts run at the same time. Holders of a permit are running an
//! attempt; everyone else waits in line for one.
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::WorkerError;

#[derive(Clone, Debug)]
pub struct ConcurrencyLimiter {
    name: String,
    capacity: usize,
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyLimiter {
    /// A limiter with `capacity` slots. A capacity of zero is raised to one.
    pub fn new(name: &str, capacity: usize) -> Self {
        let capacity = capacity.max(1);

        Self {
            name: name.to_owned(),
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently taken.
    pub fn in_use(&self) -> usize {
        self.capacity
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Wait for a free slot. The slot is released when the permit is dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, WorkerError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::LimiterClosed(self.name.clone()))
    }

    /// Publish the share of slots in use as a percentage gauge.
    pub fn report_saturation(&self) {
        let saturation = self.in_use() as f64 / self.capacity as f64 * 100.0;
        metrics::gauge!("hookshot_dispatch_saturation_percent", "limiter" => self.name.clone())
            .set(saturation);
    }
}
