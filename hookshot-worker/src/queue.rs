//! # Queue
//!
//! The in-process queue of delivery ids waiting for an attempt. Anything holding a
//! `DispatchQueue` can submit work, and a single `DispatchReceiver` feeds the worker.
use std::time;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::WorkerError;

/// Create a connected queue and receiver.
pub fn dispatch_queue() -> (DispatchQueue, DispatchReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (DispatchQueue { sender }, DispatchReceiver { receiver })
}

#[derive(Clone, Debug)]
pub struct DispatchQueue {
    sender: mpsc::UnboundedSender<i64>,
}

impl DispatchQueue {
    /// Submit a delivery for an attempt as soon as a worker slot is free.
    pub fn submit(&self, delivery_id: i64) -> Result<(), WorkerError> {
        self.sender
            .send(delivery_id)
            .map_err(|_| WorkerError::QueueClosed)?;
        metrics::counter!("hookshot_dispatch_submitted_total").increment(1);
        Ok(())
    }

    /// Submit a delivery once `delay` has elapsed. The wait happens off the caller's task.
    pub fn submit_after(&self, delivery_id: i64, delay: time::Duration) {
        let queue = self.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(error) = queue.submit(delivery_id) {
                debug!("dropping delayed resubmission of delivery {}: {}", delivery_id, error);
            }
        });
    }
}

pub struct DispatchReceiver {
    receiver: mpsc::UnboundedReceiver<i64>,
}

impl DispatchReceiver {
    /// Wait for the next delivery id. Returns `None` once every `DispatchQueue` is dropped.
    pub async fn recv(&mut self) -> Option<i64> {
        self.receiver.recv().await
    }

    /// Take the next delivery id if one is already waiting.
    pub fn try_recv(&mut self) -> Option<i64> {
        self.receiver.try_recv().ok()
    }
}
