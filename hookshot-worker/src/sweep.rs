//! # Sweep
//!
//! The scheduled retry phase. Every interval the sweep picks up failed deliveries whose next
//! attempt is due, resets them to pending and submits them, without waiting for the attempts.
use std::sync::Arc;
use std::time;

use chrono::{DateTime, Utc};
use hookshot_common::capture::{ErrorEnvelope, ErrorReporter};
use hookshot_common::health::HealthHandle;
use hookshot_common::store::Store;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::WorkerError;
use crate::queue::DispatchQueue;

/// Deliveries picked up by a single sweep at most.
pub const DEFAULT_BATCH_SIZE: u32 = 100;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepResult {
    pub resubmitted: usize,
    /// Due deliveries that changed before they could be reset.
    pub skipped: usize,
}

pub struct RetrySweep {
    store: Arc<dyn Store>,
    queue: DispatchQueue,
    batch_size: u32,
}

impl RetrySweep {
    pub fn new(store: Arc<dyn Store>, queue: DispatchQueue, batch_size: u32) -> Self {
        Self {
            store,
            queue,
            batch_size,
        }
    }

    pub async fn run_once(&self) -> Result<SweepResult, WorkerError> {
        self.run_at(Utc::now()).await
    }

    /// Resubmit the deliveries due at `now`, in ascending id order.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<SweepResult, WorkerError> {
        let mut result = SweepResult::default();

        for delivery in self
            .store
            .deliveries_due_for_retry(now, self.batch_size)
            .await?
        {
            let Some(reset) = delivery.reset_for_retry() else {
                result.skipped += 1;
                continue;
            };

            if !self
                .store
                .update_delivery_if(delivery.guard(), &reset)
                .await?
            {
                debug!("delivery {} changed before it could be swept", delivery.id);
                result.skipped += 1;
                continue;
            }

            self.queue.submit(delivery.id)?;
            result.resubmitted += 1;
        }

        metrics::counter!("hookshot_sweep_resubmitted_total")
            .increment(u64::try_from(result.resubmitted).unwrap_or(u64::MAX));
        Ok(result)
    }
}

/// Run the sweep every `interval`, forever. Failures are reported and the next sweep goes on.
pub async fn sweep_loop(
    sweep: RetrySweep,
    liveness: HealthHandle,
    interval: time::Duration,
    reporter: ErrorReporter,
) {
    let mut interval = tokio::time::interval(interval);

    loop {
        interval.tick().await;

        match sweep.run_once().await {
            Ok(result) => {
                info!(
                    "retry sweep processed {} deliveries, {} skipped",
                    result.resubmitted, result.skipped
                );
                liveness.report_healthy().await;
            }
            Err(error) => {
                reporter.report(
                    ErrorEnvelope::from_error(&error)
                        .with_context(serde_json::json!({ "task": "retry_sweep" })),
                );
                // A failed sweep still counts as the loop being alive.
                liveness.report_healthy().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use hookshot_common::delivery::{Delivery, DeliveryStatus, RetryPhase};
    use hookshot_common::destination::NewDestination;

    use super::*;
    use crate::queue::dispatch_queue;
    use crate::test_utils::{add_destination, store_with_event};

    #[tokio::test]
    async fn test_sweep_resubmits_batch_in_id_order() {
        let (store, event) = store_with_event("{}", &[]).await;
        let destination =
            add_destination(&store, NewDestination::new("orders", "http://localhost/a")).await;
        let now = Utc::now();

        let mut ids = Vec::new();
        for _ in 0..101 {
            let delivery = store
                .create_delivery(event.id, destination.id)
                .await
                .unwrap();
            let due = Delivery {
                status: DeliveryStatus::Failed,
                status_code: Some(500),
                attempts: 5,
                retry_phase: RetryPhase::Scheduled,
                next_attempt_at: Some(now - chrono::Duration::minutes(1)),
                ..delivery.clone()
            };
            assert!(store
                .update_delivery_if(delivery.guard(), &due)
                .await
                .unwrap());
            ids.push(delivery.id);
        }

        let (queue, mut receiver) = dispatch_queue();
        let sweep = RetrySweep::new(store.clone(), queue, DEFAULT_BATCH_SIZE);
        let result = sweep.run_at(now).await.unwrap();

        assert_eq!(
            result,
            SweepResult {
                resubmitted: 100,
                skipped: 0
            }
        );
        for expected in &ids[..100] {
            assert_eq!(receiver.try_recv(), Some(*expected));
            let stored = store.get_delivery(*expected).await.unwrap().unwrap();
            assert_eq!(stored.status, DeliveryStatus::Pending);
            assert_eq!(stored.attempts, 5);
            assert_eq!(stored.next_attempt_at, None);
        }
        assert_eq!(receiver.try_recv(), None);

        // The one left over is picked up by the next sweep.
        let result = sweep.run_at(now).await.unwrap();
        assert_eq!(result.resubmitted, 1);
        assert_eq!(receiver.try_recv(), Some(ids[100]));
    }

    #[tokio::test]
    async fn test_sweep_ignores_deliveries_not_due() {
        let (store, event) = store_with_event("{}", &[]).await;
        let destination =
            add_destination(&store, NewDestination::new("orders", "http://localhost/a")).await;
        let now = Utc::now();

        let delivery = store
            .create_delivery(event.id, destination.id)
            .await
            .unwrap();
        let later = Delivery {
            status: DeliveryStatus::Failed,
            attempts: 6,
            retry_phase: RetryPhase::Scheduled,
            next_attempt_at: Some(now + chrono::Duration::hours(1)),
            ..delivery.clone()
        };
        assert!(store
            .update_delivery_if(delivery.guard(), &later)
            .await
            .unwrap());
        // Pending deliveries belong to the executor.
        store
            .create_delivery(event.id, destination.id)
            .await
            .unwrap();

        let (queue, mut receiver) = dispatch_queue();
        let sweep = RetrySweep::new(store.clone(), queue, DEFAULT_BATCH_SIZE);

        assert_eq!(sweep.run_at(now).await.unwrap(), SweepResult::default());
        assert_eq!(receiver.try_recv(), None);
    }
}
