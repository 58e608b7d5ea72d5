//! # Dispatcher
//!
//! Turns stored events into deliveries: one per active destination, filtered or queued for an
//! attempt. Also hosts the operator actions that put existing work back in line.
use std::sync::Arc;

use hookshot_common::delivery::Delivery;
use hookshot_common::destination::Destination;
use hookshot_common::event::Event;
use hookshot_common::filter;
use hookshot_common::store::Store;
use tracing::{debug, error, info};

use crate::error::DispatchError;
use crate::queue::DispatchQueue;

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn Store>,
    queue: DispatchQueue,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, queue: DispatchQueue) -> Self {
        Self { store, queue }
    }

    /// Create a delivery for every active destination, in ascending destination id order.
    ///
    /// A failure for one destination does not stop the others. Deliveries already created stay
    /// queued and the first error is returned once every destination was tried.
    pub async fn dispatch_to_all_active(
        &self,
        event: &Event,
    ) -> Result<Vec<Delivery>, DispatchError> {
        let destinations = self.store.active_destinations().await?;
        let mut deliveries = Vec::with_capacity(destinations.len());
        let mut first_error = None;

        for destination in &destinations {
            match self.dispatch_to_one(event, destination).await {
                Ok(delivery) => deliveries.push(delivery),
                Err(err) => {
                    error!(
                        "failed to dispatch event {} to destination {}: {}",
                        event.id, destination.id, err
                    );
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        debug!(
            "event {} dispatched to {} destinations",
            event.id,
            deliveries.len()
        );
        Ok(deliveries)
    }

    /// Create a delivery of `event` to `destination`. The delivery is marked filtered when the
    /// destination's rules reject the event, and submitted for an attempt otherwise.
    pub async fn dispatch_to_one(
        &self,
        event: &Event,
        destination: &Destination,
    ) -> Result<Delivery, DispatchError> {
        let delivery = self.store.create_delivery(event.id, destination.id).await?;

        if filter::passes(event, destination) {
            self.queue.submit(delivery.id)?;
            metrics::counter!("hookshot_deliveries_created_total", "outcome" => "queued")
                .increment(1);
            return Ok(delivery);
        }

        let filtered = delivery
            .filter_out()
            .ok_or(DispatchError::Conflict(delivery.id))?;
        if !self
            .store
            .update_delivery_if(delivery.guard(), &filtered)
            .await?
        {
            return Err(DispatchError::Conflict(delivery.id));
        }

        debug!(
            "event {} filtered out for destination {}",
            event.id, destination.id
        );
        metrics::counter!("hookshot_deliveries_created_total", "outcome" => "filtered")
            .increment(1);
        Ok(filtered)
    }

    /// Dispatch a stored event again, creating fresh deliveries for every active destination.
    pub async fn replay(&self, event_id: i64) -> Result<Vec<Delivery>, DispatchError> {
        let event = self
            .store
            .get_event(event_id)
            .await?
            .ok_or(DispatchError::EventNotFound(event_id))?;

        info!("replaying event {}", event_id);
        self.dispatch_to_all_active(&event).await
    }

    /// Reset a failed delivery to pending and submit it. Attempts already made are kept.
    pub async fn retry_delivery(&self, delivery_id: i64) -> Result<Delivery, DispatchError> {
        let delivery = self
            .store
            .get_delivery(delivery_id)
            .await?
            .ok_or(DispatchError::DeliveryNotFound(delivery_id))?;

        let reset = delivery
            .reset_for_retry()
            .ok_or_else(|| DispatchError::NotRetryable {
                id: delivery_id,
                reason: not_retryable_reason(&delivery),
            })?;

        if !self
            .store
            .update_delivery_if(delivery.guard(), &reset)
            .await?
        {
            return Err(DispatchError::Conflict(delivery_id));
        }

        self.queue.submit(delivery_id)?;
        info!("delivery {} manually resubmitted", delivery_id);
        Ok(reset)
    }
}

fn not_retryable_reason(delivery: &Delivery) -> String {
    if delivery.in_flight {
        "an attempt is in flight".to_owned()
    } else if delivery.is_exhausted() {
        format!("all {} attempts were used", delivery.attempts)
    } else {
        format!("status is {}", delivery.status)
    }
}

#[cfg(test)]
mod tests {
    use std::time;

    use hookshot_common::delivery::{DeliveryStatus, RetryPhase};
    use hookshot_common::destination::{FilterOperator, FilterRule, NewDestination};
    use hookshot_common::retry::{RetryPolicy, MAX_TOTAL_ATTEMPTS};
    use hookshot_common::store::MemoryStore;

    use super::*;
    use crate::queue::{dispatch_queue, DispatchReceiver};
    use crate::test_utils::{add_destination, store_with_event, FailingStore, FakeTransport};
    use crate::worker::{AttemptExecutor, AttemptOutcome};

    fn dispatcher(store: Arc<MemoryStore>) -> (Dispatcher, DispatchReceiver) {
        let (queue, receiver) = dispatch_queue();
        (Dispatcher::new(store, queue), receiver)
    }

    fn api_key_filter(value: &str) -> FilterRule {
        FilterRule::header("X-Api-Key", FilterOperator::Equals, Some(value)).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_to_all_active() {
        let (store, event) = store_with_event(r#"{"kind":"order"}"#, &[("X-Api-Key", "secret")]).await;
        let matching = add_destination(
            &store,
            NewDestination::new("matching", "http://localhost/a").with_filter(api_key_filter("secret")),
        )
        .await;
        let rejecting = add_destination(
            &store,
            NewDestination::new("rejecting", "http://localhost/b").with_filter(api_key_filter("wrong")),
        )
        .await;
        add_destination(
            &store,
            NewDestination::new("inactive", "http://localhost/c").inactive(),
        )
        .await;

        let (dispatcher, mut receiver) = dispatcher(store.clone());
        let deliveries = dispatcher.dispatch_to_all_active(&event).await.unwrap();

        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].destination_id, matching.id);
        assert_eq!(deliveries[0].status, DeliveryStatus::Pending);
        assert_eq!(deliveries[1].destination_id, rejecting.id);
        assert_eq!(deliveries[1].status, DeliveryStatus::Filtered);
        assert_eq!(deliveries[1].attempts, 0);

        // Only the delivery that passed its filters is queued.
        assert_eq!(receiver.try_recv(), Some(deliveries[0].id));
        assert_eq!(receiver.try_recv(), None);
    }

    #[tokio::test]
    async fn test_filtered_delivery_never_reaches_transport() {
        let (store, event) = store_with_event("{}", &[("X-Api-Key", "nope")]).await;
        add_destination(
            &store,
            NewDestination::new("orders", "http://localhost/a").with_filter(api_key_filter("secret")),
        )
        .await;

        let (dispatcher, _receiver) = dispatcher(store.clone());
        let deliveries = dispatcher.dispatch_to_all_active(&event).await.unwrap();

        let transport = Arc::new(FakeTransport::new(200, time::Duration::ZERO));
        let (queue, _) = dispatch_queue();
        let executor = AttemptExecutor::new(store.clone(), transport.clone(), queue, RetryPolicy::default());
        assert_eq!(
            executor.execute(deliveries[0].id).await.unwrap(),
            AttemptOutcome::Skipped
        );
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_failing_destination_does_not_stop_fan_out() {
        let (memory, event) = store_with_event("{}", &[]).await;
        let first = add_destination(&memory, NewDestination::new("first", "http://localhost/a")).await;
        let broken =
            add_destination(&memory, NewDestination::new("broken", "http://localhost/b")).await;
        let last = add_destination(&memory, NewDestination::new("last", "http://localhost/c")).await;

        let store = FailingStore::new(memory.clone()).failing_destination(broken.id);
        let (queue, mut receiver) = dispatch_queue();
        let dispatcher = Dispatcher::new(Arc::new(store), queue);

        assert!(matches!(
            dispatcher.dispatch_to_all_active(&event).await,
            Err(DispatchError::StoreError(_))
        ));

        let created = memory.deliveries_for_event(event.id).await.unwrap();
        let mut destinations: Vec<i64> = created.iter().map(|d| d.destination_id).collect();
        destinations.sort();
        assert_eq!(destinations, vec![first.id, last.id]);
        assert!(receiver.try_recv().is_some());
        assert!(receiver.try_recv().is_some());
        assert_eq!(receiver.try_recv(), None);
    }

    #[tokio::test]
    async fn test_replay_creates_new_deliveries() {
        let (store, event) = store_with_event("{}", &[]).await;
        add_destination(&store, NewDestination::new("orders", "http://localhost/a")).await;

        let (dispatcher, mut receiver) = dispatcher(store.clone());
        let first = dispatcher.dispatch_to_all_active(&event).await.unwrap();
        let replayed = dispatcher.replay(event.id).await.unwrap();

        assert_eq!(replayed.len(), 1);
        assert_ne!(replayed[0].id, first[0].id);
        assert_eq!(store.deliveries_for_event(event.id).await.unwrap().len(), 2);
        assert_eq!(receiver.try_recv(), Some(first[0].id));
        assert_eq!(receiver.try_recv(), Some(replayed[0].id));

        assert!(matches!(
            dispatcher.replay(event.id + 1).await,
            Err(DispatchError::EventNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_delivery() {
        let (store, event) = store_with_event("{}", &[]).await;
        let destination =
            add_destination(&store, NewDestination::new("orders", "http://localhost/a")).await;
        let delivery = store
            .create_delivery(event.id, destination.id)
            .await
            .unwrap();

        let (dispatcher, mut receiver) = dispatcher(store.clone());

        // Pending deliveries are not retryable.
        assert!(matches!(
            dispatcher.retry_delivery(delivery.id).await,
            Err(DispatchError::NotRetryable { .. })
        ));

        let failed = Delivery {
            status: DeliveryStatus::Failed,
            status_code: Some(400),
            attempts: 2,
            ..delivery.clone()
        };
        assert!(store
            .update_delivery_if(delivery.guard(), &failed)
            .await
            .unwrap());

        let reset = dispatcher.retry_delivery(delivery.id).await.unwrap();
        assert_eq!(reset.status, DeliveryStatus::Pending);
        assert_eq!(reset.attempts, 2);
        assert_eq!(reset.retry_phase, RetryPhase::Immediate);
        assert_eq!(receiver.try_recv(), Some(delivery.id));

        assert!(matches!(
            dispatcher.retry_delivery(delivery.id + 1).await,
            Err(DispatchError::DeliveryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_delivery_rejects_exhausted() {
        let (store, event) = store_with_event("{}", &[]).await;
        let destination =
            add_destination(&store, NewDestination::new("orders", "http://localhost/a")).await;
        let delivery = store
            .create_delivery(event.id, destination.id)
            .await
            .unwrap();
        let exhausted = Delivery {
            status: DeliveryStatus::Failed,
            attempts: MAX_TOTAL_ATTEMPTS,
            retry_phase: RetryPhase::Scheduled,
            ..delivery.clone()
        };
        assert!(store
            .update_delivery_if(delivery.guard(), &exhausted)
            .await
            .unwrap());

        let (dispatcher, mut receiver) = dispatcher(store.clone());
        match dispatcher.retry_delivery(delivery.id).await {
            Err(DispatchError::NotRetryable { reason, .. }) => {
                assert_eq!(reason, "all 10 attempts were used")
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(receiver.try_recv(), None);
    }
}
