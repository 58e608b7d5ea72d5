use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hookshot_common::delivery::{Delivery, DeliveryGuard};
use hookshot_common::destination::{Destination, NewDestination};
use hookshot_common::event::{Event, NewEvent};
use hookshot_common::store::{MemoryStore, Store, StoreError, StoreResult};
use hookshot_common::transport::{OutboundRequest, Transport, TransportResult};

/// A `Transport` answering every request with the same status after `delay`, recording what
/// it was sent and the highest number of requests it saw at once.
pub struct FakeTransport {
    status: u16,
    delay: time::Duration,
    current: AtomicUsize,
    pub peak: AtomicUsize,
    pub requests: Mutex<Vec<OutboundRequest>>,
}

impl FakeTransport {
    pub fn new(status: u16, delay: time::Duration) -> Self {
        Self {
            status,
            delay,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn post(&self, request: OutboundRequest) -> TransportResult {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        _ = self.peak.fetch_max(now, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        tokio::time::sleep(self.delay).await;
        _ = self.current.fetch_sub(1, Ordering::SeqCst);

        let success = (200..300).contains(&self.status);
        TransportResult {
            success,
            status_code: Some(self.status),
            body: Some("ok".to_owned()),
            error: if success {
                None
            } else {
                Some(format!("HTTP {}", self.status))
            },
        }
    }
}

pub async fn store_with_event(
    payload: &str,
    headers: &[(&str, &str)],
) -> (Arc<MemoryStore>, Event) {
    let store = Arc::new(MemoryStore::new());
    let mut event = NewEvent::new(payload.as_bytes().to_vec(), Some("application/json"), "10.0.0.1");
    for (name, value) in headers {
        event = event.with_header(name, value);
    }
    let event = store.insert_event(event).await.unwrap();

    (store, event)
}

pub async fn add_destination(store: &MemoryStore, destination: NewDestination) -> Destination {
    store.insert_destination(destination).await.unwrap()
}

/// A `MemoryStore` that fails chosen calls, for exercising store errors mid-pipeline.
pub struct FailingStore {
    inner: Arc<MemoryStore>,
    /// How many upcoming `get_event` calls fail.
    pub get_event_failures: AtomicUsize,
    /// `create_delivery` fails for this destination.
    failing_destination: Option<i64>,
}

impl FailingStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            get_event_failures: AtomicUsize::new(0),
            failing_destination: None,
        }
    }

    pub fn failing_destination(self, destination_id: i64) -> Self {
        Self {
            failing_destination: Some(destination_id),
            ..self
        }
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn ping(&self) -> StoreResult<()> {
        self.inner.ping().await
    }

    async fn insert_event(&self, event: NewEvent) -> StoreResult<Event> {
        self.inner.insert_event(event).await
    }

    async fn get_event(&self, id: i64) -> StoreResult<Option<Event>> {
        let failing = self
            .get_event_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Poisoned);
        }
        self.inner.get_event(id).await
    }

    async fn delete_events_received_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.inner.delete_events_received_before(cutoff).await
    }

    async fn insert_destination(&self, destination: NewDestination) -> StoreResult<Destination> {
        self.inner.insert_destination(destination).await
    }

    async fn get_destination(&self, id: i64) -> StoreResult<Option<Destination>> {
        self.inner.get_destination(id).await
    }

    async fn active_destinations(&self) -> StoreResult<Vec<Destination>> {
        self.inner.active_destinations().await
    }

    async fn create_delivery(&self, event_id: i64, destination_id: i64) -> StoreResult<Delivery> {
        if self.failing_destination == Some(destination_id) {
            return Err(StoreError::Poisoned);
        }
        self.inner.create_delivery(event_id, destination_id).await
    }

    async fn get_delivery(&self, id: i64) -> StoreResult<Option<Delivery>> {
        self.inner.get_delivery(id).await
    }

    async fn deliveries_for_event(&self, event_id: i64) -> StoreResult<Vec<Delivery>> {
        self.inner.deliveries_for_event(event_id).await
    }

    async fn update_delivery_if(
        &self,
        guard: DeliveryGuard,
        updated: &Delivery,
    ) -> StoreResult<bool> {
        self.inner.update_delivery_if(guard, updated).await
    }

    async fn deliveries_due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<Delivery>> {
        self.inner.deliveries_due_for_retry(now, limit).await
    }

    async fn unfinished_deliveries(&self) -> StoreResult<Vec<Delivery>> {
        self.inner.unfinished_deliveries().await
    }
}
