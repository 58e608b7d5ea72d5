use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Store, StoreError, StoreResult};
use crate::delivery::{Delivery, DeliveryGuard, DeliveryStatus, RetryPhase};
use crate::destination::{Destination, NewDestination};
use crate::event::{Event, NewEvent};
use crate::retry::MAX_TOTAL_ATTEMPTS;

#[derive(Default)]
struct Tables {
    events: BTreeMap<i64, Event>,
    destinations: BTreeMap<i64, Destination>,
    deliveries: BTreeMap<i64, Delivery>,
    last_event_id: i64,
    last_destination_id: i64,
    last_delivery_id: i64,
}

/// A `Store` keeping everything in process memory. Ids are assigned sequentially from 1.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.tables().map(|_| ())
    }

    async fn insert_event(&self, event: NewEvent) -> StoreResult<Event> {
        let mut tables = self.tables()?;
        tables.last_event_id += 1;

        let event = Event {
            id: tables.last_event_id,
            headers: event.headers,
            payload: event.payload,
            content_type: event.content_type,
            source_ip: event.source_ip,
            received_at: event.received_at,
        };
        drop(tables.events.insert(event.id, event.clone()));

        Ok(event)
    }

    async fn get_event(&self, id: i64) -> StoreResult<Option<Event>> {
        Ok(self.tables()?.events.get(&id).cloned())
    }

    async fn delete_events_received_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.tables()?;

        let expired: Vec<i64> = tables
            .events
            .values()
            .filter(|event| event.received_at < cutoff)
            .map(|event| event.id)
            .collect();

        for id in &expired {
            drop(tables.events.remove(id));
        }
        tables
            .deliveries
            .retain(|_, delivery| !expired.contains(&delivery.event_id));

        Ok(u64::try_from(expired.len()).unwrap_or(u64::MAX))
    }

    async fn insert_destination(&self, destination: NewDestination) -> StoreResult<Destination> {
        destination.validate()?;

        let mut tables = self.tables()?;
        tables.last_destination_id += 1;

        let destination = Destination {
            id: tables.last_destination_id,
            name: destination.name,
            url: destination.url,
            active: destination.active,
            custom_headers: destination.custom_headers,
            timeout_secs: destination.timeout_secs,
            filters: destination.filters,
        };
        drop(tables
            .destinations
            .insert(destination.id, destination.clone()));

        Ok(destination)
    }

    async fn get_destination(&self, id: i64) -> StoreResult<Option<Destination>> {
        Ok(self.tables()?.destinations.get(&id).cloned())
    }

    async fn active_destinations(&self) -> StoreResult<Vec<Destination>> {
        Ok(self
            .tables()?
            .destinations
            .values()
            .filter(|destination| destination.active)
            .cloned()
            .collect())
    }

    async fn create_delivery(&self, event_id: i64, destination_id: i64) -> StoreResult<Delivery> {
        let mut tables = self.tables()?;

        if !tables.events.contains_key(&event_id) {
            return Err(StoreError::NotFound(format!("event {}", event_id)));
        }
        if !tables.destinations.contains_key(&destination_id) {
            return Err(StoreError::NotFound(format!("destination {}", destination_id)));
        }

        tables.last_delivery_id += 1;
        let delivery = Delivery::new(
            tables.last_delivery_id,
            event_id,
            destination_id,
            Utc::now(),
        );
        drop(tables.deliveries.insert(delivery.id, delivery.clone()));

        Ok(delivery)
    }

    async fn get_delivery(&self, id: i64) -> StoreResult<Option<Delivery>> {
        Ok(self.tables()?.deliveries.get(&id).cloned())
    }

    async fn deliveries_for_event(&self, event_id: i64) -> StoreResult<Vec<Delivery>> {
        Ok(self
            .tables()?
            .deliveries
            .values()
            .filter(|delivery| delivery.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn update_delivery_if(
        &self,
        guard: DeliveryGuard,
        updated: &Delivery,
    ) -> StoreResult<bool> {
        let mut tables = self.tables()?;

        match tables.deliveries.get_mut(&guard.id) {
            Some(current) if current.guard() == guard => {
                *current = Delivery {
                    id: current.id,
                    event_id: current.event_id,
                    destination_id: current.destination_id,
                    created_at: current.created_at,
                    ..updated.clone()
                };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn deliveries_due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<Delivery>> {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);

        Ok(self
            .tables()?
            .deliveries
            .values()
            .filter(|delivery| {
                delivery.status == DeliveryStatus::Failed
                    && delivery.retry_phase == RetryPhase::Scheduled
                    && delivery.next_attempt_at.is_some_and(|due| due <= now)
                    && delivery.attempts < MAX_TOTAL_ATTEMPTS
                    && !delivery.in_flight
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn unfinished_deliveries(&self) -> StoreResult<Vec<Delivery>> {
        Ok(self
            .tables()?
            .deliveries
            .values()
            .filter(|delivery| match delivery.status {
                DeliveryStatus::Pending => true,
                DeliveryStatus::Failed => delivery.retry_phase == RetryPhase::Immediate,
                DeliveryStatus::Success | DeliveryStatus::Filtered => false,
            })
            .cloned()
            .collect())
    }
}
