//! # Store
//!
//! Persistence for events, destinations and deliveries. Delivery records are only ever
//! changed through `update_delivery_if`, a compare-and-swap on the fields of the record the
//! change was computed from.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::delivery::{Delivery, DeliveryGuard};
use crate::destination::{Destination, DestinationError, NewDestination};
use crate::event::{Event, NewEvent};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Enumeration of errors for operations with a Store.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("migrations failed with: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),
    #[error("invalid destination: {0}")]
    InvalidDestination(#[from] DestinationError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("store lock was poisoned")]
    Poisoned,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Check the backing storage is reachable.
    async fn ping(&self) -> StoreResult<()>;

    async fn insert_event(&self, event: NewEvent) -> StoreResult<Event>;

    async fn get_event(&self, id: i64) -> StoreResult<Option<Event>>;

    /// Delete events received before `cutoff` along with their deliveries.
    /// Returns the number of events deleted.
    async fn delete_events_received_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    /// Validate and store a destination with its filter rules.
    async fn insert_destination(&self, destination: NewDestination) -> StoreResult<Destination>;

    async fn get_destination(&self, id: i64) -> StoreResult<Option<Destination>>;

    /// Active destinations in ascending id order.
    async fn active_destinations(&self) -> StoreResult<Vec<Destination>>;

    /// Create a pending delivery that has never been attempted.
    async fn create_delivery(&self, event_id: i64, destination_id: i64) -> StoreResult<Delivery>;

    async fn get_delivery(&self, id: i64) -> StoreResult<Option<Delivery>>;

    async fn deliveries_for_event(&self, event_id: i64) -> StoreResult<Vec<Delivery>>;

    /// Replace a delivery with `updated` only if its status, attempts and claim still match
    /// `guard`. Returns whether the update was applied.
    async fn update_delivery_if(
        &self,
        guard: DeliveryGuard,
        updated: &Delivery,
    ) -> StoreResult<bool>;

    /// Failed, scheduled-phase deliveries due at `now` with attempts left, in ascending id
    /// order, at most `limit` of them.
    async fn deliveries_due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<Delivery>>;

    /// Deliveries that are pending or failed in the immediate phase, in ascending id order.
    async fn unfinished_deliveries(&self) -> StoreResult<Vec<Delivery>>;
}
