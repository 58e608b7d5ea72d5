use hookshot_common::store::StoreError;
use thiserror::Error;

/// Enumeration of errors related to executing delivery attempts.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a storage error occurred: {0}")]
    StoreError(#[from] StoreError),
    #[error("the dispatch queue has been closed")]
    QueueClosed,
    #[error("the {0} concurrency limiter has been closed")]
    LimiterClosed(String),
}

/// Enumeration of errors for dispatching, replaying and retrying deliveries.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("a storage error occurred: {0}")]
    StoreError(#[from] StoreError),
    #[error(transparent)]
    WorkerError(#[from] WorkerError),
    #[error("event {0} not found")]
    EventNotFound(i64),
    #[error("destination {0} not found")]
    DestinationNotFound(i64),
    #[error("delivery {0} not found")]
    DeliveryNotFound(i64),
    #[error("delivery {id} cannot be retried: {reason}")]
    NotRetryable { id: i64, reason: String },
    #[error("delivery {0} was modified concurrently")]
    Conflict(i64),
}
