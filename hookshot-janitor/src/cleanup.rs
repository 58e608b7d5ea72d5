use async_trait::async_trait;
use hookshot_common::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CleanerError {
    #[error("storage error during cleanup: {0}")]
    StoreError(#[from] StoreError),
    #[error("retention of {0} days is out of range")]
    InvalidRetention(u32),
}

/// What a single cleanup run removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupResult {
    pub deleted_events: u64,
}

#[async_trait]
pub trait Cleaner: Send + Sync {
    fn name(&self) -> &'static str;

    async fn cleanup(&self) -> Result<CleanupResult, CleanerError>;
}
