use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hookshot_common::store::Store;
use tracing::info;

use crate::cleanup::{Cleaner, CleanerError, CleanupResult};

pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Deletes events older than the retention window, together with their deliveries.
pub struct RetentionCleaner {
    store: Arc<dyn Store>,
    retention_days: u32,
}

impl RetentionCleaner {
    pub fn new(store: Arc<dyn Store>, retention_days: u32) -> Self {
        Self {
            store,
            retention_days,
        }
    }

    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> Result<CleanupResult, CleanerError> {
        let cutoff = chrono::Duration::try_days(i64::from(self.retention_days))
            .and_then(|retention| now.checked_sub_signed(retention))
            .ok_or(CleanerError::InvalidRetention(self.retention_days))?;

        let deleted_events = self.store.delete_events_received_before(cutoff).await?;
        if deleted_events > 0 {
            info!(
                "deleted {} events received before {}",
                deleted_events, cutoff
            );
        }
        metrics::counter!("hookshot_cleanup_deleted_events_total").increment(deleted_events);

        Ok(CleanupResult { deleted_events })
    }
}

#[async_trait]
impl Cleaner for RetentionCleaner {
    fn name(&self) -> &'static str {
        "retention"
    }

    async fn cleanup(&self) -> Result<CleanupResult, CleanerError> {
        self.cleanup_at(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use hookshot_common::destination::NewDestination;
    use hookshot_common::event::NewEvent;
    use hookshot_common::store::MemoryStore;

    use super::*;

    async fn insert_event_aged(store: &MemoryStore, now: DateTime<Utc>, age_days: i64) -> i64 {
        let mut event = NewEvent::new(b"{}".to_vec(), None, "127.0.0.1");
        event.received_at = now - chrono::Duration::days(age_days);
        store.insert_event(event).await.unwrap().id
    }

    #[tokio::test]
    async fn test_cleanup_deletes_expired_events() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let destination = store
            .insert_destination(NewDestination::new("orders", "https://example.com"))
            .await
            .unwrap();

        let expired = insert_event_aged(&store, now, 45).await;
        let kept = insert_event_aged(&store, now, 3).await;
        store.create_delivery(expired, destination.id).await.unwrap();
        store.create_delivery(kept, destination.id).await.unwrap();

        let cleaner = RetentionCleaner::new(store.clone(), DEFAULT_RETENTION_DAYS);
        let result = cleaner.cleanup_at(now).await.unwrap();

        assert_eq!(result, CleanupResult { deleted_events: 1 });
        assert!(store.get_event(expired).await.unwrap().is_none());
        assert!(store.deliveries_for_event(expired).await.unwrap().is_empty());
        assert!(store.get_event(kept).await.unwrap().is_some());

        // Running again finds nothing left to delete.
        assert_eq!(cleaner.cleanup_at(now).await.unwrap().deleted_events, 0);
    }

    #[tokio::test]
    async fn test_invalid_retention() {
        let cleaner = RetentionCleaner::new(Arc::new(MemoryStore::new()), u32::MAX);

        assert!(matches!(
            cleaner.cleanup().await,
            Err(CleanerError::InvalidRetention(_))
        ));
    }
}
