use std::time::Duration;

use hookshot_common::capture::{ErrorEnvelope, ErrorReporter};
use hookshot_common::health::HealthHandle;
use tokio::sync::Semaphore;
use tracing::info;

pub mod cleanup;
pub mod retention;

use cleanup::Cleaner;

/// Run `cleaner` every `interval`, one run at a time. Failures are reported and the loop goes on.
pub async fn cleanup_loop(
    cleaner: Box<dyn Cleaner>,
    interval: Duration,
    liveness: HealthHandle,
    reporter: ErrorReporter,
) {
    let semaphore = Semaphore::new(1);
    let mut interval = tokio::time::interval(interval);

    loop {
        let permit = semaphore.acquire().await;
        interval.tick().await;

        match cleaner.cleanup().await {
            Ok(result) => info!("{} cleanup finished: {:?}", cleaner.name(), result),
            Err(error) => reporter.report(
                ErrorEnvelope::from_error(&error)
                    .with_context(serde_json::json!({ "task": cleaner.name() })),
            ),
        }
        liveness.report_healthy().await;

        drop(permit);
    }
}
