use std::collections::HashMap;
use std::sync::Arc;
use std::time;

use chrono::Utc;
use hookshot_common::delivery::{AttemptClass, Delivery, DeliveryStatus, RetryPhase};
use hookshot_common::destination::Destination;
use hookshot_common::event::Event;
use hookshot_common::health::HealthHandle;
use hookshot_common::retry::{RetryPolicy, MAX_TOTAL_ATTEMPTS};
use hookshot_common::store::Store;
use hookshot_common::transport::{OutboundRequest, Transport};
use hookshot_common::USER_AGENT;
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::limiter::ConcurrencyLimiter;
use crate::queue::{DispatchQueue, DispatchReceiver};

/// What a single call to `AttemptExecutor::execute` ended up doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Nothing to do: the delivery is gone, finished, exhausted or claimed elsewhere.
    Skipped,
    Delivered,
    /// A 4xx response. The delivery waits for an operator or the sweep.
    ClientFailure,
    /// A transient failure in the immediate phase; resubmitted after the given backoff.
    RetryScheduled(time::Duration),
    /// A failure left for the retry sweep to pick up.
    AwaitingSweep,
    /// The last allowed attempt failed.
    Exhausted,
    /// The event or destination no longer exists.
    Abandoned,
}

impl AttemptOutcome {
    fn as_label(&self) -> &'static str {
        match self {
            AttemptOutcome::Skipped => "skipped",
            AttemptOutcome::Delivered => "delivered",
            AttemptOutcome::ClientFailure => "client_failure",
            AttemptOutcome::RetryScheduled(_) => "retry_scheduled",
            AttemptOutcome::AwaitingSweep => "awaiting_sweep",
            AttemptOutcome::Exhausted => "exhausted",
            AttemptOutcome::Abandoned => "abandoned",
        }
    }
}

/// Runs one attempt of one delivery: claim, POST, record the outcome, and resubmit when the
/// immediate phase calls for it.
#[derive(Clone)]
pub struct AttemptExecutor {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    queue: DispatchQueue,
    retry_policy: RetryPolicy,
}

impl AttemptExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        queue: DispatchQueue,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            transport,
            queue,
            retry_policy,
        }
    }

    pub async fn execute(&self, delivery_id: i64) -> Result<AttemptOutcome, WorkerError> {
        let outcome = self.attempt(delivery_id).await?;
        metrics::counter!("hookshot_delivery_attempts_total", "outcome" => outcome.as_label())
            .increment(1);
        Ok(outcome)
    }

    async fn attempt(&self, delivery_id: i64) -> Result<AttemptOutcome, WorkerError> {
        let Some(delivery) = self.store.get_delivery(delivery_id).await? else {
            debug!("delivery {} no longer exists", delivery_id);
            return Ok(AttemptOutcome::Skipped);
        };

        let claimed = match delivery.begin_attempt(Utc::now()) {
            Ok(claimed) => claimed,
            Err(reason) => {
                debug!("skipping delivery {}: {}", delivery_id, reason);
                return Ok(AttemptOutcome::Skipped);
            }
        };
        if !self
            .store
            .update_delivery_if(delivery.guard(), &claimed)
            .await?
        {
            debug!("delivery {} was claimed by another attempt", delivery_id);
            return Ok(AttemptOutcome::Skipped);
        }

        info!(
            "delivery {} attempt {}/{}",
            delivery_id, claimed.attempts, MAX_TOTAL_ATTEMPTS
        );

        match self.attempt_claimed(&claimed).await {
            Ok(outcome) => {
                debug!("delivery {} attempt finished: {:?}", delivery_id, outcome);
                Ok(outcome)
            }
            Err(error) => {
                self.release(&delivery, &claimed).await;
                Err(error)
            }
        }
    }

    /// Everything after the claim. Errors leave the claim held for the caller to release.
    async fn attempt_claimed(&self, claimed: &Delivery) -> Result<AttemptOutcome, WorkerError> {
        let delivery_id = claimed.id;
        let event = self.store.get_event(claimed.event_id).await?;
        let destination = self.store.get_destination(claimed.destination_id).await?;
        let (event, destination) = match (event, destination) {
            (Some(event), Some(destination)) => (event, destination),
            (None, _) => {
                let reason = format!("Event {} no longer exists", claimed.event_id);
                return self.abandon(claimed, &reason).await;
            }
            (_, None) => {
                let reason = format!("Destination {} no longer exists", claimed.destination_id);
                return self.abandon(claimed, &reason).await;
            }
        };

        let request = OutboundRequest {
            url: destination.url.clone(),
            body: event.payload.clone(),
            headers: outbound_headers(&event, &destination, claimed),
            timeout: destination.timeout(),
        };

        let started = tokio::time::Instant::now();
        let result = self.transport.post(request).await;
        metrics::histogram!("hookshot_delivery_attempt_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let completed = claimed.complete_attempt(&result, Utc::now());
        if !self
            .store
            .update_delivery_if(claimed.guard(), &completed)
            .await?
        {
            warn!(
                "delivery {} changed while attempt {} was in flight, outcome not recorded",
                delivery_id, claimed.attempts
            );
            return Ok(AttemptOutcome::Skipped);
        }

        let outcome = match AttemptClass::classify(&result) {
            AttemptClass::Delivered => AttemptOutcome::Delivered,
            AttemptClass::ClientFailure if completed.retry_phase == RetryPhase::Immediate => {
                warn!(
                    "delivery {} got HTTP {} on attempt {}, it will not be retried automatically",
                    delivery_id,
                    completed.status_code.unwrap_or_default(),
                    completed.attempts
                );
                AttemptOutcome::ClientFailure
            }
            _ if completed.awaits_immediate_retry() => {
                let backoff = self.retry_policy.retry_interval(completed.attempts);
                self.queue.submit_after(delivery_id, backoff);
                AttemptOutcome::RetryScheduled(backoff)
            }
            _ if completed.next_attempt_at.is_some() => AttemptOutcome::AwaitingSweep,
            _ => {
                warn!(
                    "delivery {} failed after {} attempts, giving up",
                    delivery_id, completed.attempts
                );
                AttemptOutcome::Exhausted
            }
        };

        Ok(outcome)
    }

    /// Undo a claim whose attempt failed on a store error: put back the record as it was before
    /// the claim and resubmit it after a backoff.
    async fn release(&self, unclaimed: &Delivery, claimed: &Delivery) {
        match self
            .store
            .update_delivery_if(claimed.guard(), unclaimed)
            .await
        {
            Ok(true) => {
                let backoff = self.retry_policy.retry_interval(claimed.attempts);
                warn!(
                    "released delivery {} after a failed attempt, resubmitting in {:?}",
                    claimed.id, backoff
                );
                self.queue.submit_after(claimed.id, backoff);
            }
            Ok(false) => {
                debug!("delivery {} changed before its claim was released", claimed.id);
            }
            Err(error) => {
                error!("failed to release delivery {}: {}", claimed.id, error);
            }
        }
    }

    async fn abandon(
        &self,
        claimed: &Delivery,
        reason: &str,
    ) -> Result<AttemptOutcome, WorkerError> {
        warn!("abandoning delivery {}: {}", claimed.id, reason);

        let abandoned = claimed.abandon_attempt(reason, Utc::now());
        if !self
            .store
            .update_delivery_if(claimed.guard(), &abandoned)
            .await?
        {
            return Ok(AttemptOutcome::Skipped);
        }
        Ok(AttemptOutcome::Abandoned)
    }

    /// Put deliveries left unfinished by a previous process back on the queue.
    ///
    /// Claims left behind are released first. Deliveries whose last attempt got a 4xx stay
    /// where they are. Returns how many deliveries were resubmitted.
    pub async fn recover(&self) -> Result<usize, WorkerError> {
        let mut resubmitted = 0;

        for delivery in self.store.unfinished_deliveries().await? {
            let delivery = match delivery.release_claim() {
                Some(released) => {
                    if !self
                        .store
                        .update_delivery_if(delivery.guard(), &released)
                        .await?
                    {
                        continue;
                    }
                    released
                }
                None => delivery,
            };

            let resubmit = match delivery.status {
                DeliveryStatus::Pending => true,
                DeliveryStatus::Failed => {
                    delivery.awaits_immediate_retry()
                        && !delivery
                            .status_code
                            .is_some_and(|code| (400..500).contains(&code))
                }
                DeliveryStatus::Success | DeliveryStatus::Filtered => false,
            };

            if resubmit {
                self.queue.submit(delivery.id)?;
                resubmitted += 1;
            }
        }

        if resubmitted > 0 {
            info!("recovered {} unfinished deliveries", resubmitted);
        }
        Ok(resubmitted)
    }
}

/// Destination custom headers, overridden case-insensitively by the headers every delivery
/// carries.
pub fn outbound_headers(
    event: &Event,
    destination: &Destination,
    delivery: &Delivery,
) -> HashMap<String, String> {
    let system = [
        ("Content-Type", event.content_type.clone()),
        ("X-Hookshot-Event-Id", event.id.to_string()),
        ("X-Hookshot-Delivery-Id", delivery.id.to_string()),
        ("User-Agent", USER_AGENT.to_owned()),
        ("X-Hookshot-Attempt", delivery.attempts.to_string()),
    ];

    let mut headers: HashMap<String, String> = destination
        .custom_headers
        .iter()
        .filter(|(name, _)| {
            !system
                .iter()
                .any(|(system_name, _)| system_name.eq_ignore_ascii_case(name))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    headers.extend(
        system
            .into_iter()
            .map(|(name, value)| (name.to_owned(), value)),
    );

    headers
}

/// Receives delivery ids from the dispatch queue and runs their attempts, at most as many at
/// once as the limiter allows.
pub struct DispatchWorker {
    executor: AttemptExecutor,
    limiter: ConcurrencyLimiter,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
    heartbeat_interval: time::Duration,
}

impl DispatchWorker {
    pub fn new(
        executor: AttemptExecutor,
        limiter: ConcurrencyLimiter,
        liveness: HealthHandle,
        heartbeat_interval: time::Duration,
    ) -> Self {
        Self {
            executor,
            limiter,
            liveness,
            heartbeat_interval,
        }
    }

    /// Run until every `DispatchQueue` feeding `receiver` has been dropped.
    pub async fn run(&self, mut receiver: DispatchReceiver) -> Result<(), WorkerError> {
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);

        loop {
            self.limiter.report_saturation();

            tokio::select! {
                _ = heartbeat.tick() => {
                    self.liveness.report_healthy().await;
                }
                next = receiver.recv() => {
                    let Some(delivery_id) = next else {
                        info!("dispatch queue closed, worker stopping");
                        return Ok(());
                    };
                    self.spawn_attempt(delivery_id).await?;
                }
            }
        }
    }

    /// Spawn a task running one attempt once a limiter slot is free.
    async fn spawn_attempt(&self, delivery_id: i64) -> Result<(), WorkerError> {
        let permit = self.limiter.acquire().await?;
        let executor = self.executor.clone();

        tokio::spawn(async move {
            if let Err(error) = executor.execute(delivery_id).await {
                error!("failed to process delivery {}: {}", delivery_id, error);
            }
            drop(permit);
        });

        Ok(())
    }
}
