//! # Delivery
//!
//! One attempt-tracking record per (event, destination) pair, and the state machine that
//! governs it. Every transition is a pure function producing the next record; stores persist
//! it with a conditional update guarded by the record it was derived from.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::{next_attempt_at, IMMEDIATE_MAX_ATTEMPTS, MAX_TOTAL_ATTEMPTS};
use crate::transport::TransportResult;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("{0} is not a valid DeliveryStatus")]
    ParseDeliveryStatusError(String),
    #[error("{0} is not a valid RetryPhase")]
    ParseRetryPhaseError(String),
}

/// Enumeration of possible statuses for a Delivery.
/// Pending: Waiting to be attempted, or currently being attempted.
/// Success: A destination accepted the event. Terminal.
/// Failed: The last attempt did not succeed. May be retried.
/// Filtered: The destination's filter rules rejected the event. Terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "delivery_status", rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
    Filtered,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        match self {
            DeliveryStatus::Success | DeliveryStatus::Filtered => true,
            DeliveryStatus::Pending | DeliveryStatus::Failed => false,
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "success" => Ok(DeliveryStatus::Success),
            "failed" => Ok(DeliveryStatus::Failed),
            "filtered" => Ok(DeliveryStatus::Filtered),
            invalid => Err(DeliveryError::ParseDeliveryStatusError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Success => write!(f, "success"),
            DeliveryStatus::Failed => write!(f, "failed"),
            DeliveryStatus::Filtered => write!(f, "filtered"),
        }
    }
}

/// Which retry regime a delivery is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "retry_phase", rename_all = "lowercase")]
pub enum RetryPhase {
    /// Resubmitted in-process with a short polynomial backoff.
    Immediate,
    /// Picked up by the periodic sweep once `next_attempt_at` has passed.
    Scheduled,
}

impl FromStr for RetryPhase {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(RetryPhase::Immediate),
            "scheduled" => Ok(RetryPhase::Scheduled),
            invalid => Err(DeliveryError::ParseRetryPhaseError(invalid.to_owned())),
        }
    }
}

/// How the outcome of an attempt affects retrying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptClass {
    Delivered,
    /// A 4xx response. Never resubmitted automatically in the immediate phase.
    ClientFailure,
    /// 5xx, timeouts, connection failures and anything else.
    TransientFailure,
}

impl AttemptClass {
    pub fn classify(result: &TransportResult) -> Self {
        if result.success {
            AttemptClass::Delivered
        } else if result.is_client_error() {
            AttemptClass::ClientFailure
        } else {
            AttemptClass::TransientFailure
        }
    }
}

/// Why an attempt could not be started.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AttemptRejected {
    #[error("delivery is already {0}")]
    Finished(DeliveryStatus),
    #[error("delivery has an attempt in flight")]
    InFlight,
    #[error("delivery has used all {MAX_TOTAL_ATTEMPTS} attempts")]
    Exhausted,
}

/// The fields a conditional update compares against before writing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryGuard {
    pub id: i64,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub in_flight: bool,
}

/// The delivery of one event to one destination.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Delivery {
    pub id: i64,
    pub event_id: i64,
    pub destination_id: i64,
    pub status: DeliveryStatus,
    pub status_code: Option<i32>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub retry_phase: RetryPhase,
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Set while an attempt holds the claim on this delivery.
    pub in_flight: bool,
    pub created_at: DateTime<Utc>,
}

impl Delivery {
    /// A fresh, pending delivery. The id is assigned by the store.
    pub fn new(id: i64, event_id: i64, destination_id: i64, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            event_id,
            destination_id,
            status: DeliveryStatus::Pending,
            status_code: None,
            response_body: None,
            error_message: None,
            attempts: 0,
            dispatched_at: None,
            last_attempt_at: None,
            retry_phase: RetryPhase::Immediate,
            next_attempt_at: None,
            in_flight: false,
            created_at,
        }
    }

    pub fn guard(&self) -> DeliveryGuard {
        DeliveryGuard {
            id: self.id,
            status: self.status,
            attempts: self.attempts,
            in_flight: self.in_flight,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= MAX_TOTAL_ATTEMPTS
    }

    /// Failed deliveries with attempts left can be retried by an operator.
    pub fn is_retryable(&self) -> bool {
        self.status == DeliveryStatus::Failed && !self.is_exhausted() && !self.in_flight
    }

    pub fn ready_for_scheduled_phase(&self) -> bool {
        self.status == DeliveryStatus::Failed
            && self.retry_phase == RetryPhase::Immediate
            && self.attempts >= IMMEDIATE_MAX_ATTEMPTS
    }

    /// Whether the immediate-phase executor should resubmit this delivery on its own.
    pub fn awaits_immediate_retry(&self) -> bool {
        self.status == DeliveryStatus::Failed
            && self.retry_phase == RetryPhase::Immediate
            && self.attempts < IMMEDIATE_MAX_ATTEMPTS
            && !self.in_flight
    }

    /// Reject a delivery that has never been attempted.
    pub fn filter_out(&self) -> Option<Delivery> {
        if self.status != DeliveryStatus::Pending || self.attempts > 0 || self.in_flight {
            return None;
        }

        Some(Delivery {
            status: DeliveryStatus::Filtered,
            ..self.clone()
        })
    }

    /// Claim the delivery for a new attempt.
    pub fn begin_attempt(&self, now: DateTime<Utc>) -> Result<Delivery, AttemptRejected> {
        if self.status.is_terminal() {
            return Err(AttemptRejected::Finished(self.status));
        }
        if self.in_flight {
            return Err(AttemptRejected::InFlight);
        }
        if self.is_exhausted() {
            return Err(AttemptRejected::Exhausted);
        }

        Ok(Delivery {
            status: DeliveryStatus::Pending,
            attempts: self.attempts + 1,
            last_attempt_at: Some(now),
            next_attempt_at: None,
            in_flight: true,
            ..self.clone()
        })
    }

    /// Record the outcome of the attempt in flight and release the claim.
    ///
    /// A failure that used up the immediate phase moves the delivery to the scheduled phase,
    /// and every failure in the scheduled phase gets its next due time from the schedule.
    pub fn complete_attempt(&self, result: &TransportResult, now: DateTime<Utc>) -> Delivery {
        let status = if result.success {
            DeliveryStatus::Success
        } else {
            DeliveryStatus::Failed
        };

        let completed = Delivery {
            status,
            status_code: result.status_code.map(i32::from),
            response_body: result.body.clone(),
            error_message: result.error.clone(),
            dispatched_at: Some(now),
            next_attempt_at: None,
            in_flight: false,
            ..self.clone()
        };

        if completed.ready_for_scheduled_phase() {
            return completed.enter_scheduled_phase(now).unwrap_or(completed);
        }

        match (completed.status, completed.retry_phase) {
            (DeliveryStatus::Failed, RetryPhase::Scheduled) => Delivery {
                next_attempt_at: next_attempt_at(completed.attempts, now),
                ..completed
            },
            _ => completed,
        }
    }

    /// Give up on the attempt in flight without contacting the destination.
    pub fn abandon_attempt(&self, reason: &str, now: DateTime<Utc>) -> Delivery {
        Delivery {
            status: DeliveryStatus::Failed,
            status_code: None,
            response_body: None,
            error_message: Some(reason.to_owned()),
            dispatched_at: Some(now),
            next_attempt_at: None,
            in_flight: false,
            ..self.clone()
        }
    }

    /// Move a delivery that has used up its immediate attempts to the scheduled phase.
    pub fn enter_scheduled_phase(&self, now: DateTime<Utc>) -> Option<Delivery> {
        if !self.ready_for_scheduled_phase() {
            return None;
        }

        Some(Delivery {
            retry_phase: RetryPhase::Scheduled,
            next_attempt_at: next_attempt_at(self.attempts, now),
            ..self.clone()
        })
    }

    /// Put a failed delivery back in line. Attempts are kept.
    pub fn reset_for_retry(&self) -> Option<Delivery> {
        if !self.is_retryable() {
            return None;
        }

        Some(Delivery {
            status: DeliveryStatus::Pending,
            next_attempt_at: None,
            ..self.clone()
        })
    }

    /// Drop a claim left behind by a previous process.
    pub fn release_claim(&self) -> Option<Delivery> {
        if !self.in_flight {
            return None;
        }

        Some(Delivery {
            status: DeliveryStatus::Pending,
            in_flight: false,
            ..self.clone()
        })
    }
}
