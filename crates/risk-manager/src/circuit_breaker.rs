//! Circuit breaker and kill switch state.
//!
//! The circuit breaker is a timed, automatically lifting halt on new
//! entries. The kill switch is a hard halt that only an operator clears.
//! Neither ever blocks an exit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reason for circuit breaker activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripReason {
    /// Daily loss limit reached; holds until end of day.
    DailyLossLimit,
    /// Too many consecutive losses; holds for the cool-off window.
    ConsecutiveLosses,
    /// Manual activation.
    Manual,
}

/// Reason for kill switch activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    WeeklyLossLimit,
    /// State could not be written; the in-memory view is not durable.
    PersistenceFailure,
    Manual,
}

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    /// Whether new entries are currently halted.
    pub tripped: bool,
    pub trip_reason: Option<TripReason>,
    pub message: Option<String>,
    pub tripped_at: Option<DateTime<Utc>>,
    /// When entries may resume.
    pub resume_at: Option<DateTime<Utc>>,
    /// Total trips on the current trading day.
    pub trips_today: u32,
}

impl CircuitBreakerState {
    /// Halt entries until `resume_at`.
    ///
    /// Re-tripping while active keeps whichever trip resumes later, along
    /// with its reason and message.
    pub fn trip(
        &mut self,
        reason: TripReason,
        message: impl Into<String>,
        now: DateTime<Utc>,
        resume_at: DateTime<Utc>,
    ) {
        if self.tripped {
            if self.resume_at.is_some_and(|existing| existing > resume_at) {
                return;
            }
        } else {
            self.trips_today += 1;
            self.tripped_at = Some(now);
        }
        self.tripped = true;
        self.trip_reason = Some(reason);
        self.message = Some(message.into());
        self.resume_at = Some(resume_at);
    }

    /// Whether the halt has run its course at `now`.
    pub fn cool_off_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.tripped && self.resume_at.is_some_and(|resume_at| now >= resume_at)
    }

    /// Clear the halt, returning the reason it was tripped for.
    pub fn lift(&mut self) -> Option<TripReason> {
        let reason = self.trip_reason.take();
        self.tripped = false;
        self.message = None;
        self.tripped_at = None;
        self.resume_at = None;
        reason
    }

    /// Clear today's trip counter; an active trip is kept.
    pub fn reset_daily(&mut self) {
        self.trips_today = 0;
    }
}

/// Kill switch state. Only an operator deactivates it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KillSwitchState {
    pub active: bool,
    pub reason: Option<KillReason>,
    pub message: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    /// Who cleared the last activation.
    pub deactivated_by: Option<String>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl KillSwitchState {
    pub fn activate(&mut self, reason: KillReason, message: impl Into<String>, now: DateTime<Utc>) {
        if self.active {
            return;
        }
        self.active = true;
        self.reason = Some(reason);
        self.message = Some(message.into());
        self.activated_at = Some(now);
        self.deactivated_by = None;
        self.deactivated_at = None;
    }

    pub fn deactivate(&mut self, authorized_by: impl Into<String>, now: DateTime<Utc>) {
        self.active = false;
        self.reason = None;
        self.message = None;
        self.activated_at = None;
        self.deactivated_by = Some(authorized_by.into());
        self.deactivated_at = Some(now);
    }
}
