//! Retry policy with exponential backoff for controller errors
//!
//! Errors are classified into an [`ErrorKind`] which decides whether the
//! object is retried, how soon, and whether the error is surfaced in status.

use std::collections::HashMap;
use std::time::Duration;

use kube::runtime::controller::Action;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

/// Retries before a transient error is surfaced and retrying stops
pub const MAX_RETRIES: u32 = 10;

/// Base delay for exponential backoff (seconds)
const BASE_DELAY_SECS: u64 = 5;

/// Maximum delay between retries (1 hour)
const MAX_DELAY_SECS: u64 = 3600;

/// Base delay after a provider rejection (seconds)
const PROVIDER_DELAY_SECS: u64 = 60;

/// Upper bound of the random extra delay, as a fraction of the delay
const JITTER_FRACTION: f64 = 0.1;

/// Tracks retry attempts per object
#[derive(Debug, Default)]
pub struct RetryTracker {
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the retry count for an object and return the new count
    pub fn increment(&self, key: &str) -> u32 {
        let mut attempts = self.attempts.lock();
        let count = attempts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Reset the retry count (call on successful reconciliation)
    pub fn reset(&self, key: &str) {
        self.attempts.lock().remove(key);
    }

    pub fn get(&self, key: &str) -> u32 {
        self.attempts.lock().get(key).copied().unwrap_or(0)
    }
}

/// Error classification for retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// API or network unavailability, timeouts
    Transient,
    /// Invalid object; nothing changes until the user edits it
    Permanent,
    /// Backend refused the request
    Provider,
    /// Internal consistency violated, e.g. a generated host collision
    Invariant,
}

impl ErrorKind {
    /// Whether an error of this kind belongs in the object's status after
    /// `attempt` failures.
    pub fn surfaced(self, attempt: u32) -> bool {
        match self {
            ErrorKind::Transient => budget_exhausted(attempt),
            ErrorKind::Permanent | ErrorKind::Provider | ErrorKind::Invariant => true,
        }
    }
}

pub fn budget_exhausted(attempt: u32) -> bool {
    attempt >= MAX_RETRIES
}

fn exponential(base_secs: u64, attempt: u32) -> Duration {
    // 5s, 10s, 20s, 40s, ... up to 1 hour
    let exponent = attempt.saturating_sub(1).min(20);
    let delay_secs = base_secs.saturating_mul(2u64.pow(exponent));
    Duration::from_secs(delay_secs.min(MAX_DELAY_SECS))
}

fn with_jitter(delay: Duration) -> Duration {
    let extra = rand::thread_rng().gen_range(0.0..=JITTER_FRACTION);
    delay.mul_f64(1.0 + extra)
}

/// Determine the retry action for an error kind and attempt count
pub fn compute_backoff(attempt: u32, kind: ErrorKind) -> Action {
    match kind {
        ErrorKind::Transient => {
            if budget_exhausted(attempt) {
                warn!(
                    attempt,
                    max_retries = MAX_RETRIES,
                    "Max retries exceeded, waiting for resource change"
                );
                Action::await_change()
            } else {
                let delay = with_jitter(exponential(BASE_DELAY_SECS, attempt));
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling retry with exponential backoff"
                );
                Action::requeue(delay)
            }
        }
        ErrorKind::Provider => {
            let delay = with_jitter(exponential(PROVIDER_DELAY_SECS, attempt));
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Provider rejected request, scheduling retry"
            );
            Action::requeue(delay)
        }
        ErrorKind::Permanent | ErrorKind::Invariant => {
            warn!(error_kind = ?kind, "Waiting for resource change");
            Action::await_change()
        }
    }
}
