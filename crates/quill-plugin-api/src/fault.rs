//! Fault tracking and the circuit breaker.
//!
//! Only interpreter-level failures count as faults: execution faults and
//! bytecode errors. Capability denials and marshal errors are the
//! extension being told "no", not the extension being broken, so they
//! never feed the breaker.
//!
//! The breaker counts faults in a sliding time window; crossing the
//! threshold tells the registry to auto-disable the extension.

use chrono::{DateTime, Utc};
use quill_runtime::RuntimeError;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Circuit breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct FaultPolicy {
    /// In-window fault count at which the breaker trips: the
    /// `max_faults`-th fault disables the extension.
    pub max_faults: usize,

    /// Sliding window length.
    pub window: Duration,
}

impl Default for FaultPolicy {
    fn default() -> Self {
        Self {
            max_faults: 5,
            window: Duration::from_secs(60),
        }
    }
}

/// One recorded fault, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct FaultRecord {
    pub at: DateTime<Utc>,
    pub operation: String,
    pub message: String,
}

/// Sliding-window fault counter for one extension.
#[derive(Debug)]
pub struct FaultTracker {
    policy: FaultPolicy,
    window: VecDeque<Instant>,
    records: Vec<FaultRecord>,
}

impl FaultTracker {
    pub fn new(policy: FaultPolicy) -> Self {
        Self {
            policy,
            window: VecDeque::new(),
            records: Vec::new(),
        }
    }

    /// Record a fault. Returns `true` when the breaker trips.
    pub fn record(&mut self, operation: &str, message: &str) -> bool {
        self.record_at(Instant::now(), operation, message)
    }

    fn record_at(&mut self, now: Instant, operation: &str, message: &str) -> bool {
        self.prune(now);
        self.window.push_back(now);
        self.records.push(FaultRecord {
            at: Utc::now(),
            operation: operation.to_string(),
            message: message.to_string(),
        });
        self.window.len() >= self.policy.max_faults
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.window.front() {
            if now.duration_since(*oldest) > self.policy.window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Faults currently inside the window.
    pub fn recent_count(&self) -> usize {
        self.window.len()
    }

    /// Full fault history for this extension.
    pub fn records(&self) -> &[FaultRecord] {
        &self.records
    }
}

/// Whether an error counts toward the circuit breaker.
pub fn is_fault_error(error: &RuntimeError) -> bool {
    matches!(
        error,
        RuntimeError::ExecutionFault(_) | RuntimeError::BytecodeError(_)
    )
}
