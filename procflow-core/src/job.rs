//! Durable deferred work: timers, asynchronous continuations, retried steps.
//!
//! A job references an execution by id but the two lifecycles are
//! independent — the execution may end before the job fires, in which case
//! job execution detects staleness and no-ops.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::{NodeId, RepeatSpec};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JobKind {
    /// Fires when due, then continues past the timer node. A repeat spec
    /// keeps the job alive across fires.
    Timer { repeat: Option<RepeatSpec> },
    /// Runs a deferred node behavior (asynchronous service task).
    AsyncContinuation,
    /// A step re-queued by the retry machinery after a failure.
    Retry,
}

/// One row of the durable job table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub process_instance_id: Uuid,
    pub execution_id: Uuid,
    /// Node the referenced execution must still be parked at.
    pub node_id: NodeId,
    pub due_at: DateTime<Utc>,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub retries_remaining: u32,
    pub exception: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        kind: JobKind,
        process_instance_id: Uuid,
        execution_id: Uuid,
        node_id: NodeId,
        due_at: DateTime<Utc>,
        retries: u32,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            process_instance_id,
            execution_id,
            node_id,
            due_at,
            lock_owner: None,
            lock_expires_at: None,
            retries_remaining: retries,
            exception: None,
            created_at: Utc::now(),
        }
    }

    /// Retries exhausted with a recorded failure — terminal until an
    /// operator intervenes.
    pub fn is_deadlettered(&self) -> bool {
        self.retries_remaining == 0 && self.exception.is_some()
    }

    /// Eligible for acquisition at `now`: due, not dead-lettered, and either
    /// unlocked or held under an expired lock (crash reclamation).
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        if self.is_deadlettered() || self.due_at > now {
            return false;
        }
        match (self.lock_owner.as_ref(), self.lock_expires_at) {
            (None, _) => true,
            (Some(_), Some(expiry)) => expiry <= now,
            // A lock without an expiry should not exist; treat as held.
            (Some(_), None) => false,
        }
    }

    /// Next due date for a repeating timer that just fired, and whether the
    /// job survives. `None` means the cycle is exhausted and the job is
    /// deleted like a plain timer.
    pub fn next_repeat(&self) -> Option<Job> {
        let JobKind::Timer {
            repeat: Some(spec),
        } = &self.kind
        else {
            return None;
        };
        let remaining = match spec.remaining {
            Some(0) => return None,
            Some(n) => Some(n - 1),
            None => None,
        };
        if remaining == Some(0) {
            return None;
        }
        let mut next = self.clone();
        next.kind = JobKind::Timer {
            repeat: Some(RepeatSpec {
                interval_ms: spec.interval_ms,
                remaining,
            }),
        };
        next.due_at = Utc::now() + Duration::milliseconds(spec.interval_ms as i64);
        next.lock_owner = None;
        next.lock_expires_at = None;
        next.exception = None;
        Some(next)
    }
}

/// Exponential backoff for a failed job: `base * 2^attempts_used`, where
/// attempts_used is derived from the configured retry budget.
pub fn backoff(base_ms: u64, configured_retries: u32, retries_remaining: u32) -> Duration {
    let attempts_used = configured_retries.saturating_sub(retries_remaining);
    let factor = 2u64.saturating_pow(attempts_used.min(16));
    Duration::milliseconds(base_ms.saturating_mul(factor) as i64)
}

/// A job-table mutation recorded by a command and applied atomically with
/// the execution-tree commit.
#[derive(Clone, Debug)]
pub enum JobOp {
    Create(Job),
    /// Replace a row (repeating timer recomputing its due date).
    Update(Job),
    Delete(Uuid),
    /// Cancellation sweep for a terminated instance.
    DeleteForInstance(Uuid),
}
