//! Fault detection and recovery: worker liveness tracking, per-source
//! circuit breaking, and the append-only fault audit trail.

pub mod breaker;
pub mod detector;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

pub use breaker::{Admission, BreakerState, BreakerTransition, CircuitBreakerSet};
pub use detector::{WorkerHealth, WorkerTracker};

/// Recovery action taken in response to a task failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "action")]
pub enum RecoveryAction {
    /// Task re-queued for another attempt after a backoff.
    Retry { delay_ms: u64 },
    /// Task returned to the ready queue without consuming retry budget.
    Requeue,
    /// Task reassigned away from an unreachable worker.
    Failover { worker_id: u64 },
    /// The source's circuit breaker opened; dispatch is held.
    CircuitOpened { source: String },
    /// The source's circuit breaker closed after a successful probe.
    CircuitClosed { source: String },
    /// Retry budget exhausted or failure permanent; task is terminal.
    Abandon,
}

/// One entry in a job's append-only fault audit trail. Never mutated
/// after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultRecord {
    pub task_id: Uuid,
    pub kind: ErrorKind,
    pub attempt: u32,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub recovery: RecoveryAction,
}

impl FaultRecord {
    pub fn new(task_id: Uuid, kind: ErrorKind, attempt: u32, recovery: RecoveryAction) -> Self {
        Self {
            task_id,
            kind,
            attempt,
            recorded_at: Utc::now(),
            recovery,
        }
    }
}
