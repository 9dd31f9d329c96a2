use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Duration;

use crate::error::{ErrorKind, Result, ScanError};
use crate::planner::partition::{PartitionKind, PartitionSpec};
use crate::scheduler::job::{ScanPayload, SourceRef};
use crate::worker::Assignment;

/// Data-source connector capability. Supplied externally per source
/// family; the engine treats the rule set as an opaque blob and only
/// interprets the returned payload and error class.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn scan_partition(
        &self,
        source: &SourceRef,
        partition: &PartitionSpec,
        rules: &serde_json::Value,
    ) -> Result<ScanPayload>;
}

/// Stand-in connector for local runs: simulates scan I/O at a fixed
/// throughput and always reports zero matches.
#[derive(Debug, Clone)]
pub struct SimulatedConnector {
    pub bytes_per_ms: u64,
}

impl Default for SimulatedConnector {
    fn default() -> Self {
        Self {
            bytes_per_ms: 10 * 1024 * 1024,
        }
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn scan_partition(
        &self,
        _source: &SourceRef,
        partition: &PartitionSpec,
        _rules: &serde_json::Value,
    ) -> Result<ScanPayload> {
        let bytes = partition.size_hint();
        let delay = bytes / self.bytes_per_ms.max(1);
        tokio::time::sleep(Duration::from_millis(delay.min(10_000))).await;
        Ok(ScanPayload {
            bytes_scanned: bytes,
            matches: 0,
        })
    }
}

/// Outcome of one task execution attempt as reported back to the
/// orchestrator.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Succeeded(ScanPayload),
    Failed { kind: ErrorKind, message: String },
    /// Execution context was cancelled (lease revoked or shutdown); any
    /// partial result is discarded.
    Aborted,
}

fn classify(err: ScanError) -> (ErrorKind, String) {
    let message = err.to_string();
    let kind = err.kind().unwrap_or(ErrorKind::Transient);
    (kind, message)
}

/// Runs one assignment against the connector under the task deadline and
/// the lease's cancellation context.
#[derive(Clone)]
pub struct TaskExecutor {
    connector: Arc<dyn Connector>,
}

impl TaskExecutor {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    pub async fn run(&self, assignment: &Assignment) -> TaskOutcome {
        // Merge partitions aggregate upstream payloads on the coordinator
        // side; there is nothing to scan.
        if assignment.partition.kind == PartitionKind::Merge {
            return TaskOutcome::Succeeded(ScanPayload::default());
        }

        let scan = self.connector.scan_partition(
            &assignment.source,
            &assignment.partition,
            &assignment.rules,
        );

        tokio::select! {
            _ = assignment.cancel.cancelled() => {
                tracing::debug!(
                    task_id = %assignment.task_id,
                    token = assignment.lease.token,
                    "Execution context cancelled, aborting"
                );
                TaskOutcome::Aborted
            }
            result = tokio::time::timeout(assignment.deadline, scan) => match result {
                Ok(Ok(payload)) => TaskOutcome::Succeeded(payload),
                Ok(Err(err)) => {
                    let (kind, message) = classify(err);
                    TaskOutcome::Failed { kind, message }
                }
                Err(_) => TaskOutcome::Failed {
                    kind: ErrorKind::Transient,
                    message: format!(
                        "task deadline of {:?} exceeded",
                        assignment.deadline
                    ),
                },
            }
        }
    }
}
