//! Worker-side execution engine: a bounded pool of execution slots per
//! worker, a heartbeat loop, and the per-assignment execution path.
//!
//! Each worker receives assignments from the coordinator over a channel,
//! occupies one slot per task for its duration, and reports the outcome
//! (with the lease's fencing token) back through the engine command
//! queue. If the lease is revoked mid-execution the context is cancelled
//! and the slot is released without reporting a result payload.

pub mod executor;
pub mod heartbeat;

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::coordinator::lease::LeaseGrant;
use crate::planner::partition::PartitionSpec;
use crate::scheduler::job::{JobId, SourceRef, TaskId, WorkerId};
use crate::scheduler::orchestrator::EngineCommand;

pub use executor::{Connector, SimulatedConnector, TaskExecutor, TaskOutcome};
pub use heartbeat::HeartbeatSender;

/// A task handed to a worker together with its lease.
#[derive(Debug)]
pub struct Assignment {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub lease: LeaseGrant,
    pub source: SourceRef,
    pub partition: PartitionSpec,
    pub rules: serde_json::Value,
    pub deadline: Duration,
    pub cancel: CancellationToken,
}

/// In-process worker runtime: heartbeats plus a bounded execution loop.
pub struct WorkerRuntime {
    worker_id: WorkerId,
    slots: Arc<Semaphore>,
    executor: TaskExecutor,
    commands: mpsc::Sender<EngineCommand>,
    assignments: mpsc::Receiver<Assignment>,
    heartbeat_interval_ms: u64,
    shutdown: CancellationToken,
}

impl WorkerRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: WorkerId,
        capacity: u32,
        connector: Arc<dyn Connector>,
        commands: mpsc::Sender<EngineCommand>,
        assignments: mpsc::Receiver<Assignment>,
        heartbeat_interval_ms: u64,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            worker_id,
            slots: Arc::new(Semaphore::new(capacity as usize)),
            executor: TaskExecutor::new(connector),
            commands,
            assignments,
            heartbeat_interval_ms,
            shutdown,
        }
    }

    /// Run the worker until shutdown: one heartbeat task plus one
    /// spawned execution per assignment, bounded by the slot semaphore.
    pub async fn run(mut self) {
        let heartbeat = HeartbeatSender::new(self.worker_id, self.heartbeat_interval_ms);
        let heartbeat_tx = self.commands.clone();
        let heartbeat_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            heartbeat.run(heartbeat_tx, heartbeat_shutdown).await;
        });

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::debug!(worker_id = self.worker_id, "Worker shutting down");
                    break;
                }
                assignment = self.assignments.recv() => {
                    let Some(assignment) = assignment else { break };
                    self.spawn_execution(assignment);
                }
            }
        }
    }

    fn spawn_execution(&self, assignment: Assignment) {
        let slots = self.slots.clone();
        let executor = self.executor.clone();
        let commands = self.commands.clone();
        let worker_id = self.worker_id;
        tokio::spawn(async move {
            // A closed semaphore never happens here; holding the permit is
            // what bounds concurrent executions on this worker.
            let Ok(_permit) = slots.acquire_owned().await else {
                return;
            };
            let started = EngineCommand::TaskStarted {
                task_id: assignment.task_id,
                token: assignment.lease.token,
            };
            if commands.send(started).await.is_err() {
                return;
            }

            tracing::debug!(
                worker_id,
                task_id = %assignment.task_id,
                token = assignment.lease.token,
                "Executing task"
            );
            let outcome = executor.run(&assignment).await;

            let finished = EngineCommand::TaskFinished {
                task_id: assignment.task_id,
                lease_id: assignment.lease.lease_id,
                token: assignment.lease.token,
                outcome,
            };
            if commands.send(finished).await.is_err() {
                tracing::warn!(
                    worker_id,
                    task_id = %assignment.task_id,
                    "Failed to report task outcome, coordinator gone"
                );
            }
        });
    }
}
