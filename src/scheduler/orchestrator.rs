//! The coordination core: a single-writer actor owning the task graph
//! and lease table. All mutation is serialized through its command
//! queue; only the elected leader runs the scheduling tick. Task
//! execution itself is fully parallel across workers and slots.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::coordinator::election::ElectionMember;
use crate::coordinator::lease::{LeaseId, LeaseTable};
use crate::error::{ErrorKind, Result, ScanError};
use crate::fault::{
    Admission, BreakerTransition, CircuitBreakerSet, FaultRecord, RecoveryAction, WorkerHealth,
    WorkerTracker,
};
use crate::metrics::EngineMetrics;
use crate::planner::ExecutionPlan;
use crate::pool::{ResourcePool, ReserveOutcome};
use crate::scheduler::graph::TaskGraph;
use crate::scheduler::job::{
    FailurePolicy, JobId, JobState, JobStatus, JobSummary, ScanPayload, ScanRequest, ScanTask,
    TaskId, TaskState, TaskSummary, WorkerId,
};
use crate::scheduler::queue::{QueuedTask, ReadyQueue};
use crate::worker::{Assignment, TaskOutcome};

/// Commands accepted by the orchestrator actor. Everything that touches
/// the task graph or lease table arrives here.
#[derive(Debug)]
pub enum EngineCommand {
    Submit {
        plan: ExecutionPlan,
        reply: oneshot::Sender<Result<JobId>>,
    },
    Status {
        job_id: JobId,
        reply: oneshot::Sender<Result<JobStatus>>,
    },
    List {
        reply: oneshot::Sender<Vec<JobSummary>>,
    },
    Cancel {
        job_id: JobId,
        reply: oneshot::Sender<Result<()>>,
    },
    RegisterWorker {
        worker_id: WorkerId,
        capacity: u32,
        assignments: mpsc::Sender<Assignment>,
    },
    RetireWorker {
        worker_id: WorkerId,
    },
    Heartbeat {
        worker_id: WorkerId,
    },
    RenewLease {
        lease_id: LeaseId,
        reply: oneshot::Sender<bool>,
    },
    TaskStarted {
        task_id: TaskId,
        token: u64,
    },
    TaskFinished {
        task_id: TaskId,
        lease_id: LeaseId,
        token: u64,
        outcome: TaskOutcome,
    },
    ClusterStatus {
        reply: oneshot::Sender<ClusterStatus>,
    },
    LoadSample {
        reply: oneshot::Sender<LoadSample>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSummary {
    pub id: WorkerId,
    pub health: WorkerHealth,
    pub capacity: u32,
    pub reserved: u32,
    pub held_leases: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub replica_id: u64,
    pub role: String,
    pub term: u64,
    pub leader_id: Option<u64>,
    pub workers: Vec<WorkerSummary>,
    pub jobs: usize,
    pub queue_depth: usize,
}

/// Load snapshot consumed by the auto-scaler.
#[derive(Debug, Clone, Copy)]
pub struct LoadSample {
    pub utilization: f64,
    pub queue_depth: usize,
    pub worker_count: u32,
}

/// A scan job's runtime state: its request, task graph, and append-only
/// fault trail.
struct ScanJob {
    id: JobId,
    request: ScanRequest,
    state: JobState,
    graph: TaskGraph,
    faults: Vec<FaultRecord>,
    /// Tasks currently ASSIGNED or RUNNING.
    in_flight: u32,
    completed_at: Option<chrono::DateTime<Utc>>,
}

impl ScanJob {
    fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.id,
            state: self.state,
            source: self.request.source.uri.clone(),
            priority: self.request.priority,
            submitted_at: self.request.submitted_at,
            completed_at: self.completed_at,
            task_summaries: self.graph.iter_ordered().map(TaskSummary::from).collect(),
            fault_records: self.faults.clone(),
        }
    }

    fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.id,
            state: self.state,
            source: self.request.source.uri.clone(),
            priority: self.request.priority,
            submitted_at: self.request.submitted_at,
            tasks_total: self.graph.len(),
            tasks_succeeded: self.graph.count_in_state(TaskState::Succeeded),
            tasks_failed: self.graph.count_in_state(TaskState::Failed),
        }
    }
}

struct RetryEntry {
    due: Instant,
    task_id: TaskId,
    job_id: JobId,
}

enum Dispatch {
    Dispatched,
    Deferred,
    Dropped,
}

pub struct Orchestrator {
    config: EngineConfig,
    election: ElectionMember,
    jobs: HashMap<JobId, ScanJob>,
    queue: ReadyQueue,
    leases: LeaseTable,
    pool: ResourcePool,
    links: HashMap<WorkerId, mpsc::Sender<Assignment>>,
    tracker: WorkerTracker,
    breakers: CircuitBreakerSet,
    /// Half-open probe tasks in flight, by task id, so a lost probe can
    /// re-arm the breaker.
    probes: HashMap<TaskId, String>,
    retry_backlog: Vec<RetryEntry>,
    metrics: Arc<EngineMetrics>,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, election: ElectionMember, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            queue: ReadyQueue::new(Duration::from_millis(config.aging_threshold_ms)),
            leases: LeaseTable::new(Duration::from_millis(config.lease.ttl_ms)),
            pool: ResourcePool::new(config.global_slot_ceiling),
            tracker: WorkerTracker::new(&config.health),
            breakers: CircuitBreakerSet::new(&config.breaker),
            jobs: HashMap::new(),
            links: HashMap::new(),
            probes: HashMap::new(),
            retry_backlog: Vec::new(),
            config,
            election,
            metrics,
        }
    }

    /// Run the actor until shutdown, then drain in-flight work within the
    /// configured grace window.
    pub async fn run(mut self, mut rx: mpsc::Receiver<EngineCommand>, shutdown: CancellationToken) {
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.config.scheduler_tick_ms.max(1)));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.drain(&mut rx).await;
                    break;
                }
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                _ = tick.tick() => self.on_tick(),
            }
        }
        tracing::info!(replica_id = self.election.replica_id(), "Orchestrator stopped");
    }

    /// Stop issuing leases and let RUNNING tasks finish within the grace
    /// window.
    async fn drain(&mut self, rx: &mut mpsc::Receiver<EngineCommand>) {
        let deadline = Instant::now() + Duration::from_millis(self.config.drain_grace_ms);
        while self.leases.active_count() > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(
                    outstanding = self.leases.active_count(),
                    "Drain grace elapsed with tasks still in flight"
                );
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(cmd)) => self.handle_command(cmd),
                _ => break,
            }
        }
    }

    fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Submit { plan, reply } => {
                let _ = reply.send(self.handle_submit(plan));
            }
            EngineCommand::Status { job_id, reply } => {
                let status = self
                    .jobs
                    .get(&job_id)
                    .map(ScanJob::status)
                    .ok_or(ScanError::JobNotFound(job_id));
                let _ = reply.send(status);
            }
            EngineCommand::List { reply } => {
                let mut summaries: Vec<JobSummary> =
                    self.jobs.values().map(ScanJob::summary).collect();
                summaries.sort_by_key(|s| s.submitted_at);
                let _ = reply.send(summaries);
            }
            EngineCommand::Cancel { job_id, reply } => {
                let _ = reply.send(self.handle_cancel(job_id));
            }
            EngineCommand::RegisterWorker {
                worker_id,
                capacity,
                assignments,
            } => self.handle_register_worker(worker_id, capacity, assignments),
            EngineCommand::RetireWorker { worker_id } => {
                self.handle_worker_loss(worker_id, ErrorKind::LeaseExpired, false);
            }
            EngineCommand::Heartbeat { worker_id } => {
                let now = Instant::now();
                if self.tracker.heartbeat(worker_id, now) {
                    self.leases.renew_for_worker(worker_id, now);
                }
            }
            EngineCommand::RenewLease { lease_id, reply } => {
                let _ = reply.send(self.leases.renew(lease_id, Instant::now()));
            }
            EngineCommand::TaskStarted { task_id, token } => {
                self.handle_task_started(task_id, token);
            }
            EngineCommand::TaskFinished {
                task_id,
                lease_id,
                token,
                outcome,
            } => self.handle_task_finished(task_id, lease_id, token, outcome),
            EngineCommand::ClusterStatus { reply } => {
                let _ = reply.send(self.cluster_status());
            }
            EngineCommand::LoadSample { reply } => {
                let _ = reply.send(LoadSample {
                    utilization: self.pool.utilization(),
                    queue_depth: self.queue.depth(),
                    worker_count: self.pool.worker_count() as u32,
                });
            }
        }
    }

    // ---------------------------------------------------------------
    // Submission, status, cancellation
    // ---------------------------------------------------------------

    fn ensure_leader(&mut self) -> Result<()> {
        if !self.election.is_leader() {
            // A freshly started replica may not have attempted acquisition
            // yet; give it one chance before refusing.
            self.election.maintain(Instant::now());
        }
        if self.election.is_leader() {
            Ok(())
        } else {
            Err(ScanError::NotLeader(
                self.election.leader_id(Instant::now()),
            ))
        }
    }

    fn handle_submit(&mut self, plan: ExecutionPlan) -> Result<JobId> {
        self.ensure_leader()?;
        let job_id = plan.job_id;
        let priority = plan.request.priority;
        let tasks: Vec<ScanTask> = plan
            .tasks
            .into_iter()
            .map(|spec| ScanTask::new(spec.id, job_id, spec.partition, spec.deps, spec.estimate))
            .collect();
        let task_count = tasks.len();
        let mut graph = TaskGraph::new(tasks);
        let ready = graph.promote_roots();

        self.jobs.insert(
            job_id,
            ScanJob {
                id: job_id,
                request: plan.request,
                state: JobState::Planned,
                graph,
                faults: Vec::new(),
                in_flight: 0,
                completed_at: None,
            },
        );
        self.metrics.tasks_submitted.inc_by(task_count as u64);
        for task_id in ready {
            self.queue.push(task_id, job_id, priority);
        }
        tracing::info!(job_id = %job_id, tasks = task_count, priority = %priority, "Scan job enqueued");
        Ok(job_id)
    }

    fn handle_cancel(&mut self, job_id: JobId) -> Result<()> {
        self.ensure_leader()?;
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return Err(ScanError::JobNotFound(job_id));
        };
        if job.state.is_terminal() || job.state == JobState::Cancelling {
            return Ok(());
        }
        job.state = JobState::Cancelling;
        let in_flight = job.in_flight;
        self.queue.remove_job(job_id);
        self.retry_backlog.retain(|entry| entry.job_id != job_id);
        if in_flight == 0 {
            self.finish_cancellation(job_id);
        }
        tracing::info!(job_id = %job_id, in_flight, "Scan job cancelling");
        Ok(())
    }

    fn finish_cancellation(&mut self, job_id: JobId) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.state = JobState::Cancelled;
            job.completed_at = Some(Utc::now());
            tracing::info!(job_id = %job_id, "Scan job cancelled");
        }
    }

    // ---------------------------------------------------------------
    // Worker membership
    // ---------------------------------------------------------------

    fn handle_register_worker(
        &mut self,
        worker_id: WorkerId,
        capacity: u32,
        assignments: mpsc::Sender<Assignment>,
    ) {
        let now = Instant::now();
        self.pool.add_worker(worker_id, capacity);
        self.tracker.register(worker_id, now);
        self.links.insert(worker_id, assignments);
        self.metrics.worker_count.set(self.pool.worker_count() as i64);
        tracing::info!(worker_id, capacity, "Worker registered");
    }

    /// Revoke a worker's leases and requeue its tasks, then drop its
    /// capacity. Used for both failover (unreachable) and deliberate
    /// retirement by the scaler.
    fn handle_worker_loss(&mut self, worker_id: WorkerId, kind: ErrorKind, failover: bool) {
        let released = self.leases.revoke_worker(worker_id);
        for lease in released {
            self.pool.release(lease.reservation);
            let action = if failover {
                RecoveryAction::Failover { worker_id }
            } else {
                RecoveryAction::Requeue
            };
            self.requeue_lost(lease.job_id, lease.task_id, kind, action);
        }
        self.pool.remove_worker(worker_id);
        self.tracker.remove(worker_id);
        self.links.remove(&worker_id);
        self.metrics.worker_count.set(self.pool.worker_count() as i64);
        tracing::warn!(worker_id, failover, "Worker removed from fleet");
    }

    // ---------------------------------------------------------------
    // Task results
    // ---------------------------------------------------------------

    fn handle_task_started(&mut self, task_id: TaskId, token: u64) {
        if !self.leases.validate(task_id, token) {
            return;
        }
        let Some(job_id) = self.jobs.values().find_map(|job| {
            job.graph
                .task(task_id)
                .map(|_| job.id)
        }) else {
            return;
        };
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if let Some(task) = job.graph.task_mut(task_id) {
            if task.state == TaskState::Assigned {
                task.state = TaskState::Running;
            }
        }
    }

    fn handle_task_finished(
        &mut self,
        task_id: TaskId,
        lease_id: LeaseId,
        token: u64,
        outcome: TaskOutcome,
    ) {
        if !self.leases.validate(task_id, token) {
            tracing::debug!(task_id = %task_id, token, "Discarding result with stale fencing token");
            return;
        }
        let Some(lease) = self.leases.release(lease_id) else {
            return;
        };
        self.pool.release(lease.reservation);
        self.probes.remove(&task_id);
        if let Some(job) = self.jobs.get_mut(&lease.job_id) {
            job.in_flight = job.in_flight.saturating_sub(1);
        }

        match outcome {
            TaskOutcome::Succeeded(payload) => {
                self.on_task_succeeded(lease.job_id, task_id, payload, lease.held_for);
            }
            TaskOutcome::Failed { kind, message } => {
                self.on_task_failed(lease.job_id, task_id, kind, message);
            }
            TaskOutcome::Aborted => {
                // The context was cancelled while the lease was still
                // valid (job cancellation during drain, shutdown). Treat
                // as a transient loss.
                self.on_task_failed(
                    lease.job_id,
                    task_id,
                    ErrorKind::Transient,
                    "execution aborted".to_string(),
                );
            }
        }
    }

    /// Finalize a cancelling job once nothing is in flight. Returns true
    /// when the job was in cancellation and the result should be
    /// discarded.
    fn absorb_if_cancelling(&mut self, job_id: JobId) -> bool {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return true;
        };
        if job.state != JobState::Cancelling {
            return false;
        }
        if job.in_flight == 0 {
            self.finish_cancellation(job_id);
        }
        true
    }

    fn on_task_succeeded(
        &mut self,
        job_id: JobId,
        task_id: TaskId,
        payload: ScanPayload,
        held_for: Duration,
    ) {
        self.metrics.tasks_succeeded.inc();
        self.metrics
            .task_latency_seconds
            .observe(held_for.as_secs_f64());

        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        let source = job.request.source.uri.clone();
        if let Some(BreakerTransition::Closed) = self.breakers.record_success(&source) {
            if let Some(job) = self.jobs.get_mut(&job_id) {
                job.faults.push(FaultRecord::new(
                    task_id,
                    ErrorKind::Transient,
                    0,
                    RecoveryAction::CircuitClosed {
                        source: source.clone(),
                    },
                ));
            }
            tracing::info!(source = %source, "Circuit breaker closed after successful probe");
        }
        if self.absorb_if_cancelling(job_id) {
            return;
        }

        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        let priority = job.request.priority;
        if let Some(task) = job.graph.task_mut(task_id) {
            task.payload = Some(payload);
        }
        let newly_ready = job.graph.mark_succeeded(task_id);
        tracing::debug!(
            job_id = %job_id,
            task_id = %task_id,
            unblocked = newly_ready.len(),
            "Task succeeded"
        );
        for ready in newly_ready {
            self.queue.push(ready, job_id, priority);
        }
        self.finalize_if_settled(job_id);
    }

    fn on_task_failed(&mut self, job_id: JobId, task_id: TaskId, kind: ErrorKind, message: String) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        let source = job.request.source.uri.clone();
        if let Some(BreakerTransition::Opened) = self.breakers.record_failure(&source, Instant::now())
        {
            let attempt = job.graph.task(task_id).map(|t| t.attempts).unwrap_or(0);
            if let Some(job) = self.jobs.get_mut(&job_id) {
                job.faults.push(FaultRecord::new(
                    task_id,
                    kind,
                    attempt,
                    RecoveryAction::CircuitOpened {
                        source: source.clone(),
                    },
                ));
            }
            tracing::warn!(source = %source, "Circuit breaker opened");
        }
        if self.absorb_if_cancelling(job_id) {
            return;
        }

        let max_attempts = self.config.retry.max_attempts;
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        let Some(task) = job.graph.task_mut(task_id) else {
            return;
        };
        task.assigned_worker = None;
        task.last_error = Some((kind, message.clone()));
        let attempts = task.attempts;

        let terminal = kind == ErrorKind::Permanent || attempts >= max_attempts;
        if terminal {
            task.state = TaskState::Failed;
            job.faults
                .push(FaultRecord::new(task_id, kind, attempts, RecoveryAction::Abandon));
            self.metrics.tasks_failed.inc();
            tracing::warn!(
                job_id = %job_id,
                task_id = %task_id,
                kind = %kind,
                attempts,
                error = %message,
                "Task failed terminally"
            );
            self.cascade_failure(job_id, task_id);
            self.finalize_if_settled(job_id);
        } else {
            task.state = TaskState::Retrying;
            let delay = backoff_delay(&self.config.retry, attempts);
            job.faults.push(FaultRecord::new(
                task_id,
                kind,
                attempts,
                RecoveryAction::Retry {
                    delay_ms: delay.as_millis() as u64,
                },
            ));
            self.metrics.tasks_retried.inc();
            tracing::info!(
                job_id = %job_id,
                task_id = %task_id,
                kind = %kind,
                attempts,
                delay_ms = delay.as_millis() as u64,
                "Task will be retried"
            );
            self.retry_backlog.push(RetryEntry {
                due: Instant::now() + delay,
                task_id,
                job_id,
            });
        }
    }

    /// Block every task downstream of a terminal failure; under
    /// fail-fast, abort the rest of the job as well.
    fn cascade_failure(&mut self, job_id: JobId, failed_task: TaskId) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        let downstream = job.graph.downstream_of(failed_task);
        for task_id in &downstream {
            if let Some(task) = job.graph.task_mut(*task_id) {
                if !task.state.is_terminal() {
                    task.blocked = true;
                }
            }
        }
        if !downstream.is_empty() {
            tracing::info!(
                job_id = %job_id,
                blocked = downstream.len(),
                "Blocked tasks downstream of terminal failure"
            );
        }

        if job.request.failure_policy == FailurePolicy::FailFast {
            let running: Vec<TaskId> = job
                .graph
                .task_ids()
                .into_iter()
                .filter(|id| {
                    job.graph
                        .task(*id)
                        .map(|t| matches!(t.state, TaskState::Assigned | TaskState::Running))
                        .unwrap_or(false)
                })
                .collect();
            for task_id in job.graph.task_ids() {
                if let Some(task) = job.graph.task_mut(task_id) {
                    if !task.state.is_terminal() {
                        task.blocked = true;
                    }
                }
            }
            self.queue.remove_job(job_id);
            self.retry_backlog.retain(|entry| entry.job_id != job_id);
            for task_id in running {
                if let Some(lease) = self.leases.revoke_task(task_id) {
                    self.pool.release(lease.reservation);
                    self.probes.remove(&task_id);
                    if let Some(job) = self.jobs.get_mut(&job_id) {
                        job.in_flight = job.in_flight.saturating_sub(1);
                    }
                }
            }
        }
    }

    fn finalize_if_settled(&mut self, job_id: JobId) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if job.state.is_terminal() || job.state == JobState::Cancelling {
            return;
        }
        if !job.graph.all_settled() {
            return;
        }
        job.state = if job.graph.any_failed() {
            JobState::Failed
        } else {
            JobState::Succeeded
        };
        job.completed_at = Some(Utc::now());
        tracing::info!(job_id = %job_id, state = %job.state, "Scan job finished");
    }

    /// Return a task to the front of its priority tier after a lost
    /// lease. The interrupted attempt does not count against the retry
    /// budget; the failed node, not the task, is at fault.
    fn requeue_lost(
        &mut self,
        job_id: JobId,
        task_id: TaskId,
        kind: ErrorKind,
        action: RecoveryAction,
    ) {
        if let Some(source) = self.probes.remove(&task_id) {
            self.breakers.abort_probe(&source);
        }
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        job.in_flight = job.in_flight.saturating_sub(1);
        if job.state == JobState::Cancelling {
            if job.in_flight == 0 {
                self.finish_cancellation(job_id);
            }
            return;
        }
        if job.state.is_terminal() {
            return;
        }
        let priority = job.request.priority;
        let Some(task) = job.graph.task_mut(task_id) else {
            return;
        };
        if task.state.is_terminal() || task.blocked {
            return;
        }
        let lost_attempt = task.attempts;
        task.attempts = task.attempts.saturating_sub(1);
        task.assigned_worker = None;
        task.last_error = Some((kind, kind.to_string()));
        task.state = TaskState::Ready;
        job.faults
            .push(FaultRecord::new(task_id, kind, lost_attempt, action));
        self.queue.push_front(task_id, job_id, priority);
    }

    // ---------------------------------------------------------------
    // Scheduling tick
    // ---------------------------------------------------------------

    fn on_tick(&mut self) {
        let now = Instant::now();
        self.election.maintain(now);
        if !self.election.is_leader() {
            // Followers hold shadow state and serve read-only queries.
            return;
        }
        self.sweep_health(now);
        self.sweep_leases(now);
        self.wake_retries(now);
        let promoted = self.queue.promote_aged(now);
        if promoted > 0 {
            tracing::debug!(promoted, "Aged tasks promoted one priority tier");
        }
        self.dispatch(now);

        self.metrics.queue_depth.set(self.queue.depth() as i64);
        self.metrics.utilization.set(self.pool.utilization());
    }

    fn sweep_health(&mut self, now: Instant) {
        for (worker_id, health) in self.tracker.sweep(now) {
            match health {
                WorkerHealth::Degraded => {
                    tracing::warn!(worker_id, "Worker degraded, heartbeat missed");
                }
                WorkerHealth::Unreachable => {
                    tracing::warn!(worker_id, "Worker unreachable, failing over its leases");
                    self.handle_worker_loss(worker_id, ErrorKind::NodeUnreachable, true);
                }
                WorkerHealth::Healthy => {}
            }
        }
    }

    fn sweep_leases(&mut self, now: Instant) {
        for task_id in self.leases.expired(now) {
            if let Some(lease) = self.leases.expire_task(task_id) {
                self.pool.release(lease.reservation);
                tracing::warn!(
                    task_id = %task_id,
                    worker_id = lease.worker_id,
                    "Lease expired without renewal, reassigning task"
                );
                self.requeue_lost(
                    lease.job_id,
                    task_id,
                    ErrorKind::LeaseExpired,
                    RecoveryAction::Requeue,
                );
            }
        }
    }

    fn wake_retries(&mut self, now: Instant) {
        let mut due = Vec::new();
        self.retry_backlog.retain(|entry| {
            if entry.due <= now {
                due.push((entry.job_id, entry.task_id));
                false
            } else {
                true
            }
        });
        for (job_id, task_id) in due {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.state.is_terminal() || job.state == JobState::Cancelling {
                continue;
            }
            let priority = job.request.priority;
            if let Some(task) = job.graph.task_mut(task_id) {
                if task.state == TaskState::Retrying && !task.blocked {
                    task.state = TaskState::Ready;
                    self.queue.push(task_id, job_id, priority);
                }
            }
        }
    }

    fn dispatch(&mut self, now: Instant) {
        let mut deferred: Vec<QueuedTask> = Vec::new();
        let budget = self.queue.depth();
        for _ in 0..budget {
            let Some(entry) = self.queue.pop() else { break };
            match self.try_dispatch(&entry, now) {
                Dispatch::Dispatched | Dispatch::Dropped => {}
                Dispatch::Deferred => deferred.push(entry),
            }
        }
        for entry in deferred.into_iter().rev() {
            self.queue.restore_front(entry);
        }
    }

    fn try_dispatch(&mut self, entry: &QueuedTask, now: Instant) -> Dispatch {
        let Some(job) = self.jobs.get(&entry.job_id) else {
            return Dispatch::Dropped;
        };
        if job.state.is_terminal() || job.state == JobState::Cancelling {
            return Dispatch::Dropped;
        }
        let Some(task) = job.graph.task(entry.task_id) else {
            return Dispatch::Dropped;
        };
        if task.state != TaskState::Ready || task.blocked {
            return Dispatch::Dropped;
        }
        if let Some(max) = job.request.constraints.max_concurrency {
            if job.in_flight >= max {
                return Dispatch::Deferred;
            }
        }

        let source = job.request.source.clone();
        let partition = task.partition.clone();
        let rules = job.request.rule_set.clone();
        let slots = task.estimate.slots;
        let deadline = self.task_deadline(job);

        // Circuit breaker gate. Merge tasks never touch the source.
        let admission = if partition.kind == crate::planner::partition::PartitionKind::Merge {
            Admission::Allow
        } else {
            self.breakers.admit(&source.uri, now)
        };
        if admission == Admission::Hold {
            return Dispatch::Deferred;
        }

        // Backpressure gate: denial keeps the task READY for the next tick.
        let eligible: Vec<WorkerId> = self
            .tracker
            .healthy_workers()
            .into_iter()
            .filter(|id| self.links.contains_key(id))
            .collect();
        let ReserveOutcome::Reserved(reservation) = self.pool.reserve(slots, &eligible) else {
            if admission == Admission::Probe {
                self.breakers.abort_probe(&source.uri);
            }
            return Dispatch::Deferred;
        };

        let cancel = CancellationToken::new();
        let grant = self.leases.grant(
            entry.task_id,
            entry.job_id,
            reservation.worker_id,
            reservation.id,
            cancel.clone(),
            now,
        );
        let assignment = Assignment {
            job_id: entry.job_id,
            task_id: entry.task_id,
            lease: grant,
            source: source.clone(),
            partition,
            rules,
            deadline,
            cancel,
        };

        let Some(link) = self.links.get(&reservation.worker_id) else {
            self.leases.release(grant.lease_id);
            self.pool.release(reservation.id);
            if admission == Admission::Probe {
                self.breakers.abort_probe(&source.uri);
            }
            return Dispatch::Deferred;
        };
        if link.try_send(assignment).is_err() {
            // Worker channel saturated; roll back and try next tick.
            self.leases.release(grant.lease_id);
            self.pool.release(reservation.id);
            if admission == Admission::Probe {
                self.breakers.abort_probe(&source.uri);
            }
            return Dispatch::Deferred;
        }

        if admission == Admission::Probe {
            self.probes.insert(entry.task_id, source.uri.clone());
        }
        let Some(job) = self.jobs.get_mut(&entry.job_id) else {
            return Dispatch::Dropped;
        };
        job.in_flight += 1;
        if job.state == JobState::Planned {
            job.state = JobState::Running;
        }
        if let Some(task) = job.graph.task_mut(entry.task_id) {
            task.state = TaskState::Assigned;
            task.assigned_worker = Some(reservation.worker_id);
            task.attempts += 1;
        }
        tracing::debug!(
            job_id = %entry.job_id,
            task_id = %entry.task_id,
            worker_id = reservation.worker_id,
            token = grant.token,
            "Task assigned"
        );
        Dispatch::Dispatched
    }

    /// Deadline for one execution, derived from the job deadline when
    /// present.
    fn task_deadline(&self, job: &ScanJob) -> Duration {
        match job.request.constraints.deadline {
            Some(deadline) => {
                let remaining = deadline - Utc::now();
                match remaining.to_std() {
                    Ok(d) => d.max(Duration::from_millis(1)),
                    Err(_) => Duration::from_millis(1),
                }
            }
            None => Duration::from_millis(self.config.default_task_deadline_ms),
        }
    }

    fn cluster_status(&self) -> ClusterStatus {
        let now = Instant::now();
        let workers = self
            .pool
            .worker_snapshot()
            .into_iter()
            .map(|(id, capacity, reserved)| WorkerSummary {
                id,
                health: self.tracker.health(id).unwrap_or(WorkerHealth::Unreachable),
                capacity,
                reserved,
                held_leases: self.leases.held_by(id),
            })
            .collect();
        ClusterStatus {
            replica_id: self.election.replica_id(),
            role: self.election.role().to_string(),
            term: self.election.term(),
            leader_id: self.election.leader_id(now),
            workers,
            jobs: self.jobs.len(),
            queue_depth: self.queue.depth(),
        }
    }
}

/// Exponential backoff for attempt `attempts`, with up to 20% jitter,
/// capped.
fn backoff_delay(retry: &crate::config::RetryConfig, attempts: u32) -> Duration {
    let base = retry.backoff_base_ms.max(1);
    let exp = base.saturating_mul(1u64 << attempts.saturating_sub(1).min(16));
    let capped = exp.min(retry.backoff_cap_ms).max(1);
    let jitter = rand::thread_rng().gen_range(0..=capped / 5);
    Duration::from_millis(capped + jitter)
}
