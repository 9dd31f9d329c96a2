//! Top-level engine wiring: starts the orchestrator actor, the local
//! worker fleet, and the auto-scaler, and hands out cloneable handles
//! for the HTTP surface and embedders.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::coordinator::election::{ElectionLock, ElectionMember};
use crate::coordinator::lease::LeaseId;
use crate::error::{Result, ScanError};
use crate::metrics::EngineMetrics;
use crate::planner::{ExecutionPlan, Partitioner, Planner, UniformPartitioner};
use crate::scaler::{AutoScaler, Provisioner};
use crate::scheduler::job::{JobId, JobStatus, JobSummary, ScanRequest, TaskId, WorkerId};
use crate::scheduler::orchestrator::{
    ClusterStatus, EngineCommand, LoadSample, Orchestrator,
};
use crate::worker::{Assignment, Connector, TaskOutcome, WorkerRuntime};

const COMMAND_BUFFER: usize = 1024;
const ASSIGNMENT_BUFFER: usize = 64;

/// Cloneable handle to the orchestrator. Planning happens caller-side so
/// submission returns a job id as soon as the plan is enqueued.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    planner: Arc<Planner>,
}

impl EngineHandle {
    pub(crate) fn new(commands: mpsc::Sender<EngineCommand>, planner: Arc<Planner>) -> Self {
        Self { commands, planner }
    }

    pub(crate) fn command_sender(&self) -> mpsc::Sender<EngineCommand> {
        self.commands.clone()
    }

    async fn send(&self, cmd: EngineCommand) -> Result<()> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| ScanError::Internal("engine stopped".to_string()))
    }

    async fn recv<T>(&self, rx: oneshot::Receiver<T>) -> Result<T> {
        rx.await
            .map_err(|_| ScanError::Internal("engine stopped".to_string()))
    }

    /// Validate and plan a request, then enqueue it. Returns the job id
    /// immediately; callers poll `status` for progress.
    pub async fn submit(&self, request: ScanRequest) -> Result<JobId> {
        let plan = self.planner.plan(request)?;
        self.submit_plan(plan).await
    }

    /// Enqueue a pre-built plan (embedders with explicit DAG shapes).
    pub async fn submit_plan(&self, plan: ExecutionPlan) -> Result<JobId> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Submit { plan, reply: tx }).await?;
        self.recv(rx).await?
    }

    pub async fn status(&self, job_id: JobId) -> Result<JobStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Status { job_id, reply: tx }).await?;
        self.recv(rx).await?
    }

    pub async fn list(&self) -> Result<Vec<JobSummary>> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::List { reply: tx }).await?;
        self.recv(rx).await
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Cancel { job_id, reply: tx }).await?;
        self.recv(rx).await?
    }

    pub async fn cluster_status(&self) -> Result<ClusterStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::ClusterStatus { reply: tx }).await?;
        self.recv(rx).await
    }

    pub async fn load_sample(&self) -> Result<LoadSample> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::LoadSample { reply: tx }).await?;
        self.recv(rx).await
    }

    /// Register a worker and return the channel its assignments arrive
    /// on. Used by the local fleet and by external worker processes.
    pub async fn register_worker(
        &self,
        worker_id: WorkerId,
        capacity: u32,
    ) -> Result<mpsc::Receiver<Assignment>> {
        let (tx, rx) = mpsc::channel(ASSIGNMENT_BUFFER);
        self.send(EngineCommand::RegisterWorker {
            worker_id,
            capacity,
            assignments: tx,
        })
        .await?;
        Ok(rx)
    }

    pub async fn retire_worker(&self, worker_id: WorkerId) -> Result<()> {
        self.send(EngineCommand::RetireWorker { worker_id }).await
    }

    pub async fn heartbeat(&self, worker_id: WorkerId) -> Result<()> {
        self.send(EngineCommand::Heartbeat { worker_id }).await
    }

    pub async fn renew_lease(&self, lease_id: LeaseId) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::RenewLease { lease_id, reply: tx })
            .await?;
        self.recv(rx).await
    }

    /// Report that an assignment started executing. Used by external
    /// workers; in-process runtimes report through the same command.
    pub async fn report_started(&self, task_id: TaskId, token: u64) -> Result<()> {
        self.send(EngineCommand::TaskStarted { task_id, token }).await
    }

    /// Report an assignment's outcome. Results carrying a superseded
    /// fencing token are discarded by the orchestrator.
    pub async fn report_finished(
        &self,
        task_id: TaskId,
        lease_id: LeaseId,
        token: u64,
        outcome: TaskOutcome,
    ) -> Result<()> {
        self.send(EngineCommand::TaskFinished {
            task_id,
            lease_id,
            token,
            outcome,
        })
        .await
    }
}

#[derive(Debug)]
struct FleetInner {
    next_id: WorkerId,
    workers: HashMap<WorkerId, CancellationToken>,
}

/// Manages the in-process worker runtimes of this deployment.
pub struct WorkerFleet {
    config: EngineConfig,
    connector: Arc<dyn Connector>,
    handle: EngineHandle,
    shutdown: CancellationToken,
    inner: Mutex<FleetInner>,
}

impl WorkerFleet {
    fn new(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        handle: EngineHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            connector,
            handle,
            shutdown,
            inner: Mutex::new(FleetInner {
                next_id: 1,
                workers: HashMap::new(),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("fleet lock poisoned").workers.len()
    }

    pub async fn spawn_worker(&self) -> Result<WorkerId> {
        let worker_id = {
            let mut inner = self.inner.lock().expect("fleet lock poisoned");
            let id = inner.next_id;
            inner.next_id += 1;
            id
        };
        let assignments = self
            .handle
            .register_worker(worker_id, self.config.slots_per_worker)
            .await?;
        let token = self.shutdown.child_token();
        let runtime = WorkerRuntime::new(
            worker_id,
            self.config.slots_per_worker,
            self.connector.clone(),
            self.handle.command_sender(),
            assignments,
            self.config.health.heartbeat_interval_ms,
            token.clone(),
        );
        tokio::spawn(runtime.run());
        self.inner
            .lock()
            .expect("fleet lock poisoned")
            .workers
            .insert(worker_id, token);
        Ok(worker_id)
    }

    /// Retire the most recently spawned worker. Its leases are revoked
    /// and its tasks requeued before the runtime stops.
    pub async fn retire_worker(&self) -> Result<Option<WorkerId>> {
        let picked = {
            let inner = self.inner.lock().expect("fleet lock poisoned");
            inner.workers.keys().max().copied()
        };
        let Some(worker_id) = picked else {
            return Ok(None);
        };
        self.handle.retire_worker(worker_id).await?;
        if let Some(token) = self
            .inner
            .lock()
            .expect("fleet lock poisoned")
            .workers
            .remove(&worker_id)
        {
            token.cancel();
        }
        Ok(Some(worker_id))
    }

    async fn scale_to_target(&self, target: u32) -> Result<()> {
        while self.size() < target as usize {
            self.spawn_worker().await?;
        }
        while self.size() > target as usize {
            if self.retire_worker().await?.is_none() {
                break;
            }
        }
        Ok(())
    }
}

/// Default provisioner: spawns and retires in-process workers so scaling
/// is observable end to end. Deployments provisioning real
/// infrastructure implement [`Provisioner`] themselves.
pub struct LocalProvisioner {
    fleet: Arc<WorkerFleet>,
}

impl LocalProvisioner {
    pub fn new(fleet: Arc<WorkerFleet>) -> Self {
        Self { fleet }
    }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    async fn scale_to(&self, target_workers: u32) -> Result<()> {
        self.fleet.scale_to_target(target_workers).await
    }
}

/// One running scan engine: orchestrator, worker fleet, auto-scaler.
pub struct Engine {
    config: EngineConfig,
    handle: EngineHandle,
    metrics: Arc<EngineMetrics>,
    fleet: Arc<WorkerFleet>,
    election_lock: ElectionLock,
    shutdown: CancellationToken,
}

impl Engine {
    /// Start with the default uniform partitioner.
    pub async fn start(config: EngineConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::start_with_partitioner(config, connector, Arc::new(UniformPartitioner::default()))
            .await
    }

    pub async fn start_with_partitioner(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        partitioner: Arc<dyn Partitioner>,
    ) -> Result<Self> {
        let metrics = Arc::new(EngineMetrics::new()?);
        let shutdown = CancellationToken::new();

        let election_lock =
            ElectionLock::new(Duration::from_millis(config.lease.election_ttl_ms));
        let member = ElectionMember::new(
            config.replica_id,
            election_lock.clone(),
            Duration::from_millis(config.lease.election_retry_min_ms),
            Duration::from_millis(config.lease.election_retry_max_ms),
        );

        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let orchestrator = Orchestrator::new(config.clone(), member, metrics.clone());
        tokio::spawn(orchestrator.run(command_rx, shutdown.clone()));

        let handle = EngineHandle::new(commands, Arc::new(Planner::new(partitioner)));
        let fleet = Arc::new(WorkerFleet::new(
            config.clone(),
            connector,
            handle.clone(),
            shutdown.clone(),
        ));
        for _ in 0..config.initial_workers {
            fleet.spawn_worker().await?;
        }

        let scaler = AutoScaler::new(
            config.scaling.clone(),
            Arc::new(LocalProvisioner::new(fleet.clone())),
            handle.clone(),
        );
        tokio::spawn(scaler.run(shutdown.clone()));

        tracing::info!(
            replica_id = config.replica_id,
            workers = config.initial_workers,
            slots = config.slots_per_worker,
            "Scan engine started"
        );
        Ok(Self {
            config,
            handle,
            metrics,
            fleet,
            election_lock,
            shutdown,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    pub fn fleet(&self) -> Arc<WorkerFleet> {
        self.fleet.clone()
    }

    /// The leadership lock shared by this deployment's coordinator
    /// replicas.
    pub fn election_lock(&self) -> ElectionLock {
        self.election_lock.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve the HTTP API until the shutdown token fires.
    pub async fn serve(&self) -> Result<()> {
        let state = crate::api::AppState {
            handle: self.handle.clone(),
            metrics: self.metrics.clone(),
        };
        crate::api::serve(self.config.listen_addr, state, self.shutdown.clone()).await
    }

    /// Begin graceful shutdown: the orchestrator stops issuing leases
    /// and drains in-flight tasks within the configured grace window.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
