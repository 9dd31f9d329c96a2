//! Failover tests: heartbeat loss and lease expiry, fencing-token
//! rejection of stale results, and coordinator replicas refusing
//! mutations while another replica leads.


use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use scanflow::coordinator::{ElectionLock, ElectionMember};
use scanflow::error::{ErrorKind, ScanError};
use scanflow::fault::RecoveryAction;
use scanflow::metrics::EngineMetrics;
use scanflow::planner::{PartitionSpec, PlanBuilder};
use scanflow::scheduler::job::{JobState, ResourceEstimate, ScanRequest, SourceRef, TaskState};
use scanflow::scheduler::orchestrator::{EngineCommand, Orchestrator};
use scanflow::worker::TaskOutcome;
use test_harness::{ManualWorker, TestEngine};

fn single_task_plan(source: &str) -> scanflow::planner::ExecutionPlan {
    let request = ScanRequest::new(SourceRef::new(source));
    let mut builder = PlanBuilder::new(request);
    builder.add_task(
        PartitionSpec::scan(0, 0, 100),
        Vec::new(),
        ResourceEstimate::default(),
    );
    builder.build().unwrap()
}

/// A worker stops heartbeating while holding a lease. Its task is
/// reassigned to another worker with a higher fencing token, the job
/// still succeeds, and exactly one NodeUnreachable fault is recorded.
#[tokio::test]
async fn unreachable_worker_fails_over_task_without_job_failure() {
    let engine = TestEngine::start(0, 1).await;

    let mut doomed = ManualWorker::register(&engine.handle, 101, 1).await;
    let doomed_alive = doomed.keep_alive(50);

    let job_id = engine
        .handle
        .submit_plan(single_task_plan("scripted://failover"))
        .await
        .unwrap();
    let first = doomed.next_assignment(Duration::from_secs(2)).await;

    let mut survivor = ManualWorker::register(&engine.handle, 202, 1).await;
    let _survivor_alive = survivor.keep_alive(50);

    // The first worker goes silent without reporting anything. After
    // enough missed heartbeats its lease is revoked and the task moves.
    doomed_alive.cancel();

    let second = survivor.next_assignment(Duration::from_secs(5)).await;
    assert_eq!(second.task_id, first.task_id);
    assert!(
        second.lease.token > first.lease.token,
        "reassignment must fence out the old lease"
    );

    engine
        .handle
        .report_started(second.task_id, second.lease.token)
        .await
        .unwrap();
    engine
        .handle
        .report_finished(
            second.task_id,
            second.lease.lease_id,
            second.lease.token,
            TaskOutcome::Succeeded(Default::default()),
        )
        .await
        .unwrap();

    let status = engine
        .wait_for_job_state(job_id, JobState::Succeeded, Duration::from_secs(5))
        .await;
    let unreachable: Vec<_> = status
        .fault_records
        .iter()
        .filter(|f| f.kind == ErrorKind::NodeUnreachable)
        .collect();
    assert_eq!(unreachable.len(), 1);
    assert!(matches!(
        unreachable[0].recovery,
        RecoveryAction::Failover { worker_id: 101 }
    ));
    // The interrupted attempt is not charged to the task.
    assert_eq!(status.task_summaries[0].attempts, 1);
}

/// After reassignment the original worker comes back and reports a
/// failure with its superseded token. The stale result is discarded and
/// the job's outcome is decided by the current lease holder alone.
#[tokio::test]
async fn stale_fencing_token_result_is_discarded() {
    let engine = TestEngine::start(0, 1).await;

    let mut zombie = ManualWorker::register(&engine.handle, 111, 1).await;
    let zombie_alive = zombie.keep_alive(50);

    let job_id = engine
        .handle
        .submit_plan(single_task_plan("scripted://fencing"))
        .await
        .unwrap();
    let stale = zombie.next_assignment(Duration::from_secs(2)).await;

    let mut current = ManualWorker::register(&engine.handle, 222, 1).await;
    let _current_alive = current.keep_alive(50);
    zombie_alive.cancel();

    let fresh = current.next_assignment(Duration::from_secs(5)).await;
    assert!(fresh.lease.token > stale.lease.token);

    // The zombie resurfaces with a result under the old token. If this
    // were accepted the job would fail permanently.
    engine
        .handle
        .report_finished(
            stale.task_id,
            stale.lease.lease_id,
            stale.lease.token,
            TaskOutcome::Failed {
                kind: ErrorKind::Permanent,
                message: "stale worker view".to_string(),
            },
        )
        .await
        .unwrap();

    engine
        .handle
        .report_finished(
            fresh.task_id,
            fresh.lease.lease_id,
            fresh.lease.token,
            TaskOutcome::Succeeded(Default::default()),
        )
        .await
        .unwrap();

    let status = engine
        .wait_for_job_state(job_id, JobState::Succeeded, Duration::from_secs(5))
        .await;
    assert_eq!(status.task_summaries[0].state, TaskState::Succeeded);
}

/// A lease that is never renewed expires and the task is reassigned,
/// without consuming the retry budget even at max_attempts = 1.
#[tokio::test]
async fn expired_lease_requeues_without_consuming_retry_budget() {
    let mut config = TestEngine::config(0, 1);
    config.lease.ttl_ms = 300;
    // Heartbeat staleness must not fire first; only the lease expires.
    config.health.heartbeat_interval_ms = 10_000;
    config.retry.max_attempts = 1;
    let engine = TestEngine::with_config(config).await;

    let mut worker = ManualWorker::register(&engine.handle, 301, 1).await;
    let job_id = engine
        .handle
        .submit_plan(single_task_plan("scripted://expiry"))
        .await
        .unwrap();

    let first = worker.next_assignment(Duration::from_secs(2)).await;
    // No renewal, no heartbeat: the lease lapses and the same (still
    // healthy) worker is granted a fresh one.
    let second = worker.next_assignment(Duration::from_secs(3)).await;
    assert_eq!(second.task_id, first.task_id);
    assert!(second.lease.token > first.lease.token);
    // The superseded lease can no longer be renewed.
    assert!(!engine.handle.renew_lease(first.lease.lease_id).await.unwrap());

    engine
        .handle
        .report_finished(
            second.task_id,
            second.lease.lease_id,
            second.lease.token,
            TaskOutcome::Succeeded(Default::default()),
        )
        .await
        .unwrap();

    let status = engine
        .wait_for_job_state(job_id, JobState::Succeeded, Duration::from_secs(5))
        .await;
    assert_eq!(status.task_summaries[0].attempts, 1);
    let expiries: Vec<_> = status
        .fault_records
        .iter()
        .filter(|f| f.kind == ErrorKind::LeaseExpired)
        .collect();
    assert_eq!(expiries.len(), 1);
    assert!(matches!(expiries[0].recovery, RecoveryAction::Requeue));
}

/// A replica that does not hold the leadership lock refuses mutations
/// with NotLeader but still answers read-only status queries.
#[tokio::test]
async fn follower_replica_refuses_mutations_but_serves_reads() {
    let lock = ElectionLock::new(Duration::from_secs(60));
    let mut leader = ElectionMember::new(
        1,
        lock.clone(),
        Duration::from_millis(10),
        Duration::from_millis(20),
    );
    assert!(leader.maintain(Instant::now()));

    let follower = ElectionMember::new(
        2,
        lock,
        Duration::from_millis(10),
        Duration::from_millis(20),
    );
    let metrics = Arc::new(EngineMetrics::new().unwrap());
    let orchestrator = Orchestrator::new(TestEngine::config(0, 1), follower, metrics);
    let (commands, command_rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();
    tokio::spawn(orchestrator.run(command_rx, shutdown.clone()));

    let (reply, rx) = oneshot::channel();
    commands
        .send(EngineCommand::Submit {
            plan: single_task_plan("scripted://replica"),
            reply,
        })
        .await
        .unwrap();
    let err = rx.await.unwrap().unwrap_err();
    assert!(matches!(err, ScanError::NotLeader(Some(1))));

    let (reply, rx) = oneshot::channel();
    commands
        .send(EngineCommand::Status {
            job_id: uuid::Uuid::new_v4(),
            reply,
        })
        .await
        .unwrap();
    assert!(matches!(rx.await.unwrap(), Err(ScanError::JobNotFound(_))));

    shutdown.cancel();
}
