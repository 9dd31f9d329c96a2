//! Backpressure and scaling tests: reservation denial defers work
//! instead of failing it, slot capacity and per-job caps bound
//! parallelism, cancellation releases reservations, and the auto-scaler
//! stays inside its policy bounds.


use tokio::time::{sleep, Duration, Instant};

use scanflow::planner::{PartitionSpec, PlanBuilder};
use scanflow::scheduler::job::{JobState, ResourceEstimate, ScanRequest, SourceRef};
use test_harness::{Behavior, TestEngine};

fn independent_plan(source: &str, tasks: u32) -> scanflow::planner::ExecutionPlan {
    independent_plan_from(ScanRequest::new(SourceRef::new(source)), tasks)
}

fn independent_plan_from(request: ScanRequest, tasks: u32) -> scanflow::planner::ExecutionPlan {
    let mut builder = PlanBuilder::new(request);
    for index in 0..tasks {
        builder.add_task(
            PartitionSpec::scan(index, 0, 100),
            Vec::new(),
            ResourceEstimate::default(),
        );
    }
    builder.build().unwrap()
}

/// More READY tasks than free slots: denied reservations defer the
/// surplus without failing it or burning attempts, and everything
/// completes once capacity frees up.
#[tokio::test]
async fn denied_reservation_defers_task_until_capacity_frees() {
    let engine = TestEngine::start(1, 1).await;
    engine
        .connector
        .script("scripted://narrow", Behavior::Succeed { delay_ms: 100 });

    let job_id = engine
        .handle
        .submit_plan(independent_plan("scripted://narrow", 3))
        .await
        .unwrap();
    let status = engine
        .wait_for_job_state(job_id, JobState::Succeeded, Duration::from_secs(5))
        .await;

    assert_eq!(engine.connector.max_concurrent(), 1);
    for task in &status.task_summaries {
        assert_eq!(task.attempts, 1);
    }
    // Denial is backpressure, not a failure: no fault records.
    assert!(status.fault_records.is_empty());
}

/// Total parallelism never exceeds the fleet's slot capacity.
#[tokio::test]
async fn slot_capacity_bounds_parallelism() {
    let engine = TestEngine::start(2, 2).await;
    engine
        .connector
        .script("scripted://wide", Behavior::Succeed { delay_ms: 150 });

    let job_id = engine
        .handle
        .submit_plan(independent_plan("scripted://wide", 8))
        .await
        .unwrap();
    engine
        .wait_for_job_state(job_id, JobState::Succeeded, Duration::from_secs(10))
        .await;

    assert!(engine.connector.max_concurrent() <= 4);
}

/// A job's max_concurrency constraint caps its in-flight tasks below
/// what the fleet could otherwise run.
#[tokio::test]
async fn job_concurrency_constraint_is_honored() {
    let engine = TestEngine::start(2, 2).await;
    engine
        .connector
        .script("scripted://capped", Behavior::Succeed { delay_ms: 80 });

    let request =
        ScanRequest::new(SourceRef::new("scripted://capped")).with_max_concurrency(2);
    let job_id = engine
        .handle
        .submit_plan(independent_plan_from(request, 6))
        .await
        .unwrap();
    engine
        .wait_for_job_state(job_id, JobState::Succeeded, Duration::from_secs(10))
        .await;

    assert!(engine.connector.max_concurrent() <= 2);
}

/// Cancelling a job releases its reservations: a follow-up job needing
/// the full capacity still completes.
#[tokio::test]
async fn cancellation_leaves_no_dangling_reservations() {
    let mut config = TestEngine::config(1, 1);
    config.default_task_deadline_ms = 300;
    let engine = TestEngine::with_config(config).await;
    engine.connector.script("scripted://wedge", Behavior::Hang);

    let wedged = engine
        .handle
        .submit_plan(independent_plan("scripted://wedge", 1))
        .await
        .unwrap();
    engine
        .wait_for_job_state(wedged, JobState::Running, Duration::from_secs(2))
        .await;
    engine.handle.cancel(wedged).await.unwrap();
    engine
        .wait_for_job_state(wedged, JobState::Cancelled, Duration::from_secs(3))
        .await;

    // The single slot must be free again for the next job.
    let follow_up = engine
        .handle
        .submit_plan(independent_plan("scripted://after", 1))
        .await
        .unwrap();
    engine
        .wait_for_job_state(follow_up, JobState::Succeeded, Duration::from_secs(5))
        .await;
}

/// Under sustained load the fleet grows to the policy maximum and never
/// beyond; once idle it shrinks back to the minimum and never below.
#[tokio::test]
async fn autoscaler_stays_inside_policy_bounds() {
    let mut config = TestEngine::config(1, 1);
    config.scaling.min_workers = 1;
    config.scaling.max_workers = 3;
    config.scaling.step = 1;
    config.scaling.target_low = 0.2;
    config.scaling.target_high = 0.8;
    config.scaling.cooldown_ms = 100;
    config.scaling.sample_interval_ms = 25;
    let engine = TestEngine::with_config(config).await;
    engine
        .connector
        .script("scripted://surge", Behavior::Succeed { delay_ms: 200 });

    let job_id = engine
        .handle
        .submit_plan(independent_plan("scripted://surge", 12))
        .await
        .unwrap();

    // Saturated slots push utilization over the band; the fleet should
    // reach the maximum while never exceeding it.
    let deadline = Instant::now() + Duration::from_secs(8);
    let mut peak = 0usize;
    while Instant::now() < deadline {
        let cluster = engine.handle.cluster_status().await.unwrap();
        assert!(cluster.workers.len() <= 3, "fleet exceeded max_workers");
        peak = peak.max(cluster.workers.len());
        if peak == 3 {
            break;
        }
        sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(peak, 3, "fleet never reached max_workers under load");

    engine
        .wait_for_job_state(job_id, JobState::Succeeded, Duration::from_secs(10))
        .await;

    // Idle utilization sits under the band; the fleet drains back down.
    let deadline = Instant::now() + Duration::from_secs(8);
    loop {
        let cluster = engine.handle.cluster_status().await.unwrap();
        assert!(!cluster.workers.is_empty(), "fleet dropped below min_workers");
        if cluster.workers.len() == 1 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "fleet did not scale back down to min_workers"
        );
        sleep(Duration::from_millis(50)).await;
    }
}
