use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::fault::FaultRecord;
use crate::planner::partition::PartitionSpec;

pub type JobId = Uuid;
pub type TaskId = Uuid;
pub type WorkerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Queue tier index, most urgent first.
    pub fn tier(self) -> usize {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub const TIERS: usize = 4;
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Whether one branch's terminal failure aborts the whole job or lets
/// independent branches finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    FailFast,
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub uri: String,
    /// Scannable size in bytes, when the catalog knows it.
    pub bytes: Option<u64>,
}

impl SourceRef {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            bytes: None,
        }
    }

    pub fn sized(uri: impl Into<String>, bytes: u64) -> Self {
        Self {
            uri: uri.into(),
            bytes: Some(bytes),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceConstraints {
    /// Cap on concurrently running tasks of this job.
    pub max_concurrency: Option<u32>,
    /// Wall-clock deadline for the whole job; individual task deadlines
    /// are derived from it.
    pub deadline: Option<DateTime<Utc>>,
}

/// A scan request as accepted at submission. Immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub source: SourceRef,
    /// Opaque rule-set reference, passed through to the connector unexamined.
    pub rule_set: serde_json::Value,
    pub priority: Priority,
    pub constraints: ResourceConstraints,
    pub failure_policy: FailurePolicy,
    /// Append a merge task fanning in from all scan partitions.
    pub merge_results: bool,
    pub submitted_at: DateTime<Utc>,
}

impl ScanRequest {
    pub fn new(source: SourceRef) -> Self {
        Self {
            source,
            rule_set: serde_json::Value::Null,
            priority: Priority::Normal,
            constraints: ResourceConstraints::default(),
            failure_policy: FailurePolicy::FailFast,
            merge_results: false,
            submitted_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_rule_set(mut self, rule_set: serde_json::Value) -> Self {
        self.rule_set = rule_set;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.constraints.deadline = Some(deadline);
        self
    }

    pub fn with_max_concurrency(mut self, max: u32) -> Self {
        self.constraints.max_concurrency = Some(max);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_merge_results(mut self) -> Self {
        self.merge_results = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    Planned,
    Running,
    Succeeded,
    Failed,
    Cancelling,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Planned => write!(f, "planned"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelling => write!(f, "cancelling"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    Pending,
    Ready,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Retrying,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Ready => write!(f, "ready"),
            TaskState::Assigned => write!(f, "assigned"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Retrying => write!(f, "retrying"),
        }
    }
}

/// Slots and size estimate attached to a task for reservation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceEstimate {
    pub slots: u32,
    pub est_bytes: u64,
}

impl Default for ResourceEstimate {
    fn default() -> Self {
        Self {
            slots: 1,
            est_bytes: 0,
        }
    }
}

/// Result payload reported by the connector for one partition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanPayload {
    pub bytes_scanned: u64,
    pub matches: u64,
}

/// Unit of schedulable work within a job's DAG.
#[derive(Debug, Clone)]
pub struct ScanTask {
    pub id: TaskId,
    pub job_id: JobId,
    pub partition: PartitionSpec,
    pub deps: Vec<TaskId>,
    pub state: TaskState,
    /// A dependency failed terminally; this task can no longer run.
    pub blocked: bool,
    pub assigned_worker: Option<WorkerId>,
    pub attempts: u32,
    pub estimate: ResourceEstimate,
    pub payload: Option<ScanPayload>,
    pub last_error: Option<(ErrorKind, String)>,
}

impl ScanTask {
    pub fn new(
        id: TaskId,
        job_id: JobId,
        partition: PartitionSpec,
        deps: Vec<TaskId>,
        estimate: ResourceEstimate,
    ) -> Self {
        Self {
            id,
            job_id,
            partition,
            deps,
            state: TaskState::Pending,
            blocked: false,
            assigned_worker: None,
            attempts: 0,
            estimate,
            payload: None,
            last_error: None,
        }
    }

    /// Settled tasks need no further scheduling: terminal, or blocked
    /// behind a terminal failure.
    pub fn is_settled(&self) -> bool {
        self.state.is_terminal() || self.blocked
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: TaskId,
    pub state: TaskState,
    pub blocked: bool,
    pub attempts: u32,
    pub assigned_worker: Option<WorkerId>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
}

impl From<&ScanTask> for TaskSummary {
    fn from(task: &ScanTask) -> Self {
        Self {
            id: task.id,
            state: task.state,
            blocked: task.blocked,
            attempts: task.attempts,
            assigned_worker: task.assigned_worker,
            error_kind: task.last_error.as_ref().map(|(kind, _)| *kind),
            error: task.last_error.as_ref().map(|(_, msg)| msg.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub source: String,
    pub priority: Priority,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub task_summaries: Vec<TaskSummary>,
    pub fault_records: Vec<FaultRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: JobId,
    pub state: JobState,
    pub source: String,
    pub priority: Priority,
    pub submitted_at: DateTime<Utc>,
    pub tasks_total: usize,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
}
