//! Workflow DAG orchestration: job/task state machines, the per-priority
//! ready queue, and the single-writer scheduling actor.

pub mod graph;
pub mod job;
pub mod orchestrator;
pub mod queue;

pub use job::{
    FailurePolicy, JobId, JobState, JobStatus, JobSummary, Priority, ScanPayload, ScanRequest,
    ScanTask, SourceRef, TaskId, TaskState, TaskSummary, WorkerId,
};
pub use orchestrator::{ClusterStatus, EngineCommand, LoadSample, Orchestrator, WorkerSummary};
pub use queue::ReadyQueue;
