//! Scan planner: validates a request, expands it into a task DAG via the
//! pluggable partitioner, and attaches resource estimates.

pub mod partition;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use uuid::Uuid;

use crate::error::{Result, ScanError};
use crate::scheduler::job::{JobId, ResourceEstimate, ScanRequest, TaskId};

pub use partition::{ByteRange, PartitionKind, PartitionSpec, Partitioner, UniformPartitioner};

/// One task of an execution plan, before it becomes runtime state.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: TaskId,
    pub partition: PartitionSpec,
    pub deps: Vec<TaskId>,
    pub estimate: ResourceEstimate,
}

/// A validated, acyclic execution plan ready for the orchestrator.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub job_id: JobId,
    pub request: ScanRequest,
    pub tasks: Vec<TaskSpec>,
}

/// Checks that every dependency refers to a task in the plan and that
/// the dependency edges form a DAG.
fn validate_dag(tasks: &[TaskSpec]) -> Result<()> {
    let ids: HashSet<TaskId> = tasks.iter().map(|t| t.id).collect();
    let mut graph = DiGraph::<TaskId, ()>::new();
    let mut nodes = std::collections::HashMap::new();
    for task in tasks {
        nodes.insert(task.id, graph.add_node(task.id));
    }
    for task in tasks {
        for dep in &task.deps {
            if !ids.contains(dep) {
                return Err(ScanError::InvalidRequest(format!(
                    "task {} depends on unknown task {}",
                    task.id, dep
                )));
            }
            graph.add_edge(nodes[dep], nodes[&task.id], ());
        }
    }
    if is_cyclic_directed(&graph) {
        return Err(ScanError::InvalidRequest(
            "task dependencies form a cycle".to_string(),
        ));
    }
    Ok(())
}

/// Builder for plans with explicit dependency edges, used by embedders
/// and tests that need DAG shapes beyond what the partitioner emits.
#[derive(Debug)]
pub struct PlanBuilder {
    job_id: JobId,
    request: ScanRequest,
    tasks: Vec<TaskSpec>,
}

impl PlanBuilder {
    pub fn new(request: ScanRequest) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            request,
            tasks: Vec::new(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn add_task(
        &mut self,
        partition: PartitionSpec,
        deps: Vec<TaskId>,
        estimate: ResourceEstimate,
    ) -> TaskId {
        let id = Uuid::new_v4();
        self.tasks.push(TaskSpec {
            id,
            partition,
            deps,
            estimate,
        });
        id
    }

    pub fn build(self) -> Result<ExecutionPlan> {
        if self.tasks.is_empty() {
            return Err(ScanError::InvalidRequest(
                "plan contains no tasks".to_string(),
            ));
        }
        validate_dag(&self.tasks)?;
        Ok(ExecutionPlan {
            job_id: self.job_id,
            request: self.request,
            tasks: self.tasks,
        })
    }
}

/// Translates scan requests into execution plans.
pub struct Planner {
    partitioner: Arc<dyn Partitioner>,
    /// Bytes one slot is expected to scan per task; drives the slot
    /// estimate attached to each task.
    throughput_bytes_per_slot: u64,
}

impl Planner {
    pub fn new(partitioner: Arc<dyn Partitioner>) -> Self {
        Self {
            partitioner,
            throughput_bytes_per_slot: 256 * 1024 * 1024,
        }
    }

    pub fn with_throughput(mut self, bytes_per_slot: u64) -> Self {
        self.throughput_bytes_per_slot = bytes_per_slot.max(1);
        self
    }

    fn validate(&self, request: &ScanRequest) -> Result<()> {
        if request.source.uri.trim().is_empty() {
            return Err(ScanError::InvalidRequest(
                "source must not be empty".to_string(),
            ));
        }
        if let Some(deadline) = request.constraints.deadline {
            if deadline <= Utc::now() {
                return Err(ScanError::InvalidRequest(
                    "deadline is in the past".to_string(),
                ));
            }
        }
        if request.constraints.max_concurrency == Some(0) {
            return Err(ScanError::InvalidRequest(
                "max concurrency must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn estimate(&self, partition: &PartitionSpec) -> ResourceEstimate {
        let bytes = partition.size_hint();
        let slots = (bytes / self.throughput_bytes_per_slot).max(1).min(u64::from(u32::MAX));
        ResourceEstimate {
            slots: slots as u32,
            est_bytes: bytes,
        }
    }

    /// Expand a request into a validated plan: one task per partition,
    /// plus a merge task fanning in from all of them when requested.
    pub fn plan(&self, request: ScanRequest) -> Result<ExecutionPlan> {
        self.validate(&request)?;
        let partitions = self.partitioner.partition(&request.source)?;
        if partitions.is_empty() {
            return Err(ScanError::InvalidRequest(
                "partitioner produced no partitions".to_string(),
            ));
        }

        let mut builder = PlanBuilder::new(request.clone());
        let scan_ids: Vec<TaskId> = partitions
            .iter()
            .map(|partition| {
                let estimate = self.estimate(partition);
                builder.add_task(partition.clone(), Vec::new(), estimate)
            })
            .collect();
        if request.merge_results {
            let merge = PartitionSpec::merge(partitions.len() as u32);
            builder.add_task(merge, scan_ids, ResourceEstimate::default());
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::SourceRef;
    use chrono::Duration as ChronoDuration;

    fn planner() -> Planner {
        Planner::new(Arc::new(UniformPartitioner {
            partition_bytes: 100,
        }))
    }

    #[test]
    fn rejects_empty_source() {
        let request = ScanRequest::new(SourceRef::new("  "));
        let err = planner().plan(request).unwrap_err();
        assert!(matches!(err, ScanError::InvalidRequest(_)));
    }

    #[test]
    fn rejects_past_deadline() {
        let request = ScanRequest::new(SourceRef::new("s3://b/d"))
            .with_deadline(Utc::now() - ChronoDuration::seconds(5));
        let err = planner().plan(request).unwrap_err();
        assert!(matches!(err, ScanError::InvalidRequest(_)));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let request = ScanRequest::new(SourceRef::new("s3://b/d")).with_max_concurrency(0);
        assert!(planner().plan(request).is_err());
    }

    #[test]
    fn plans_one_task_per_partition() {
        let request = ScanRequest::new(SourceRef::sized("s3://b/d", 250));
        let plan = planner().plan(request).unwrap();
        assert_eq!(plan.tasks.len(), 3);
        assert!(plan.tasks.iter().all(|t| t.deps.is_empty()));
        assert!(plan.tasks.iter().all(|t| t.estimate.slots == 1));
    }

    #[test]
    fn merge_task_depends_on_all_partitions() {
        let request = ScanRequest::new(SourceRef::sized("s3://b/d", 250)).with_merge_results();
        let plan = planner().plan(request).unwrap();
        assert_eq!(plan.tasks.len(), 4);
        let merge = plan.tasks.last().unwrap();
        assert_eq!(merge.partition.kind, PartitionKind::Merge);
        assert_eq!(merge.deps.len(), 3);
    }

    #[test]
    fn builder_rejects_cycles() {
        let request = ScanRequest::new(SourceRef::new("s3://b/d"));
        let mut builder = PlanBuilder::new(request);
        let a = builder.add_task(
            PartitionSpec::scan(0, 0, 10),
            Vec::new(),
            ResourceEstimate::default(),
        );
        let b = builder.add_task(
            PartitionSpec::scan(1, 10, 20),
            vec![a],
            ResourceEstimate::default(),
        );
        // Close the loop by rewriting a's deps.
        builder.tasks[0].deps.push(b);
        assert!(builder.build().is_err());
    }

    #[test]
    fn builder_rejects_unknown_dependency() {
        let request = ScanRequest::new(SourceRef::new("s3://b/d"));
        let mut builder = PlanBuilder::new(request);
        builder.add_task(
            PartitionSpec::whole_source(),
            vec![Uuid::new_v4()],
            ResourceEstimate::default(),
        );
        assert!(builder.build().is_err());
    }
}
