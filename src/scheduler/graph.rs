use std::collections::{HashMap, HashSet, VecDeque};

use crate::scheduler::job::{ScanTask, TaskId, TaskState};

/// Runtime dependency graph of one job's tasks. Dependency edges are
/// honored strictly: a task becomes READY only when every dependency has
/// SUCCEEDED.
#[derive(Debug)]
pub struct TaskGraph {
    tasks: HashMap<TaskId, ScanTask>,
    dependents: HashMap<TaskId, Vec<TaskId>>,
    order: Vec<TaskId>,
}

impl TaskGraph {
    pub fn new(tasks: Vec<ScanTask>) -> Self {
        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let mut order = Vec::with_capacity(tasks.len());
        let mut map = HashMap::with_capacity(tasks.len());
        for task in tasks {
            for dep in &task.deps {
                dependents.entry(*dep).or_default().push(task.id);
            }
            order.push(task.id);
            map.insert(task.id, task);
        }
        Self {
            tasks: map,
            dependents,
            order,
        }
    }

    pub fn task(&self, id: TaskId) -> Option<&ScanTask> {
        self.tasks.get(&id)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut ScanTask> {
        self.tasks.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in insertion order, for stable status output.
    pub fn iter_ordered(&self) -> impl Iterator<Item = &ScanTask> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.order.clone()
    }

    fn deps_satisfied(&self, id: TaskId) -> bool {
        self.tasks
            .get(&id)
            .map(|task| {
                task.deps.iter().all(|dep| {
                    self.tasks
                        .get(dep)
                        .map(|d| d.state == TaskState::Succeeded)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    /// Move dependency-free PENDING tasks to READY and return them.
    pub fn promote_roots(&mut self) -> Vec<TaskId> {
        let ready: Vec<TaskId> = self
            .order
            .iter()
            .filter(|id| {
                self.tasks
                    .get(id)
                    .map(|t| t.state == TaskState::Pending && t.deps.is_empty())
                    .unwrap_or(false)
            })
            .copied()
            .collect();
        for id in &ready {
            if let Some(task) = self.tasks.get_mut(id) {
                task.state = TaskState::Ready;
            }
        }
        ready
    }

    /// Mark `id` SUCCEEDED and promote any direct dependents whose
    /// dependencies are now all satisfied. Returns the newly READY tasks.
    pub fn mark_succeeded(&mut self, id: TaskId) -> Vec<TaskId> {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.state = TaskState::Succeeded;
        }
        let candidates = self.dependents.get(&id).cloned().unwrap_or_default();
        let mut ready = Vec::new();
        for dependent in candidates {
            let pending = self
                .tasks
                .get(&dependent)
                .map(|t| t.state == TaskState::Pending && !t.blocked)
                .unwrap_or(false);
            if pending && self.deps_satisfied(dependent) {
                if let Some(task) = self.tasks.get_mut(&dependent) {
                    task.state = TaskState::Ready;
                }
                ready.push(dependent);
            }
        }
        ready
    }

    /// Transitive dependents of `id`: every task whose only path to
    /// completion runs through it.
    pub fn downstream_of(&self, id: TaskId) -> Vec<TaskId> {
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut frontier: VecDeque<TaskId> = VecDeque::new();
        frontier.push_back(id);
        while let Some(next) = frontier.pop_front() {
            for dependent in self.dependents.get(&next).into_iter().flatten() {
                if seen.insert(*dependent) {
                    frontier.push_back(*dependent);
                }
            }
        }
        let mut out: Vec<TaskId> = self
            .order
            .iter()
            .filter(|tid| seen.contains(tid))
            .copied()
            .collect();
        out.dedup();
        out
    }

    /// True when every task is terminal or blocked behind a terminal
    /// failure.
    pub fn all_settled(&self) -> bool {
        self.tasks.values().all(|t| t.is_settled())
    }

    pub fn count_in_state(&self, state: TaskState) -> usize {
        self.tasks.values().filter(|t| t.state == state).count()
    }

    pub fn any_failed(&self) -> bool {
        self.tasks
            .values()
            .any(|t| t.state == TaskState::Failed || t.blocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::partition::PartitionSpec;
    use crate::scheduler::job::ResourceEstimate;
    use uuid::Uuid;

    fn task(job: Uuid, deps: Vec<TaskId>) -> ScanTask {
        ScanTask::new(
            Uuid::new_v4(),
            job,
            PartitionSpec::whole_source(),
            deps,
            ResourceEstimate::default(),
        )
    }

    #[test]
    fn roots_become_ready() {
        let job = Uuid::new_v4();
        let a = task(job, vec![]);
        let b = task(job, vec![a.id]);
        let (a_id, b_id) = (a.id, b.id);
        let mut graph = TaskGraph::new(vec![a, b]);

        let ready = graph.promote_roots();
        assert_eq!(ready, vec![a_id]);
        assert_eq!(graph.task(a_id).unwrap().state, TaskState::Ready);
        assert_eq!(graph.task(b_id).unwrap().state, TaskState::Pending);
    }

    #[test]
    fn dependent_ready_only_after_all_deps_succeed() {
        let job = Uuid::new_v4();
        let a = task(job, vec![]);
        let b = task(job, vec![]);
        let c = task(job, vec![a.id, b.id]);
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        let mut graph = TaskGraph::new(vec![a, b, c]);
        graph.promote_roots();

        assert!(graph.mark_succeeded(a_id).is_empty());
        assert_eq!(graph.mark_succeeded(b_id), vec![c_id]);
        assert_eq!(graph.task(c_id).unwrap().state, TaskState::Ready);
    }

    #[test]
    fn downstream_closure_is_transitive() {
        let job = Uuid::new_v4();
        let a = task(job, vec![]);
        let b = task(job, vec![a.id]);
        let c = task(job, vec![b.id]);
        let d = task(job, vec![]);
        let (a_id, b_id, c_id, d_id) = (a.id, b.id, c.id, d.id);
        let graph = TaskGraph::new(vec![a, b, c, d]);

        let downstream = graph.downstream_of(a_id);
        assert!(downstream.contains(&b_id));
        assert!(downstream.contains(&c_id));
        assert!(!downstream.contains(&d_id));
        assert!(!downstream.contains(&a_id));
    }

    #[test]
    fn settled_counts_blocked_tasks() {
        let job = Uuid::new_v4();
        let a = task(job, vec![]);
        let b = task(job, vec![a.id]);
        let (a_id, b_id) = (a.id, b.id);
        let mut graph = TaskGraph::new(vec![a, b]);
        graph.promote_roots();

        graph.task_mut(a_id).unwrap().state = TaskState::Failed;
        assert!(!graph.all_settled());
        graph.task_mut(b_id).unwrap().blocked = true;
        assert!(graph.all_settled());
        assert!(graph.any_failed());
    }
}
