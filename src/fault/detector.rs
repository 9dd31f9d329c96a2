use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

use crate::config::HealthConfig;
use crate::scheduler::job::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerHealth {
    Healthy,
    Degraded,
    Unreachable,
}

impl std::fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerHealth::Healthy => write!(f, "healthy"),
            WorkerHealth::Degraded => write!(f, "degraded"),
            WorkerHealth::Unreachable => write!(f, "unreachable"),
        }
    }
}

#[derive(Debug)]
struct Tracked {
    last_heartbeat: Instant,
    health: WorkerHealth,
}

/// Tracks worker heartbeat staleness. One missed heartbeat interval marks
/// a worker DEGRADED; `unreachable_after_misses` consecutive misses mark
/// it UNREACHABLE, at which point the caller revokes its leases.
#[derive(Debug)]
pub struct WorkerTracker {
    workers: HashMap<WorkerId, Tracked>,
    heartbeat_interval: Duration,
    unreachable_after: u32,
}

impl WorkerTracker {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            workers: HashMap::new(),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            unreachable_after: config.unreachable_after_misses.max(1),
        }
    }

    pub fn register(&mut self, worker_id: WorkerId, now: Instant) {
        self.workers.insert(
            worker_id,
            Tracked {
                last_heartbeat: now,
                health: WorkerHealth::Healthy,
            },
        );
    }

    pub fn remove(&mut self, worker_id: WorkerId) {
        self.workers.remove(&worker_id);
    }

    /// Record a heartbeat. Returns false for unknown workers so the
    /// caller can re-register them.
    pub fn heartbeat(&mut self, worker_id: WorkerId, now: Instant) -> bool {
        match self.workers.get_mut(&worker_id) {
            Some(tracked) => {
                tracked.last_heartbeat = now;
                if tracked.health != WorkerHealth::Healthy {
                    tracing::info!(worker_id, "Worker heartbeat resumed");
                    tracked.health = WorkerHealth::Healthy;
                }
                true
            }
            None => false,
        }
    }

    pub fn health(&self, worker_id: WorkerId) -> Option<WorkerHealth> {
        self.workers.get(&worker_id).map(|t| t.health)
    }

    pub fn healthy_workers(&self) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|(_, t)| t.health == WorkerHealth::Healthy)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Re-evaluate staleness and return the transitions that occurred.
    pub fn sweep(&mut self, now: Instant) -> Vec<(WorkerId, WorkerHealth)> {
        let mut transitions = Vec::new();
        for (id, tracked) in &mut self.workers {
            let elapsed = now.saturating_duration_since(tracked.last_heartbeat);
            let misses = (elapsed.as_millis() / self.heartbeat_interval.as_millis().max(1)) as u32;
            let next = if misses >= self.unreachable_after {
                WorkerHealth::Unreachable
            } else if misses >= 1 {
                WorkerHealth::Degraded
            } else {
                WorkerHealth::Healthy
            };
            if next != tracked.health {
                tracked.health = next;
                transitions.push((*id, next));
            }
        }
        transitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> WorkerTracker {
        WorkerTracker::new(&HealthConfig {
            heartbeat_interval_ms: 100,
            unreachable_after_misses: 3,
        })
    }

    #[test]
    fn fresh_worker_is_healthy() {
        let mut t = tracker();
        let now = Instant::now();
        t.register(1, now);
        assert_eq!(t.health(1), Some(WorkerHealth::Healthy));
        assert!(t.sweep(now).is_empty());
    }

    #[test]
    fn one_missed_interval_degrades() {
        let mut t = tracker();
        let now = Instant::now();
        t.register(1, now);
        let transitions = t.sweep(now + Duration::from_millis(150));
        assert_eq!(transitions, vec![(1, WorkerHealth::Degraded)]);
        assert!(t.healthy_workers().is_empty());
    }

    #[test]
    fn sustained_loss_is_unreachable() {
        let mut t = tracker();
        let now = Instant::now();
        t.register(1, now);
        let transitions = t.sweep(now + Duration::from_millis(350));
        assert_eq!(transitions, vec![(1, WorkerHealth::Unreachable)]);
    }

    #[test]
    fn heartbeat_restores_health() {
        let mut t = tracker();
        let now = Instant::now();
        t.register(1, now);
        t.sweep(now + Duration::from_millis(150));
        assert!(t.heartbeat(1, now + Duration::from_millis(160)));
        assert_eq!(t.health(1), Some(WorkerHealth::Healthy));
        assert!(t.sweep(now + Duration::from_millis(200)).is_empty());
    }

    #[test]
    fn unknown_worker_heartbeat_is_rejected() {
        let mut t = tracker();
        assert!(!t.heartbeat(9, Instant::now()));
    }
}
