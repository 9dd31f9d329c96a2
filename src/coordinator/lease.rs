use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::pool::ReservationId;
use crate::scheduler::job::{JobId, TaskId, WorkerId};

pub type LeaseId = Uuid;

/// The worker-visible half of a lease: carried in the assignment and
/// echoed back with the task result. A result whose fencing token no
/// longer matches the lease table is discarded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub lease_id: LeaseId,
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub token: u64,
    pub ttl_ms: u64,
}

#[derive(Debug)]
struct ActiveLease {
    lease_id: LeaseId,
    job_id: JobId,
    worker_id: WorkerId,
    token: u64,
    reservation: ReservationId,
    renewed_at: Instant,
    granted_at: Instant,
    cancel: CancellationToken,
}

/// A revoked or released lease, returned so the caller can release the
/// reservation and requeue or finalize the task.
#[derive(Debug)]
pub struct ReleasedLease {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub token: u64,
    pub reservation: ReservationId,
    pub held_for: Duration,
}

/// Lease table owned by the coordinator. Grants carry a monotonically
/// increasing fencing token; at most one active lease exists per task.
#[derive(Debug)]
pub struct LeaseTable {
    by_task: HashMap<TaskId, ActiveLease>,
    by_id: HashMap<LeaseId, TaskId>,
    next_token: u64,
    ttl: Duration,
}

impl LeaseTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            by_task: HashMap::new(),
            by_id: HashMap::new(),
            next_token: 1,
            ttl,
        }
    }

    /// Grant a lease binding `task_id` to `worker_id`. Any previous lease
    /// for the task is revoked first, so its token can never race the new
    /// one.
    pub fn grant(
        &mut self,
        task_id: TaskId,
        job_id: JobId,
        worker_id: WorkerId,
        reservation: ReservationId,
        cancel: CancellationToken,
        now: Instant,
    ) -> LeaseGrant {
        if self.by_task.contains_key(&task_id) {
            self.revoke_task(task_id);
        }
        let token = self.next_token;
        self.next_token += 1;
        let lease_id = Uuid::new_v4();
        self.by_task.insert(
            task_id,
            ActiveLease {
                lease_id,
                job_id,
                worker_id,
                token,
                reservation,
                renewed_at: now,
                granted_at: now,
                cancel,
            },
        );
        self.by_id.insert(lease_id, task_id);
        LeaseGrant {
            lease_id,
            task_id,
            worker_id,
            token,
            ttl_ms: self.ttl.as_millis() as u64,
        }
    }

    /// True when `token` is the task's current fencing token.
    pub fn validate(&self, task_id: TaskId, token: u64) -> bool {
        self.by_task
            .get(&task_id)
            .map(|lease| lease.token == token)
            .unwrap_or(false)
    }

    /// Renew one lease. Returns false when the lease is gone (expired or
    /// superseded), in which case the holder must abort.
    pub fn renew(&mut self, lease_id: LeaseId, now: Instant) -> bool {
        let Some(task_id) = self.by_id.get(&lease_id) else {
            return false;
        };
        match self.by_task.get_mut(task_id) {
            Some(lease) if lease.lease_id == lease_id => {
                lease.renewed_at = now;
                true
            }
            _ => false,
        }
    }

    /// Renew every lease held by a worker; called when its heartbeat
    /// arrives.
    pub fn renew_for_worker(&mut self, worker_id: WorkerId, now: Instant) {
        for lease in self.by_task.values_mut() {
            if lease.worker_id == worker_id {
                lease.renewed_at = now;
            }
        }
    }

    fn remove(&mut self, task_id: TaskId) -> Option<ReleasedLease> {
        let lease = self.by_task.remove(&task_id)?;
        self.by_id.remove(&lease.lease_id);
        Some(ReleasedLease {
            task_id,
            job_id: lease.job_id,
            worker_id: lease.worker_id,
            token: lease.token,
            reservation: lease.reservation,
            held_for: Instant::now().saturating_duration_since(lease.granted_at),
        })
    }

    /// Release a lease on normal task completion.
    pub fn release(&mut self, lease_id: LeaseId) -> Option<ReleasedLease> {
        let task_id = *self.by_id.get(&lease_id)?;
        self.remove(task_id)
    }

    /// Revoke the active lease of a task, cancelling its execution
    /// context.
    pub fn revoke_task(&mut self, task_id: TaskId) -> Option<ReleasedLease> {
        if let Some(lease) = self.by_task.get(&task_id) {
            lease.cancel.cancel();
        }
        self.remove(task_id)
    }

    /// Revoke all leases held by a worker (failover path).
    pub fn revoke_worker(&mut self, worker_id: WorkerId) -> Vec<ReleasedLease> {
        let task_ids: Vec<TaskId> = self
            .by_task
            .iter()
            .filter(|(_, lease)| lease.worker_id == worker_id)
            .map(|(task_id, _)| *task_id)
            .collect();
        task_ids
            .into_iter()
            .filter_map(|task_id| {
                let lease = self.by_task.get(&task_id)?;
                lease.cancel.cancel();
                self.remove(task_id)
            })
            .collect()
    }

    /// Tasks whose lease has not been renewed within the TTL.
    pub fn expired(&self, now: Instant) -> Vec<TaskId> {
        self.by_task
            .iter()
            .filter(|(_, lease)| now.saturating_duration_since(lease.renewed_at) >= self.ttl)
            .map(|(task_id, _)| *task_id)
            .collect()
    }

    pub fn expire_task(&mut self, task_id: TaskId) -> Option<ReleasedLease> {
        if let Some(lease) = self.by_task.get(&task_id) {
            lease.cancel.cancel();
        }
        self.remove(task_id)
    }

    pub fn held_by(&self, worker_id: WorkerId) -> usize {
        self.by_task
            .values()
            .filter(|lease| lease.worker_id == worker_id)
            .count()
    }

    pub fn active_count(&self) -> usize {
        self.by_task.len()
    }

    pub fn worker_of(&self, task_id: TaskId) -> Option<WorkerId> {
        self.by_task.get(&task_id).map(|lease| lease.worker_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(ttl_ms: u64) -> LeaseTable {
        LeaseTable::new(Duration::from_millis(ttl_ms))
    }

    fn grant(table: &mut LeaseTable, task: TaskId, worker: WorkerId) -> LeaseGrant {
        table.grant(
            task,
            Uuid::new_v4(),
            worker,
            Uuid::new_v4(),
            CancellationToken::new(),
            Instant::now(),
        )
    }

    #[test]
    fn tokens_are_strictly_increasing() {
        let mut leases = table(5_000);
        let a = grant(&mut leases, Uuid::new_v4(), 1);
        let b = grant(&mut leases, Uuid::new_v4(), 1);
        assert!(b.token > a.token);
    }

    #[test]
    fn regrant_fences_out_the_old_token() {
        let mut leases = table(5_000);
        let task = Uuid::new_v4();
        let old = grant(&mut leases, task, 1);
        let new = grant(&mut leases, task, 2);

        assert!(new.token > old.token);
        assert!(!leases.validate(task, old.token));
        assert!(leases.validate(task, new.token));
        assert_eq!(leases.active_count(), 1);
        // The superseded lease id can no longer be renewed.
        assert!(!leases.renew(old.lease_id, Instant::now()));
    }

    #[test]
    fn expiry_without_renewal() {
        let mut leases = table(100);
        let task = Uuid::new_v4();
        let g = grant(&mut leases, task, 1);

        let now = Instant::now();
        assert!(leases.expired(now + Duration::from_millis(200)).contains(&task));
        assert!(leases.renew(g.lease_id, now + Duration::from_millis(90)));
        // Renewed just in time: not expired shortly after.
        assert!(leases
            .expired(now + Duration::from_millis(150))
            .is_empty());
    }

    #[test]
    fn revoke_worker_cancels_and_returns_all() {
        let mut leases = table(5_000);
        let cancel = CancellationToken::new();
        let task_a = Uuid::new_v4();
        let task_b = Uuid::new_v4();
        leases.grant(
            task_a,
            Uuid::new_v4(),
            7,
            Uuid::new_v4(),
            cancel.clone(),
            Instant::now(),
        );
        grant(&mut leases, task_b, 8);

        let released = leases.revoke_worker(7);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].task_id, task_a);
        assert!(cancel.is_cancelled());
        assert_eq!(leases.held_by(8), 1);
    }

    #[test]
    fn heartbeat_renews_all_worker_leases() {
        let mut leases = table(100);
        let task = Uuid::new_v4();
        grant(&mut leases, task, 3);

        let later = Instant::now() + Duration::from_millis(90);
        leases.renew_for_worker(3, later);
        assert!(leases.expired(later + Duration::from_millis(50)).is_empty());
    }
}
