//! Resource pool manager: per-worker slot accounting with an optional
//! global ceiling. Reservation denial is backpressure, not failure; the
//! orchestrator retries denied tasks on the next scheduling tick.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::scheduler::job::WorkerId;

pub type ReservationId = Uuid;

/// One eligible worker as seen by a placement policy.
#[derive(Debug, Clone, Copy)]
pub struct PlacementCandidate {
    pub worker_id: WorkerId,
    pub free: u32,
    pub reserved: u32,
}

/// Placement strategy: chooses which worker hosts a reservation among
/// the candidates with sufficient free capacity. Swappable without
/// touching the scheduler's state machine.
pub trait PlacementPolicy: Send + Sync {
    fn place(&self, candidates: &[PlacementCandidate], slots: u32) -> Option<WorkerId>;
}

/// Default placement: the worker with the fewest reserved slots.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastLoaded;

impl PlacementPolicy for LeastLoaded {
    fn place(&self, candidates: &[PlacementCandidate], _slots: u32) -> Option<WorkerId> {
        candidates
            .iter()
            .min_by_key(|c| c.reserved)
            .map(|c| c.worker_id)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    pub id: ReservationId,
    pub worker_id: WorkerId,
    pub slots: u32,
}

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, Copy)]
pub enum ReserveOutcome {
    Reserved(Reservation),
    /// No eligible worker has enough free capacity (or the global
    /// ceiling is hit).
    Denied,
}

#[derive(Debug)]
struct SlotState {
    capacity: u32,
    reserved: u32,
}

pub struct ResourcePool {
    workers: HashMap<WorkerId, SlotState>,
    reservations: HashMap<ReservationId, Reservation>,
    ceiling: Option<u32>,
    policy: Arc<dyn PlacementPolicy>,
}

impl ResourcePool {
    pub fn new(ceiling: Option<u32>) -> Self {
        Self {
            workers: HashMap::new(),
            reservations: HashMap::new(),
            ceiling,
            policy: Arc::new(LeastLoaded),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn PlacementPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn add_worker(&mut self, worker_id: WorkerId, capacity: u32) {
        self.workers.insert(
            worker_id,
            SlotState {
                capacity,
                reserved: 0,
            },
        );
    }

    /// Remove a worker's capacity. Its outstanding reservations are
    /// dropped; the caller is responsible for requeueing their tasks.
    pub fn remove_worker(&mut self, worker_id: WorkerId) {
        self.workers.remove(&worker_id);
        self.reservations.retain(|_, r| r.worker_id != worker_id);
    }

    pub fn has_worker(&self, worker_id: WorkerId) -> bool {
        self.workers.contains_key(&worker_id)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Reserve `slots` on an eligible worker chosen by the placement
    /// policy among those with enough free capacity.
    pub fn reserve(&mut self, slots: u32, eligible: &[WorkerId]) -> ReserveOutcome {
        if let Some(ceiling) = self.ceiling {
            if self.in_use() + slots > ceiling {
                return ReserveOutcome::Denied;
            }
        }
        let candidates: Vec<PlacementCandidate> = eligible
            .iter()
            .filter_map(|id| self.workers.get(id).map(|s| (*id, s)))
            .filter(|(_, s)| s.capacity.saturating_sub(s.reserved) >= slots)
            .map(|(worker_id, s)| PlacementCandidate {
                worker_id,
                free: s.capacity.saturating_sub(s.reserved),
                reserved: s.reserved,
            })
            .collect();

        let Some(worker_id) = self.policy.place(&candidates, slots) else {
            return ReserveOutcome::Denied;
        };
        if let Some(state) = self.workers.get_mut(&worker_id) {
            state.reserved += slots;
        }
        let reservation = Reservation {
            id: Uuid::new_v4(),
            worker_id,
            slots,
        };
        self.reservations.insert(reservation.id, reservation);
        ReserveOutcome::Reserved(reservation)
    }

    pub fn release(&mut self, reservation_id: ReservationId) -> bool {
        let Some(reservation) = self.reservations.remove(&reservation_id) else {
            return false;
        };
        if let Some(state) = self.workers.get_mut(&reservation.worker_id) {
            state.reserved = state.reserved.saturating_sub(reservation.slots);
        }
        true
    }

    pub fn total_capacity(&self) -> u32 {
        self.workers.values().map(|s| s.capacity).sum()
    }

    pub fn in_use(&self) -> u32 {
        self.workers.values().map(|s| s.reserved).sum()
    }

    pub fn free_on(&self, worker_id: WorkerId) -> u32 {
        self.workers
            .get(&worker_id)
            .map(|s| s.capacity.saturating_sub(s.reserved))
            .unwrap_or(0)
    }

    /// Per-worker `(id, capacity, reserved)` snapshot for status output.
    pub fn worker_snapshot(&self) -> Vec<(WorkerId, u32, u32)> {
        let mut snapshot: Vec<(WorkerId, u32, u32)> = self
            .workers
            .iter()
            .map(|(id, s)| (*id, s.capacity, s.reserved))
            .collect();
        snapshot.sort_by_key(|(id, _, _)| *id);
        snapshot
    }

    /// Fraction of total capacity currently reserved, in `[0, 1]`.
    pub fn utilization(&self) -> f64 {
        let capacity = self.total_capacity();
        if capacity == 0 {
            return 0.0;
        }
        f64::from(self.in_use()) / f64::from(capacity)
    }
}
