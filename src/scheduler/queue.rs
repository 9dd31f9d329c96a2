use std::collections::VecDeque;

use tokio::time::{Duration, Instant};

use crate::scheduler::job::{JobId, Priority, TaskId};

/// A READY task waiting for dispatch.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub enqueued_at: Instant,
    tier: usize,
}

/// Ready queue with one FIFO lane per priority tier. Dequeue order is
/// priority tier first, then FIFO within a tier. A task waiting longer
/// than the aging threshold is promoted one tier so low tiers cannot
/// starve indefinitely.
#[derive(Debug)]
pub struct ReadyQueue {
    tiers: Vec<VecDeque<QueuedTask>>,
    aging_threshold: Duration,
}

impl ReadyQueue {
    pub fn new(aging_threshold: Duration) -> Self {
        Self {
            tiers: (0..Priority::TIERS).map(|_| VecDeque::new()).collect(),
            aging_threshold,
        }
    }

    pub fn push(&mut self, task_id: TaskId, job_id: JobId, priority: Priority) {
        let tier = priority.tier();
        self.tiers[tier].push_back(QueuedTask {
            task_id,
            job_id,
            enqueued_at: Instant::now(),
            tier,
        });
    }

    /// Queue at the front of the priority tier, ahead of FIFO order. Used
    /// for tasks returning from a lost lease so they keep their place.
    pub fn push_front(&mut self, task_id: TaskId, job_id: JobId, priority: Priority) {
        let tier = priority.tier();
        self.tiers[tier].push_front(QueuedTask {
            task_id,
            job_id,
            enqueued_at: Instant::now(),
            tier,
        });
    }

    /// Re-queue at the front of the original tier, keeping the original
    /// enqueue time so aging still counts the full wait.
    pub fn restore_front(&mut self, entry: QueuedTask) {
        let tier = entry.tier.min(Priority::TIERS - 1);
        self.tiers[tier].push_front(entry);
    }

    /// Pop the highest-priority entry, FIFO within its tier.
    pub fn pop(&mut self) -> Option<QueuedTask> {
        self.tiers.iter_mut().find_map(|tier| tier.pop_front())
    }

    /// Promote entries that waited past the aging threshold one tier up.
    /// Returns how many were promoted.
    pub fn promote_aged(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        for tier in (1..Priority::TIERS).rev() {
            let mut kept = VecDeque::new();
            while let Some(mut entry) = self.tiers[tier].pop_front() {
                if now.saturating_duration_since(entry.enqueued_at) >= self.aging_threshold {
                    entry.tier = tier - 1;
                    entry.enqueued_at = now;
                    self.tiers[tier - 1].push_back(entry);
                    promoted += 1;
                } else {
                    kept.push_back(entry);
                }
            }
            self.tiers[tier] = kept;
        }
        promoted
    }

    /// Drop all queued entries of one job (cancellation, fail-fast abort).
    pub fn remove_job(&mut self, job_id: JobId) -> usize {
        let mut removed = 0;
        for tier in &mut self.tiers {
            let before = tier.len();
            tier.retain(|entry| entry.job_id != job_id);
            removed += before - tier.len();
        }
        removed
    }

    pub fn depth(&self) -> usize {
        self.tiers.iter().map(|tier| tier.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(|tier| tier.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn pops_by_priority_then_fifo() {
        let mut queue = ReadyQueue::new(Duration::from_secs(10));
        let job = Uuid::new_v4();
        let low = Uuid::new_v4();
        let normal_a = Uuid::new_v4();
        let normal_b = Uuid::new_v4();
        let urgent = Uuid::new_v4();

        queue.push(low, job, Priority::Low);
        queue.push(normal_a, job, Priority::Normal);
        queue.push(normal_b, job, Priority::Normal);
        queue.push(urgent, job, Priority::Urgent);

        assert_eq!(queue.pop().unwrap().task_id, urgent);
        assert_eq!(queue.pop().unwrap().task_id, normal_a);
        assert_eq!(queue.pop().unwrap().task_id, normal_b);
        assert_eq!(queue.pop().unwrap().task_id, low);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn restore_front_preserves_order() {
        let mut queue = ReadyQueue::new(Duration::from_secs(10));
        let job = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        queue.push(first, job, Priority::Normal);
        queue.push(second, job, Priority::Normal);

        let popped = queue.pop().unwrap();
        assert_eq!(popped.task_id, first);
        queue.restore_front(popped);
        assert_eq!(queue.pop().unwrap().task_id, first);
        assert_eq!(queue.pop().unwrap().task_id, second);
    }

    #[test]
    fn push_front_jumps_the_fifo_line() {
        let mut queue = ReadyQueue::new(Duration::from_secs(10));
        let job = Uuid::new_v4();
        let waiting = Uuid::new_v4();
        let returned = Uuid::new_v4();
        queue.push(waiting, job, Priority::Normal);
        queue.push_front(returned, job, Priority::Normal);

        assert_eq!(queue.pop().unwrap().task_id, returned);
        assert_eq!(queue.pop().unwrap().task_id, waiting);
    }

    #[test]
    fn aged_entries_move_up_one_tier() {
        let mut queue = ReadyQueue::new(Duration::from_millis(50));
        let job = Uuid::new_v4();
        let slow = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        queue.push(slow, job, Priority::Low);

        let later = Instant::now() + Duration::from_millis(100);
        assert_eq!(queue.promote_aged(later), 1);
        queue.push(fresh, job, Priority::Normal);

        // The aged LOW entry now sits in the NORMAL tier ahead of nothing,
        // but behind entries already there at promote time.
        assert_eq!(queue.pop().unwrap().task_id, slow);
        assert_eq!(queue.pop().unwrap().task_id, fresh);
    }

    #[test]
    fn remove_job_clears_only_that_job() {
        let mut queue = ReadyQueue::new(Duration::from_secs(10));
        let doomed = Uuid::new_v4();
        let kept = Uuid::new_v4();
        queue.push(Uuid::new_v4(), doomed, Priority::Normal);
        queue.push(Uuid::new_v4(), doomed, Priority::High);
        queue.push(Uuid::new_v4(), kept, Priority::Normal);

        assert_eq!(queue.remove_job(doomed), 2);
        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.pop().unwrap().job_id, kept);
    }
}
