use std::sync::{Arc, Mutex};

use rand::Rng;
use tokio::time::{Duration, Instant};

/// Role of a coordinator replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    Follower,
    Leader,
}

impl std::fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaRole::Follower => write!(f, "follower"),
            ReplicaRole::Leader => write!(f, "leader"),
        }
    }
}

#[derive(Debug)]
struct LockInner {
    term: u64,
    holder: Option<u64>,
    renewed_at: Instant,
    ttl: Duration,
}

/// Single-writer leadership lock shared by coordinator replicas. The
/// holder must renew within the TTL; a stale holder is superseded by the
/// next replica that acquires, which bumps the term.
#[derive(Debug, Clone)]
pub struct ElectionLock {
    inner: Arc<Mutex<LockInner>>,
}

impl ElectionLock {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LockInner {
                term: 0,
                holder: None,
                renewed_at: Instant::now(),
                ttl,
            })),
        }
    }

    fn try_acquire(&self, replica_id: u64, now: Instant) -> Option<u64> {
        let mut inner = self.inner.lock().expect("election lock poisoned");
        let vacant = match inner.holder {
            None => true,
            Some(holder) => {
                holder == replica_id
                    || now.saturating_duration_since(inner.renewed_at) >= inner.ttl
            }
        };
        if !vacant {
            return None;
        }
        if inner.holder != Some(replica_id) {
            inner.term += 1;
        }
        inner.holder = Some(replica_id);
        inner.renewed_at = now;
        Some(inner.term)
    }

    fn renew(&self, replica_id: u64, term: u64, now: Instant) -> bool {
        let mut inner = self.inner.lock().expect("election lock poisoned");
        if inner.holder == Some(replica_id) && inner.term == term {
            inner.renewed_at = now;
            true
        } else {
            false
        }
    }

    fn release(&self, replica_id: u64) {
        let mut inner = self.inner.lock().expect("election lock poisoned");
        if inner.holder == Some(replica_id) {
            inner.holder = None;
        }
    }

    /// Current holder, if its lease is still fresh.
    pub fn holder(&self, now: Instant) -> Option<u64> {
        let inner = self.inner.lock().expect("election lock poisoned");
        match inner.holder {
            Some(holder) if now.saturating_duration_since(inner.renewed_at) < inner.ttl => {
                Some(holder)
            }
            _ => None,
        }
    }

    pub fn term(&self) -> u64 {
        self.inner.lock().expect("election lock poisoned").term
    }
}

/// One coordinator replica's view of the election. Followers retry
/// acquisition after a randomized delay so replicas do not stampede the
/// lock in lockstep.
#[derive(Debug)]
pub struct ElectionMember {
    replica_id: u64,
    lock: ElectionLock,
    role: ReplicaRole,
    term: u64,
    next_attempt: Instant,
    retry_min: Duration,
    retry_max: Duration,
}

impl ElectionMember {
    pub fn new(
        replica_id: u64,
        lock: ElectionLock,
        retry_min: Duration,
        retry_max: Duration,
    ) -> Self {
        Self {
            replica_id,
            lock,
            role: ReplicaRole::Follower,
            term: 0,
            next_attempt: Instant::now(),
            retry_min,
            retry_max,
        }
    }

    fn schedule_retry(&mut self, now: Instant) {
        let min = self.retry_min.as_millis() as u64;
        let max = self.retry_max.as_millis().max(self.retry_min.as_millis()) as u64;
        let delay = rand::thread_rng().gen_range(min..=max);
        self.next_attempt = now + Duration::from_millis(delay);
    }

    /// Drive the election forward: leaders renew, followers attempt
    /// acquisition once their retry delay elapses. Returns true when the
    /// role changed.
    pub fn maintain(&mut self, now: Instant) -> bool {
        match self.role {
            ReplicaRole::Leader => {
                if self.lock.renew(self.replica_id, self.term, now) {
                    false
                } else {
                    tracing::warn!(
                        replica_id = self.replica_id,
                        term = self.term,
                        "Leadership superseded, stepping down"
                    );
                    self.role = ReplicaRole::Follower;
                    self.schedule_retry(now);
                    true
                }
            }
            ReplicaRole::Follower => {
                if now < self.next_attempt {
                    return false;
                }
                match self.lock.try_acquire(self.replica_id, now) {
                    Some(term) => {
                        self.role = ReplicaRole::Leader;
                        self.term = term;
                        tracing::info!(
                            replica_id = self.replica_id,
                            term,
                            "Acquired coordination leadership"
                        );
                        true
                    }
                    None => {
                        self.schedule_retry(now);
                        false
                    }
                }
            }
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == ReplicaRole::Leader
    }

    pub fn role(&self) -> ReplicaRole {
        self.role
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn replica_id(&self) -> u64 {
        self.replica_id
    }

    /// Known leader id, fresh-holder only.
    pub fn leader_id(&self, now: Instant) -> Option<u64> {
        self.lock.holder(now)
    }

    pub fn step_down(&mut self, now: Instant) {
        if self.role == ReplicaRole::Leader {
            self.lock.release(self.replica_id);
            self.role = ReplicaRole::Follower;
            self.schedule_retry(now);
        }
    }
}
