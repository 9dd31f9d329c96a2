use std::net::SocketAddr;

/// Retry policy for tasks that fail with a transient error.
///
/// Delay before attempt `n+1` is `backoff_base_ms * 2^(n-1)` plus up to
/// 20% jitter, capped at `backoff_cap_ms`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum execution attempts per task, including the first.
    pub max_attempts: u32,
    /// Base retry backoff in milliseconds.
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay.
    pub backoff_cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 250,
            backoff_cap_ms: 10_000,
        }
    }
}

/// Lease and leadership timing.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Task lease TTL. A lease not renewed within this window expires and
    /// the task is reassigned.
    pub ttl_ms: u64,
    /// Leadership lock TTL for coordinator replicas.
    pub election_ttl_ms: u64,
    /// Minimum delay before a follower retries acquiring leadership.
    pub election_retry_min_ms: u64,
    /// Maximum delay before a follower retries acquiring leadership.
    pub election_retry_max_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5_000,
            election_ttl_ms: 3_000,
            election_retry_min_ms: 150,
            election_retry_max_ms: 300,
        }
    }
}

/// Worker liveness thresholds.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Expected heartbeat interval for workers.
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before a worker is UNREACHABLE and
    /// its leases are revoked. One miss already marks it DEGRADED.
    pub unreachable_after_misses: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 500,
            unreachable_after_misses: 4,
        }
    }
}

/// Per-source circuit breaker thresholds.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive task failures against one source before the breaker opens.
    pub failure_threshold: u32,
    /// How long an open breaker holds dispatch before allowing a probe.
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 15_000,
        }
    }
}

/// Auto-scaler policy. Scaling decisions are clamped to
/// `[min_workers, max_workers]` and rate-limited by `cooldown_ms`.
#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    /// Utilization below this for a full cooldown requests scale-down.
    pub target_low: f64,
    /// Utilization above this for a full cooldown requests scale-up.
    pub target_high: f64,
    pub min_workers: u32,
    pub max_workers: u32,
    /// Workers added or removed per scaling action.
    pub step: u32,
    /// Minimum time between scaling actions, and the time a band breach
    /// must persist before acting on it.
    pub cooldown_ms: u64,
    /// Utilization sampling interval.
    pub sample_interval_ms: u64,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            target_low: 0.25,
            target_high: 0.80,
            min_workers: 1,
            max_workers: 8,
            step: 1,
            cooldown_ms: 30_000,
            sample_interval_ms: 1_000,
        }
    }
}

impl ScalingPolicy {
    /// Worker count the policy wants given current utilization, or `None`
    /// when utilization sits inside the target band. Never leaves
    /// `[min_workers, max_workers]`.
    pub fn desired_workers(&self, current: u32, utilization: f64) -> Option<u32> {
        let clamped = current.clamp(self.min_workers, self.max_workers);
        let target = if utilization > self.target_high {
            clamped.saturating_add(self.step).min(self.max_workers)
        } else if utilization < self.target_low {
            clamped.saturating_sub(self.step).max(self.min_workers)
        } else {
            return None;
        };
        if target == current {
            None
        } else {
            Some(target)
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Replica id of this coordinator within its deployment.
    pub replica_id: u64,
    /// HTTP listen address for the scan API.
    pub listen_addr: SocketAddr,
    /// Workers spawned at startup.
    pub initial_workers: u32,
    /// Execution slots per worker.
    pub slots_per_worker: u32,
    /// Optional global ceiling on reserved slots across all workers.
    pub global_slot_ceiling: Option<u32>,
    /// Scheduling tick interval.
    pub scheduler_tick_ms: u64,
    /// Deadline applied to a task execution when the job carries none.
    pub default_task_deadline_ms: u64,
    /// A READY task older than this is promoted one priority tier.
    pub aging_threshold_ms: u64,
    /// Grace window for RUNNING tasks during shutdown drain.
    pub drain_grace_ms: u64,
    pub retry: RetryConfig,
    pub lease: LeaseConfig,
    pub health: HealthConfig,
    pub breaker: BreakerConfig,
    pub scaling: ScalingPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            replica_id: 1,
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:7070"
                .parse()
                .expect("default listen address is valid"),
            initial_workers: 2,
            slots_per_worker: 4,
            global_slot_ceiling: None,
            scheduler_tick_ms: 50,
            default_task_deadline_ms: 30_000,
            aging_threshold_ms: 10_000,
            drain_grace_ms: 5_000,
            retry: RetryConfig::default(),
            lease: LeaseConfig::default(),
            health: HealthConfig::default(),
            breaker: BreakerConfig::default(),
            scaling: ScalingPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(replica_id: u64, listen_addr: SocketAddr) -> Self {
        Self {
            replica_id,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, workers: u32, slots_per_worker: u32) -> Self {
        self.initial_workers = workers;
        self.slots_per_worker = slots_per_worker;
        self
    }

    pub fn with_lease_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.lease.ttl_ms = ttl_ms;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_default() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.replica_id, 1);
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:7070");
        assert_eq!(cfg.initial_workers, 2);
        assert_eq!(cfg.slots_per_worker, 4);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.lease.ttl_ms, 5_000);
        assert_eq!(cfg.health.unreachable_after_misses, 4);
    }

    #[test]
    fn engine_config_builders() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = EngineConfig::new(7, addr)
            .with_workers(3, 2)
            .with_lease_ttl_ms(750)
            .with_max_attempts(5);
        assert_eq!(cfg.replica_id, 7);
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.initial_workers, 3);
        assert_eq!(cfg.slots_per_worker, 2);
        assert_eq!(cfg.lease.ttl_ms, 750);
        assert_eq!(cfg.retry.max_attempts, 5);
    }

    #[test]
    fn desired_workers_scales_up_within_max() {
        let policy = ScalingPolicy {
            min_workers: 1,
            max_workers: 4,
            step: 1,
            ..Default::default()
        };
        assert_eq!(policy.desired_workers(2, 0.95), Some(3));
        assert_eq!(policy.desired_workers(4, 0.95), None);
    }

    #[test]
    fn desired_workers_scales_down_within_min() {
        let policy = ScalingPolicy {
            min_workers: 2,
            max_workers: 8,
            step: 1,
            ..Default::default()
        };
        assert_eq!(policy.desired_workers(3, 0.05), Some(2));
        assert_eq!(policy.desired_workers(2, 0.0), None);
    }

    #[test]
    fn desired_workers_holds_inside_band() {
        let policy = ScalingPolicy::default();
        assert_eq!(policy.desired_workers(4, 0.5), None);
    }

    #[test]
    fn desired_workers_never_leaves_bounds_under_extreme_load() {
        let policy = ScalingPolicy {
            min_workers: 2,
            max_workers: 5,
            step: 100,
            ..Default::default()
        };
        assert_eq!(policy.desired_workers(3, f64::MAX), Some(5));
        assert_eq!(policy.desired_workers(3, 0.0), Some(2));
        // Current count outside the band is pulled back inside it.
        assert_eq!(policy.desired_workers(50, f64::MAX), Some(5));
    }
}
