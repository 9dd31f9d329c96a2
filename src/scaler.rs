//! Auto-scaler: samples utilization and queue depth, and issues advisory
//! scaling requests to the provisioning capability when the load sits
//! outside the policy band for a full cooldown. It decides when and by
//! how much; how capacity is provisioned belongs to the provisioner.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::ScalingPolicy;
use crate::engine::EngineHandle;
use crate::error::Result;

/// Provisioning capability: receives scale-up/scale-down requests.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn scale_to(&self, target_workers: u32) -> Result<()>;
}

pub struct AutoScaler {
    policy: ScalingPolicy,
    provisioner: Arc<dyn Provisioner>,
    handle: EngineHandle,
    last_action: Option<Instant>,
    breach_since: Option<Instant>,
}

impl AutoScaler {
    pub fn new(
        policy: ScalingPolicy,
        provisioner: Arc<dyn Provisioner>,
        handle: EngineHandle,
    ) -> Self {
        Self {
            policy,
            provisioner,
            handle,
            last_action: None,
            breach_since: None,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.policy.sample_interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sample_and_act().await {
                        tracing::warn!(error = %e, "Scaling sample failed");
                    }
                }
            }
        }
    }

    async fn sample_and_act(&mut self) -> Result<()> {
        let sample = self.handle.load_sample().await?;
        let now = Instant::now();
        let cooldown = Duration::from_millis(self.policy.cooldown_ms);

        let Some(target) = self
            .policy
            .desired_workers(sample.worker_count, sample.utilization)
        else {
            self.breach_since = None;
            return Ok(());
        };

        // The band must be breached for a full cooldown before acting.
        let since = *self.breach_since.get_or_insert(now);
        if now.saturating_duration_since(since) < cooldown {
            return Ok(());
        }
        if let Some(last) = self.last_action {
            if now.saturating_duration_since(last) < cooldown {
                return Ok(());
            }
        }

        tracing::info!(
            current = sample.worker_count,
            target,
            utilization = sample.utilization,
            queue_depth = sample.queue_depth,
            "Requesting worker scaling"
        );
        self.provisioner.scale_to(target).await?;
        self.last_action = Some(now);
        self.breach_since = None;
        Ok(())
    }
}
