use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::scheduler::job::WorkerId;
use crate::scheduler::orchestrator::EngineCommand;

/// Periodically reports a worker as alive to the coordinator. Worker
/// heartbeats also renew every lease the worker holds.
pub struct HeartbeatSender {
    worker_id: WorkerId,
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(worker_id: WorkerId, interval_ms: u64) -> Self {
        Self {
            worker_id,
            interval: Duration::from_millis(interval_ms.max(1)),
        }
    }

    pub async fn run(&self, tx: mpsc::Sender<EngineCommand>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let heartbeat = EngineCommand::Heartbeat {
                        worker_id: self.worker_id,
                    };
                    if tx.send(heartbeat).await.is_err() {
                        // Coordinator gone, stop sending.
                        break;
                    }
                }
            }
        }
    }
}
