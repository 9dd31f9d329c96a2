//! Engine metrics: task counters, load gauges, and a task latency
//! histogram, exported in the Prometheus text format at `GET /metrics`.

use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{Result, ScanError};

pub struct EngineMetrics {
    registry: Registry,
    pub tasks_submitted: IntCounter,
    pub tasks_succeeded: IntCounter,
    pub tasks_failed: IntCounter,
    pub tasks_retried: IntCounter,
    pub queue_depth: IntGauge,
    pub worker_count: IntGauge,
    pub utilization: Gauge,
    pub task_latency_seconds: Histogram,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let tasks_submitted = IntCounter::with_opts(Opts::new(
            "scanflow_tasks_submitted_total",
            "Tasks entered into the scheduler",
        ))
        .map_err(internal)?;
        let tasks_succeeded = IntCounter::with_opts(Opts::new(
            "scanflow_tasks_succeeded_total",
            "Tasks that completed successfully",
        ))
        .map_err(internal)?;
        let tasks_failed = IntCounter::with_opts(Opts::new(
            "scanflow_tasks_failed_total",
            "Tasks that failed terminally",
        ))
        .map_err(internal)?;
        let tasks_retried = IntCounter::with_opts(Opts::new(
            "scanflow_tasks_retried_total",
            "Task retry attempts scheduled",
        ))
        .map_err(internal)?;
        let queue_depth = IntGauge::with_opts(Opts::new(
            "scanflow_ready_queue_depth",
            "Tasks waiting in the ready queue",
        ))
        .map_err(internal)?;
        let worker_count = IntGauge::with_opts(Opts::new(
            "scanflow_worker_count",
            "Registered workers",
        ))
        .map_err(internal)?;
        let utilization = Gauge::with_opts(Opts::new(
            "scanflow_slot_utilization",
            "Fraction of execution slots reserved",
        ))
        .map_err(internal)?;
        let task_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "scanflow_task_latency_seconds",
                "Wall-clock task execution latency",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        )
        .map_err(internal)?;

        for collector in [
            Box::new(tasks_submitted.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(tasks_succeeded.clone()),
            Box::new(tasks_failed.clone()),
            Box::new(tasks_retried.clone()),
            Box::new(queue_depth.clone()),
            Box::new(worker_count.clone()),
            Box::new(utilization.clone()),
            Box::new(task_latency_seconds.clone()),
        ] {
            registry.register(collector).map_err(internal)?;
        }

        Ok(Self {
            registry,
            tasks_submitted,
            tasks_succeeded,
            tasks_failed,
            tasks_retried,
            queue_depth,
            worker_count,
            utilization,
            task_latency_seconds,
        })
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(internal)?;
        String::from_utf8(buffer).map_err(|e| ScanError::Internal(e.to_string()))
    }
}

fn internal(e: prometheus::Error) -> ScanError {
    ScanError::Internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_appear_in_rendered_output() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.tasks_submitted.inc_by(3);
        metrics.queue_depth.set(2);
        metrics.utilization.set(0.5);

        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("scanflow_tasks_submitted_total 3"));
        assert!(rendered.contains("scanflow_ready_queue_depth 2"));
        assert!(rendered.contains("scanflow_slot_utilization 0.5"));
        assert!(rendered.contains("scanflow_task_latency_seconds"));
    }
}
