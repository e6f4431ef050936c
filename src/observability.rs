use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub pipelines: BTreeMap<String, PipelineMetrics>,
    pub steps: BTreeMap<String, StepMetrics>,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct PipelineMetrics {
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub fatal_errors: u64,
    pub rollbacks: u64,
    pub total_duration_ms: f64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StepMetrics {
    pub calls: u64,
    pub failures: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Outcome of one invocation, as far as metrics are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failure,
    Fatal,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn global() -> &'static MetricsCollector {
        static INSTANCE: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);
        &INSTANCE
    }

    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    /// Steps are keyed `pipeline/step`.
    pub fn start_step(&self, pipeline: &str, step: &str) -> StepTimer {
        StepTimer {
            key: format!("{pipeline}/{step}"),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            failed: false,
            recorded: false,
        }
    }

    pub fn record_run(&self, pipeline: &str, outcome: RunOutcome, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            let metrics = guard.pipelines.entry(pipeline.to_string()).or_default();
            metrics.runs += 1;
            match outcome {
                RunOutcome::Success => metrics.successes += 1,
                RunOutcome::Failure => metrics.failures += 1,
                RunOutcome::Fatal => metrics.fatal_errors += 1,
            }
            metrics.total_duration_ms += duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn record_rollback(&self, pipeline: &str) {
        if let Ok(mut guard) = self.inner.lock() {
            guard
                .pipelines
                .entry(pipeline.to_string())
                .or_default()
                .rollbacks += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

pub struct StepTimer {
    key: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    failed: bool,
    recorded: bool,
}

impl StepTimer {
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration = self.started_at.elapsed();
        let duration_ms = duration.as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.steps.entry(self.key.clone()).or_default();
            metrics.calls += 1;
            if self.failed {
                metrics.failures += 1;
            }
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            step = self.key.as_str(),
            duration_ms,
            failed = self.failed,
            "Step duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StepTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    for (pipeline, metrics) in &snapshot.pipelines {
        info!(
            pipeline = pipeline.as_str(),
            runs = metrics.runs,
            successes = metrics.successes,
            failures = metrics.failures,
            fatal_errors = metrics.fatal_errors,
            rollbacks = metrics.rollbacks,
            total_ms = metrics.total_duration_ms,
            "Pipeline metrics summary"
        );
    }
    for (step, metrics) in &snapshot.steps {
        info!(
            step = step.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Step metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP pipeline_runs_total Pipeline invocations by outcome\n");
        output.push_str("# TYPE pipeline_runs_total counter\n");
        for (pipeline, metrics) in &self.pipelines {
            for (outcome, count) in [
                ("success", metrics.successes),
                ("failure", metrics.failures),
                ("fatal", metrics.fatal_errors),
            ] {
                output.push_str(&format!(
                    "pipeline_runs_total{{pipeline=\"{}\",outcome=\"{}\"}} {}\n",
                    pipeline, outcome, count
                ));
            }
        }
        output.push_str("# HELP pipeline_rollbacks_total Compensation passes after fatal errors\n");
        output.push_str("# TYPE pipeline_rollbacks_total counter\n");
        for (pipeline, metrics) in &self.pipelines {
            output.push_str(&format!(
                "pipeline_rollbacks_total{{pipeline=\"{}\"}} {}\n",
                pipeline, metrics.rollbacks
            ));
        }
        output.push_str("# HELP pipeline_duration_seconds_total Accumulated pipeline duration\n");
        output.push_str("# TYPE pipeline_duration_seconds_total counter\n");
        for (pipeline, metrics) in &self.pipelines {
            output.push_str(&format!(
                "pipeline_duration_seconds_total{{pipeline=\"{}\"}} {:.6}\n",
                pipeline,
                metrics.total_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP pipeline_step_calls_total Step invocation count\n");
        output.push_str("# TYPE pipeline_step_calls_total counter\n");
        output.push_str("# HELP pipeline_step_failures_total Steps that halted their pipeline\n");
        output.push_str("# TYPE pipeline_step_failures_total counter\n");
        output.push_str(
            "# HELP pipeline_step_duration_seconds_max Maximum step duration in seconds\n",
        );
        output.push_str("# TYPE pipeline_step_duration_seconds_max gauge\n");
        for (step, metrics) in &self.steps {
            output.push_str(&format!(
                "pipeline_step_calls_total{{step=\"{}\"}} {}\n",
                step, metrics.calls
            ));
            output.push_str(&format!(
                "pipeline_step_failures_total{{step=\"{}\"}} {}\n",
                step, metrics.failures
            ));
            output.push_str(&format!(
                "pipeline_step_duration_seconds_max{{step=\"{}\"}} {:.6}\n",
                step,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_records_on_drop() {
        let collector = MetricsCollector::new();
        {
            let _timer = collector.start_step("archive_channel", "archive");
        }
        {
            let mut timer = collector.start_step("archive_channel", "archive");
            timer.mark_failed();
        }
        let snapshot = collector.snapshot();
        let step = snapshot.steps.get("archive_channel/archive").unwrap();
        assert_eq!(step.calls, 2);
        assert_eq!(step.failures, 1);
    }

    #[test]
    fn prometheus_output_labels_outcomes() {
        let collector = MetricsCollector::new();
        collector.record_run("archive_channel", RunOutcome::Success, Duration::from_millis(2));
        collector.record_run("archive_channel", RunOutcome::Fatal, Duration::from_millis(1));
        collector.record_rollback("archive_channel");
        let prom = collector.snapshot().to_prometheus();
        assert!(prom.contains("pipeline_runs_total{pipeline=\"archive_channel\",outcome=\"success\"} 1"));
        assert!(prom.contains("pipeline_runs_total{pipeline=\"archive_channel\",outcome=\"fatal\"} 1"));
        assert!(prom.contains("pipeline_rollbacks_total{pipeline=\"archive_channel\"} 1"));

        collector.reset();
        assert!(collector.snapshot().pipelines.is_empty());
    }
}
