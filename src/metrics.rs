//! Prometheus Metrics
//!
//! Counters for approvals, rejections, retries and memory faults, exposed as
//! Prometheus text via `GET /metrics`.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::RwLock;

use crate::types::CompletionReport;

/// Monotonic counter
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn format(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
            self.name,
            self.help,
            self.name,
            self.name,
            self.get()
        )
    }
}

/// Counter partitioned by a single label
#[derive(Debug)]
pub struct LabeledCounter {
    name: &'static str,
    help: &'static str,
    label: &'static str,
    values: RwLock<BTreeMap<String, u64>>,
}

impl LabeledCounter {
    pub fn new(name: &'static str, help: &'static str, label: &'static str) -> Self {
        Self {
            name,
            help,
            label,
            values: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn inc(&self, value: &str) {
        *self.values.write().await.entry(value.to_string()).or_insert(0) += 1;
    }

    pub async fn get(&self, value: &str) -> u64 {
        self.values.read().await.get(value).copied().unwrap_or(0)
    }

    pub async fn format(&self) -> String {
        let values = self.values.read().await;
        let mut output = format!("# HELP {} {}\n", self.name, self.help);
        output.push_str(&format!("# TYPE {} counter\n", self.name));

        if values.is_empty() {
            output.push_str(&format!("{} 0\n", self.name));
        }
        for (value, count) in values.iter() {
            output.push_str(&format!(
                "{}{{{}=\"{}\"}} {}\n",
                self.name, self.label, value, count
            ));
        }
        output
    }
}

/// Gauge (can go up or down)
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Gauge {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        // Saturating: a stray dec must not wrap to u64::MAX
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn format(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
            self.name,
            self.help,
            self.name,
            self.name,
            self.get()
        )
    }
}

/// Histogram for measuring distributions
#[derive(Debug)]
pub struct Histogram {
    name: &'static str,
    help: &'static str,
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(name: &'static str, help: &'static str, buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            name,
            help,
            buckets,
            counts,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        // Buckets are stored non-cumulative and summed on output
        if let Some(i) = self.buckets.iter().position(|b| value <= *b) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
        self.sum_micros
            .fetch_add((value * 1_000_000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn format(&self) -> String {
        let mut output = format!("# HELP {} {}\n", self.name, self.help);
        output.push_str(&format!("# TYPE {} histogram\n", self.name));

        let mut cumulative = 0u64;
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += self.counts[i].load(Ordering::Relaxed);
            output.push_str(&format!("{}_bucket{{le=\"{}\"}} {}\n", self.name, bucket, cumulative));
        }

        output.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", self.name, self.count()));
        output.push_str(&format!(
            "{}_sum {}\n",
            self.name,
            self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
        ));
        output.push_str(&format!("{}_count {}\n", self.name, self.count()));
        output
    }
}

/// Point-in-time view of the headline counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub approvals: u64,
    pub rejections: u64,
    pub retries: u64,
    pub memory_faults: u64,
    pub backup_recoveries: u64,
    pub alternatives: u64,
    pub tasks_in_flight: u64,
    pub resources_in_use: u64,
    pub tasks_completed: u64,
}

/// Metrics owned by the controller
#[derive(Debug)]
pub struct ControllerMetrics {
    pub approvals: Counter,
    pub rejections: Counter,
    pub retries: Counter,
    pub memory_faults: Counter,
    pub backup_recoveries: Counter,
    pub alternatives: Counter,
    pub deduplicated_actions: Gauge,
    pub tasks_total: LabeledCounter,
    pub errors_total: LabeledCounter,
    pub tasks_in_flight: Gauge,
    pub resources_in_use: Gauge,
    pub task_duration: Histogram,
    start_time: Instant,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self {
            approvals: Counter::new("archmerge_approvals_total", "Strategies approved for dispatch"),
            rejections: Counter::new("archmerge_rejections_total", "Strategies denied approval"),
            retries: Counter::new("archmerge_retries_total", "Action retries after transient errors"),
            memory_faults: Counter::new("archmerge_memory_faults_total", "Memory operations that faulted"),
            backup_recoveries: Counter::new(
                "archmerge_backup_recoveries_total",
                "Contexts served from a backup snapshot",
            ),
            alternatives: Counter::new(
                "archmerge_alternatives_total",
                "Alternative strategies attempted",
            ),
            deduplicated_actions: Gauge::new(
                "archmerge_deduplicated_actions",
                "Actions answered from the idempotency ledger",
            ),
            tasks_total: LabeledCounter::new("archmerge_tasks_total", "Completed tasks by outcome", "outcome"),
            errors_total: LabeledCounter::new("archmerge_errors_total", "Failed tasks by error kind", "kind"),
            tasks_in_flight: Gauge::new("archmerge_tasks_in_flight", "Tasks currently being processed"),
            resources_in_use: Gauge::new("archmerge_resources_in_use", "Approved resource units held"),
            task_duration: Histogram::new(
                "archmerge_task_duration_seconds",
                "Task duration in seconds",
                vec![0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 15.0, 60.0],
            ),
            start_time: Instant::now(),
        }
    }

    /// Record a terminal report
    pub async fn record_report(&self, report: &CompletionReport) {
        self.tasks_total.inc(report.outcome.as_str()).await;
        if let Some(kind) = report.error_kind() {
            self.errors_total.inc(kind.as_str()).await;
        }
        self.retries.inc_by(report.resources_used.retries as u64);
        self.task_duration.observe(report.duration_ms as f64 / 1000.0);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            approvals: self.approvals.get(),
            rejections: self.rejections.get(),
            retries: self.retries.get(),
            memory_faults: self.memory_faults.get(),
            backup_recoveries: self.backup_recoveries.get(),
            alternatives: self.alternatives.get(),
            tasks_in_flight: self.tasks_in_flight.get(),
            resources_in_use: self.resources_in_use.get(),
            tasks_completed: self.task_duration.count(),
        }
    }

    /// Format all metrics for Prometheus
    pub async fn render(&self) -> String {
        let mut output = format!(
            "# HELP archmerge_uptime_seconds Uptime in seconds\n\
             # TYPE archmerge_uptime_seconds gauge\n\
             archmerge_uptime_seconds {}\n\n",
            self.start_time.elapsed().as_secs()
        );

        for counter in [
            &self.approvals,
            &self.rejections,
            &self.retries,
            &self.memory_faults,
            &self.backup_recoveries,
            &self.alternatives,
        ] {
            output.push_str(&counter.format());
            output.push('\n');
        }
        for gauge in [
            &self.tasks_in_flight,
            &self.resources_in_use,
            &self.deduplicated_actions,
        ] {
            output.push_str(&gauge.format());
            output.push('\n');
        }
        output.push_str(&self.tasks_total.format().await);
        output.push('\n');
        output.push_str(&self.errors_total.format().await);
        output.push('\n');
        output.push_str(&self.task_duration.format());

        output
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::types::Outcome;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter", "A test counter");
        counter.inc();
        counter.inc_by(2);
        assert_eq!(counter.get(), 3);
        assert!(counter.format().contains("test_counter 3"));
    }

    #[test]
    fn test_gauge_never_wraps() {
        let gauge = Gauge::new("test_gauge", "A test gauge");
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.set(10);
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 10);
    }

    #[test]
    fn test_histogram() {
        let histogram = Histogram::new("test_hist", "A test histogram", vec![1.0, 5.0, 10.0]);
        histogram.observe(0.5);
        histogram.observe(3.0);
        histogram.observe(7.0);
        histogram.observe(15.0);

        let formatted = histogram.format();
        assert!(formatted.contains("test_hist_bucket{le=\"1\"} 1"));
        assert!(formatted.contains("test_hist_bucket{le=\"10\"} 3"));
        assert!(formatted.contains("test_hist_bucket{le=\"+Inf\"} 4"));
        assert!(formatted.contains("test_hist_count 4"));
    }

    #[tokio::test]
    async fn test_labeled_counter() {
        let counter = LabeledCounter::new("test_outcomes", "Outcomes", "outcome");
        assert!(counter.format().await.contains("test_outcomes 0"));

        counter.inc("success").await;
        counter.inc("success").await;
        counter.inc("failure").await;
        assert_eq!(counter.get("success").await, 2);
        assert!(counter
            .format()
            .await
            .contains("test_outcomes{outcome=\"failure\"} 1"));
    }

    #[tokio::test]
    async fn test_record_report_and_render() {
        let metrics = ControllerMetrics::new();
        metrics.approvals.inc();

        let mut ok = CompletionReport::completed("T1", Outcome::Success, json!({}), Duration::from_millis(20));
        ok.resources_used.retries = 2;
        metrics.record_report(&ok).await;
        metrics
            .record_report(&CompletionReport::failed("T2", &TaskError::Timeout(1), Duration::ZERO))
            .await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.retries, 2);
        assert_eq!(snapshot.tasks_completed, 2);

        let output = metrics.render().await;
        assert!(output.contains("archmerge_approvals_total 1"));
        assert!(output.contains("archmerge_tasks_total{outcome=\"success\"} 1"));
        assert!(output.contains("archmerge_errors_total{kind=\"timeout\"} 1"));
        assert!(output.contains("archmerge_memory_faults_total 0"));
    }
}
