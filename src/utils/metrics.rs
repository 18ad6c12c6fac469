use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc};

use crate::queue::FailureOutcome;

/// Crawl metrics collector shared by workers and the processor
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    /// In-memory metrics store
    metrics: Arc<Mutex<Metrics>>,
}

/// Metrics data structure
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    /// Start time of the metrics collection
    pub start_time: DateTime<Utc>,

    /// Leases handed to workers
    pub tasks_leased: usize,

    /// Leases settled as succeeded
    pub tasks_succeeded: usize,

    /// Failed leases scheduled for another attempt
    pub tasks_retried: usize,

    /// Failed leases dead-lettered
    pub tasks_dead: usize,

    /// Settlements that arrived after the lease had been reclaimed
    pub stale_settlements: usize,

    /// Failure counts per error kind
    pub failures_by_kind: HashMap<String, usize>,

    /// Pages that passed the content-type guard
    pub pages_fetched: usize,

    /// Body bytes downloaded
    pub bytes_downloaded: usize,

    /// Documents written to the store
    pub documents_stored: usize,

    /// Child tasks accepted by the queue
    pub children_enqueued: usize,

    /// Child tasks the queue refused
    pub child_enqueue_failures: usize,

    /// Discovered links dropped by the scope filter
    pub links_rejected: usize,

    /// Sum of task durations in milliseconds
    pub task_duration_ms_total: u64,

    /// Slowest task in milliseconds
    pub task_duration_ms_max: u64,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        let metrics = Metrics {
            start_time: Utc::now(),
            ..Default::default()
        };

        Self {
            metrics: Arc::new(Mutex::new(metrics)),
        }
    }

    pub async fn record_lease(&self) {
        self.metrics.lock().await.tasks_leased += 1;
    }

    /// Record a task that completed successfully
    pub async fn record_success(&self, duration_ms: u64) {
        let mut metrics = self.metrics.lock().await;
        metrics.tasks_succeeded += 1;
        metrics.record_duration(duration_ms);
    }

    /// Record a failed task and what the queue did with it
    pub async fn record_failure(&self, error_kind: &str, outcome: FailureOutcome, duration_ms: u64) {
        let mut metrics = self.metrics.lock().await;

        *metrics.failures_by_kind.entry(error_kind.to_string()).or_default() += 1;
        match outcome {
            FailureOutcome::Retrying { .. } => metrics.tasks_retried += 1,
            FailureOutcome::Dead { .. } => metrics.tasks_dead += 1,
            FailureOutcome::Stale => metrics.stale_settlements += 1,
        }
        metrics.record_duration(duration_ms);
    }

    pub async fn record_stale(&self) {
        self.metrics.lock().await.stale_settlements += 1;
    }

    /// Record a fetched page
    pub async fn record_page(&self, bytes: usize) {
        let mut metrics = self.metrics.lock().await;
        metrics.pages_fetched += 1;
        metrics.bytes_downloaded += bytes;
    }

    pub async fn record_document(&self) {
        self.metrics.lock().await.documents_stored += 1;
    }

    /// Record the fan-out of one page
    pub async fn record_fan_out(&self, enqueued: usize, failed: usize, rejected: usize) {
        let mut metrics = self.metrics.lock().await;
        metrics.children_enqueued += enqueued;
        metrics.child_enqueue_failures += failed;
        metrics.links_rejected += rejected;
    }

    /// Start timing a task
    pub fn start_timer(&self) -> RequestTimer {
        RequestTimer {
            start: Instant::now(),
        }
    }

    /// Get all metrics
    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    fn record_duration(&mut self, duration_ms: u64) {
        self.task_duration_ms_total += duration_ms;
        self.task_duration_ms_max = self.task_duration_ms_max.max(duration_ms);
    }

    /// Tasks settled as succeeded or failed
    pub fn tasks_settled(&self) -> usize {
        self.tasks_succeeded + self.tasks_retried + self.tasks_dead
    }

    pub fn mean_task_duration_ms(&self) -> u64 {
        match self.tasks_settled() {
            0 => 0,
            settled => self.task_duration_ms_total / settled as u64,
        }
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elapsed = (Utc::now() - self.start_time).num_seconds().max(0);

        writeln!(f, "Elapsed: {}s", elapsed)?;
        writeln!(
            f,
            "Tasks: {} leased, {} succeeded, {} retried, {} dead",
            self.tasks_leased, self.tasks_succeeded, self.tasks_retried, self.tasks_dead
        )?;
        writeln!(
            f,
            "Pages: {} fetched, {} stored, {} bytes",
            self.pages_fetched, self.documents_stored, self.bytes_downloaded
        )?;
        writeln!(
            f,
            "Links: {} enqueued, {} enqueue failures, {} rejected",
            self.children_enqueued, self.child_enqueue_failures, self.links_rejected
        )?;
        write!(
            f,
            "Task duration: {}ms mean, {}ms max",
            self.mean_task_duration_ms(),
            self.task_duration_ms_max
        )?;

        if !self.failures_by_kind.is_empty() {
            let mut kinds: Vec<_> = self.failures_by_kind.iter().collect();
            kinds.sort();
            write!(f, "\nFailures:")?;
            for (kind, count) in kinds {
                write!(f, " {}={}", kind, count)?;
            }
        }

        Ok(())
    }
}

/// Request timer for measuring task durations
pub struct RequestTimer {
    /// Start time of the task
    start: Instant,
}

impl RequestTimer {
    /// End timing and get the duration in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
