//! Work queue model shared by the Redis and in-memory backends
//!
//! A task moves `Enqueued -> Leased -> {Succeeded | Retrying | Dead}`.
//! Handlers only report success or a typed failure; retry counting,
//! backoff and dead-lettering live here.

pub mod lanes;
pub mod memory;
pub mod registry;
pub mod retry;
pub mod worker;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use thiserror::Error;
use uuid::Uuid;

pub use lanes::LaneWeights;
pub use memory::MemoryQueue;
pub use registry::{HandlerRegistry, TaskHandler};
pub use retry::{BackoffSettings, RetryDecision, RetryPolicy};
pub use worker::WorkerPool;

/// Errors raised by queue backends and handler registration
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to encode task envelope: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt envelope for task {id}: {reason}")]
    CorruptEnvelope { id: String, reason: String },

    #[error("unknown task kind: {0}")]
    UnknownTaskKind(String),

    #[error("a handler is already registered for {0}")]
    DuplicateHandler(TaskKind),
}

/// Closed set of task kinds the queue can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    #[serde(rename = "crawler:loadUrl")]
    LoadUrl,
}

impl TaskKind {
    pub const ALL: [TaskKind; 1] = [TaskKind::LoadUrl];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::LoadUrl => "crawler:loadUrl",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| QueueError::UnknownTaskKind(s.to_string()))
    }
}

/// Priority lane, listed from most to least urgent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Critical,
    #[default]
    Default,
    Low,
}

impl Lane {
    /// All lanes in priority order
    pub const ALL: [Lane; 3] = [Lane::Critical, Lane::Default, Lane::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Critical => "critical",
            Lane::Default => "default",
            Lane::Low => "low",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lane {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Lane::ALL
            .into_iter()
            .find(|lane| lane.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown lane '{}' (expected critical, default or low)", s))
    }
}

/// Per-submission delivery options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub lane: Lane,
    pub retry: RetryPolicy,
}

/// Receipt for an enqueued task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub id: Uuid,
    pub kind: TaskKind,
    pub lane: Lane,
}

/// Stored record of one task instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub kind: TaskKind,

    /// Kind-specific JSON payload
    pub payload: String,

    pub lane: Lane,
    pub retry: RetryPolicy,

    /// Failed attempts so far
    pub failures: u32,

    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(kind: TaskKind, payload: String, options: EnqueueOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            lane: options.lane,
            retry: options.retry,
            failures: 0,
            last_error: None,
            enqueued_at: Utc::now(),
        }
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            id: self.id,
            kind: self.kind,
            lane: self.lane,
        }
    }

    /// Record a failed attempt
    pub(crate) fn record_failure(&mut self, error: &str) {
        self.failures = self.failures.saturating_add(1);
        self.last_error = Some(error.to_string());
    }
}

/// A worker's exclusive claim on one task instance
#[derive(Debug, Clone)]
pub struct Lease {
    pub envelope: TaskEnvelope,

    /// After this instant the queue may reclaim the task
    pub deadline: DateTime<Utc>,

    /// Identifies this lease among every lease ever taken on the task
    pub token: Uuid,
}

impl Lease {
    /// 1-based attempt number of this lease
    pub fn attempt(&self) -> u32 {
        self.envelope.failures.saturating_add(1)
    }
}

/// What the queue did with a failed lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { failures: u32, retry_at: DateTime<Utc> },
    Dead { failures: u32 },

    /// The lease had already expired and been reclaimed
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Retries whose backoff elapsed and went back to their lane
    pub promoted: usize,

    /// Expired leases settled as failed attempts
    pub reclaimed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneStats {
    pub lane: Lane,
    pub ready: usize,
    pub retrying: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub lanes: Vec<LaneStats>,
    pub leased: usize,
    pub dead: usize,
}

impl QueueStats {
    /// Tasks that will still be delivered
    pub fn outstanding(&self) -> usize {
        self.leased + self.lanes.iter().map(|l| l.ready + l.retrying).sum::<usize>()
    }
}

/// Submission side of the queue
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, kind: TaskKind, payload: String, options: EnqueueOptions) -> Result<TaskHandle, QueueError>;
}

/// Delivery side of the queue, used by the worker pool
#[async_trait]
pub trait TaskBroker: TaskQueue {
    /// Lease the next ready task, honouring lane weights
    async fn lease(&self) -> Result<Option<Lease>, QueueError>;

    /// Settle a lease as succeeded; `false` if it had already been reclaimed
    async fn ack(&self, lease: &Lease) -> Result<bool, QueueError>;

    /// Settle a lease as failed and schedule a retry or dead-letter it
    async fn fail(&self, lease: &Lease, error: &str, retriable: bool) -> Result<FailureOutcome, QueueError>;

    /// Promote due retries and reclaim expired leases
    async fn run_maintenance(&self) -> Result<MaintenanceReport, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_kind_names() {
        assert_eq!("crawler:loadUrl".parse::<TaskKind>().unwrap(), TaskKind::LoadUrl);
        assert!(matches!(
            "crawler:unknown".parse::<TaskKind>(),
            Err(QueueError::UnknownTaskKind(name)) if name == "crawler:unknown"
        ));
        assert_eq!(serde_json::to_string(&TaskKind::LoadUrl).unwrap(), "\"crawler:loadUrl\"");
    }

    #[test]
    fn test_lane_parsing() {
        assert_eq!("critical".parse::<Lane>().unwrap(), Lane::Critical);
        assert_eq!("LOW".parse::<Lane>().unwrap(), Lane::Low);
        assert!("urgent".parse::<Lane>().is_err());
        assert_eq!(Lane::default(), Lane::Default);
    }

    #[test]
    fn test_envelope_serialization_keeps_bookkeeping() {
        let mut envelope = TaskEnvelope::new(
            TaskKind::LoadUrl,
            r#"{"url":"https://example.com/","depth":1}"#.to_string(),
            EnqueueOptions { lane: Lane::Low, retry: RetryPolicy::max(3) },
        );
        envelope.record_failure("connection reset");

        let json = serde_json::to_string(&envelope).unwrap();
        let decoded: TaskEnvelope = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.failures, 1);
        assert_eq!(decoded.last_error.as_deref(), Some("connection reset"));
    }
}
