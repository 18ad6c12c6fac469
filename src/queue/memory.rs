//! In-process queue with the same delivery semantics as the Redis backend
//!
//! Used by standalone crawls, where nothing outlives the process anyway.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::cli::config::QueueSettings;

use super::{
    BackoffSettings, EnqueueOptions, FailureOutcome, Lane, LaneStats, LaneWeights, Lease,
    MaintenanceReport, QueueError, QueueStats, RetryDecision, TaskBroker, TaskEnvelope,
    TaskHandle, TaskKind, TaskQueue,
};

#[derive(Debug, Default)]
struct MemoryState {
    /// Envelopes of every live task, keyed by id
    tasks: HashMap<Uuid, TaskEnvelope>,

    /// Ready task ids per lane, oldest at the front
    ready: HashMap<Lane, VecDeque<Uuid>>,

    /// Ids waiting out their backoff, with the instant they become ready
    retrying: Vec<(DateTime<Utc>, Uuid)>,

    /// The current lease of each leased id
    leased: HashMap<Uuid, ActiveLease>,

    /// Dead-lettered envelopes, in order of death
    dead: VecDeque<TaskEnvelope>,
}

#[derive(Debug, Clone, Copy)]
struct ActiveLease {
    token: Uuid,
    deadline: DateTime<Utc>,
}

/// Queue kept entirely in process memory
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
    lanes: LaneWeights,
    backoff: BackoffSettings,
    lease_timeout: Duration,
    dead_letter_limit: usize,
}

impl MemoryQueue {
    pub fn new(lanes: LaneWeights, backoff: BackoffSettings, lease_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            lanes,
            backoff,
            lease_timeout,
            dead_letter_limit: QueueSettings::default().dead_letter_limit,
        }
    }

    /// Keep at most `limit` dead letters, dropping the oldest first
    pub fn with_dead_letter_limit(mut self, limit: usize) -> Self {
        self.dead_letter_limit = limit.max(1);
        self
    }

    /// Nothing ready, leased or waiting to be retried
    pub async fn is_idle(&self) -> bool {
        let state = self.state.lock().await;
        state.leased.is_empty()
            && state.retrying.is_empty()
            && state.ready.values().all(VecDeque::is_empty)
    }

    /// Dead-lettered envelopes, oldest first
    pub async fn dead_letters(&self) -> Vec<TaskEnvelope> {
        self.state.lock().await.dead.iter().cloned().collect()
    }

    /// Ready envelopes of a lane, in delivery order
    pub async fn ready(&self, lane: Lane) -> Vec<TaskEnvelope> {
        let state = self.state.lock().await;
        state
            .ready
            .get(&lane)
            .map(|ids| ids.iter().filter_map(|id| state.tasks.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    fn deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.lease_timeout).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Release the lease of `id` if `token` is still the current one
    fn release(state: &mut MemoryState, id: Uuid, token: Uuid) -> bool {
        match state.leased.get(&id) {
            Some(active) if active.token == token => {
                state.leased.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Settle the lease `token` of `id` as failed; caller holds the lock
    fn settle_failure(
        &self,
        state: &mut MemoryState,
        id: Uuid,
        token: Uuid,
        error: &str,
        retriable: bool,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        if !Self::release(state, id, token) {
            return FailureOutcome::Stale;
        }

        let Some(envelope) = state.tasks.get_mut(&id) else {
            return FailureOutcome::Stale;
        };
        envelope.record_failure(error);
        let failures = envelope.failures;

        let decision = envelope
            .retry
            .decide(failures, retriable, &self.backoff, &mut rand::thread_rng());

        match decision {
            RetryDecision::Retry { delay } => {
                let retry_at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                state.retrying.push((retry_at, id));
                FailureOutcome::Retrying { failures, retry_at }
            }
            RetryDecision::Dead => {
                if let Some(envelope) = state.tasks.remove(&id) {
                    state.dead.push_back(envelope);
                    while state.dead.len() > self.dead_letter_limit {
                        state.dead.pop_front();
                    }
                }
                FailureOutcome::Dead { failures }
            }
        }
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, kind: TaskKind, payload: String, options: EnqueueOptions) -> Result<TaskHandle, QueueError> {
        let envelope = TaskEnvelope::new(kind, payload, options);
        let handle = envelope.handle();

        let mut state = self.state.lock().await;
        state.ready.entry(envelope.lane).or_default().push_back(envelope.id);
        state.tasks.insert(envelope.id, envelope);

        debug!("Enqueued task {} on {} lane", handle.id, handle.lane);

        Ok(handle)
    }
}

#[async_trait]
impl TaskBroker for MemoryQueue {
    async fn lease(&self) -> Result<Option<Lease>, QueueError> {
        let order = self.lanes.pick_order(&mut rand::thread_rng());
        let now = Utc::now();

        let mut state = self.state.lock().await;
        for lane in order {
            let Some(id) = state.ready.get_mut(&lane).and_then(VecDeque::pop_front) else {
                continue;
            };

            let Some(envelope) = state.tasks.get(&id).cloned() else {
                continue;
            };

            let deadline = self.deadline(now);
            let token = Uuid::new_v4();
            state.leased.insert(id, ActiveLease { token, deadline });

            return Ok(Some(Lease { envelope, deadline, token }));
        }

        Ok(None)
    }

    async fn ack(&self, lease: &Lease) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let id = lease.envelope.id;

        if !Self::release(&mut state, id, lease.token) {
            return Ok(false);
        }
        state.tasks.remove(&id);

        Ok(true)
    }

    async fn fail(&self, lease: &Lease, error: &str, retriable: bool) -> Result<FailureOutcome, QueueError> {
        let mut state = self.state.lock().await;
        Ok(self.settle_failure(&mut state, lease.envelope.id, lease.token, error, retriable, Utc::now()))
    }

    async fn run_maintenance(&self) -> Result<MaintenanceReport, QueueError> {
        let now = Utc::now();
        let mut report = MaintenanceReport::default();
        let mut state = self.state.lock().await;

        let expired: Vec<(Uuid, Uuid)> = state
            .leased
            .iter()
            .filter(|(_, active)| active.deadline <= now)
            .map(|(id, active)| (*id, active.token))
            .collect();
        for (id, token) in expired {
            self.settle_failure(&mut state, id, token, "lease expired", true, now);
            report.reclaimed += 1;
        }

        let (due, waiting): (Vec<_>, Vec<_>) = state
            .retrying
            .drain(..)
            .partition(|(retry_at, _)| *retry_at <= now);
        state.retrying = waiting;

        for (_, id) in due {
            let Some(lane) = state.tasks.get(&id).map(|envelope| envelope.lane) else {
                continue;
            };
            state.ready.entry(lane).or_default().push_back(id);
            report.promoted += 1;
        }

        Ok(report)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().await;

        let lanes = Lane::ALL
            .into_iter()
            .map(|lane| LaneStats {
                lane,
                ready: state.ready.get(&lane).map_or(0, VecDeque::len),
                retrying: state
                    .retrying
                    .iter()
                    .filter(|(_, id)| state.tasks.get(id).map_or(false, |e| e.lane == lane))
                    .count(),
            })
            .collect();

        Ok(QueueStats {
            lanes,
            leased: state.leased.len(),
            dead: state.dead.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RetryPolicy;
    use tokio_test::assert_ok;

    fn immediate_backoff() -> BackoffSettings {
        BackoffSettings {
            initial_ms: 0,
            multiplier: 2,
            max_ms: 0,
            jitter: 0.0,
        }
    }

    fn queue() -> MemoryQueue {
        MemoryQueue::new(LaneWeights::default(), immediate_backoff(), Duration::from_secs(60))
    }

    fn options(lane: Lane, retry: RetryPolicy) -> EnqueueOptions {
        EnqueueOptions { lane, retry }
    }

    #[tokio::test]
    async fn test_lease_then_ack_empties_queue() {
        let queue = queue();
        let handle = assert_ok!(queue.enqueue(TaskKind::LoadUrl, "{}".to_string(), EnqueueOptions::default()).await);
        assert!(!queue.is_idle().await);

        let lease = queue.lease().await.unwrap().unwrap();
        assert_eq!(lease.envelope.id, handle.id);
        assert_eq!(lease.attempt(), 1);

        // a leased task is not handed out twice
        assert!(queue.lease().await.unwrap().is_none());

        assert!(queue.ack(&lease).await.unwrap());
        assert!(queue.is_idle().await);
        assert!(!queue.ack(&lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_retriable_failure_is_redelivered() {
        let queue = queue();
        queue.enqueue(TaskKind::LoadUrl, "{}".to_string(), options(Lane::Default, RetryPolicy::unlimited())).await.unwrap();

        let lease = queue.lease().await.unwrap().unwrap();
        let outcome = queue.fail(&lease, "timed out", true).await.unwrap();
        assert!(matches!(outcome, FailureOutcome::Retrying { failures: 1, .. }));
        assert!(queue.lease().await.unwrap().is_none());

        let report = queue.run_maintenance().await.unwrap();
        assert_eq!(report.promoted, 1);

        let retry = queue.lease().await.unwrap().unwrap();
        assert_eq!(retry.envelope.id, lease.envelope.id);
        assert_eq!(retry.attempt(), 2);
        assert_eq!(retry.envelope.last_error.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn test_terminal_failure_is_dead_lettered() {
        let queue = queue();
        queue.enqueue(TaskKind::LoadUrl, "{}".to_string(), options(Lane::Low, RetryPolicy::unlimited())).await.unwrap();

        let lease = queue.lease().await.unwrap().unwrap();
        let outcome = queue.fail(&lease, "content-type is not html", false).await.unwrap();

        assert_eq!(outcome, FailureOutcome::Dead { failures: 1 });
        assert!(queue.is_idle().await);
        assert_eq!(queue.dead_letters().await.len(), 1);
        assert_eq!(queue.stats().await.unwrap().dead, 1);
    }

    #[tokio::test]
    async fn test_retry_ceiling_dead_letters() {
        let queue = queue();
        queue.enqueue(TaskKind::LoadUrl, "{}".to_string(), options(Lane::Default, RetryPolicy::max(1))).await.unwrap();

        let first = queue.lease().await.unwrap().unwrap();
        assert!(matches!(queue.fail(&first, "boom", true).await.unwrap(), FailureOutcome::Retrying { .. }));
        queue.run_maintenance().await.unwrap();

        let second = queue.lease().await.unwrap().unwrap();
        assert_eq!(queue.fail(&second, "boom", true).await.unwrap(), FailureOutcome::Dead { failures: 2 });
        assert!(queue.is_idle().await);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed_once() {
        let queue = MemoryQueue::new(LaneWeights::default(), immediate_backoff(), Duration::ZERO);
        queue.enqueue(TaskKind::LoadUrl, "{}".to_string(), EnqueueOptions::default()).await.unwrap();

        let lease = queue.lease().await.unwrap().unwrap();
        let report = queue.run_maintenance().await.unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.promoted, 1);

        // the original holder can no longer settle it
        assert_eq!(queue.fail(&lease, "late", true).await.unwrap(), FailureOutcome::Stale);
        assert!(!queue.ack(&lease).await.unwrap());

        let again = queue.lease().await.unwrap().unwrap();
        assert_eq!(again.envelope.id, lease.envelope.id);
        assert_eq!(again.envelope.last_error.as_deref(), Some("lease expired"));
    }

    #[tokio::test]
    async fn test_late_settlement_does_not_touch_new_lease() {
        let queue = MemoryQueue::new(LaneWeights::default(), immediate_backoff(), Duration::ZERO);
        queue.enqueue(TaskKind::LoadUrl, "{}".to_string(), EnqueueOptions::default()).await.unwrap();

        let first = queue.lease().await.unwrap().unwrap();
        queue.run_maintenance().await.unwrap();
        let second = queue.lease().await.unwrap().unwrap();
        assert_eq!(second.envelope.id, first.envelope.id);
        assert_ne!(second.token, first.token);

        assert_eq!(queue.fail(&first, "late", true).await.unwrap(), FailureOutcome::Stale);
        assert!(!queue.ack(&first).await.unwrap());

        // the second holder keeps the task
        assert!(queue.lease().await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().leased, 1);

        assert!(queue.ack(&second).await.unwrap());
        assert!(queue.is_idle().await);
    }

    #[tokio::test]
    async fn test_dead_letters_are_capped() {
        let queue = queue().with_dead_letter_limit(2);
        for payload in ["a", "b", "c"] {
            queue.enqueue(TaskKind::LoadUrl, payload.to_string(), EnqueueOptions::default()).await.unwrap();
            let lease = queue.lease().await.unwrap().unwrap();
            queue.fail(&lease, "not html", false).await.unwrap();
        }

        let payloads: Vec<String> = queue.dead_letters().await.into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec!["b", "c"]);
        assert_eq!(queue.stats().await.unwrap().dead, 2);
    }

    #[tokio::test]
    async fn test_empty_lanes_fall_through() {
        let queue = MemoryQueue::new(
            LaneWeights { critical: 1, default: 0, low: 0 },
            immediate_backoff(),
            Duration::from_secs(60),
        );
        queue.enqueue(TaskKind::LoadUrl, "low".to_string(), options(Lane::Low, RetryPolicy::unlimited())).await.unwrap();
        queue.enqueue(TaskKind::LoadUrl, "default".to_string(), options(Lane::Default, RetryPolicy::unlimited())).await.unwrap();

        let first = queue.lease().await.unwrap().unwrap();
        let second = queue.lease().await.unwrap().unwrap();

        assert_eq!(first.envelope.payload, "default");
        assert_eq!(second.envelope.payload, "low");

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.leased, 2);
        assert_eq!(stats.outstanding(), 2);
    }
}
