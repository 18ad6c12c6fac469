use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{FailureOutcome, HandlerRegistry, Lease, TaskBroker};
use crate::cli::config::WorkerSettings;
use crate::utils::metrics::MetricsCollector;

/// Fixed-size pool of workers draining a [`TaskBroker`]
pub struct WorkerPool {
    broker: Arc<dyn TaskBroker>,
    registry: Arc<HandlerRegistry>,
    settings: WorkerSettings,
    metrics: MetricsCollector,
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn TaskBroker>,
        registry: HandlerRegistry,
        settings: WorkerSettings,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            broker,
            registry: Arc::new(registry),
            settings,
            metrics,
        }
    }

    /// Run workers and the maintenance loop until `shutdown` flips to true
    ///
    /// Shutdown is observed between leases; a leased task always runs to
    /// completion.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.registry.is_empty() {
            anyhow::bail!("No task handlers registered");
        }

        let poll_interval = Duration::from_millis(self.settings.poll_interval_ms);
        info!(
            "Starting {} workers for {:?}",
            self.settings.concurrency,
            self.registry.kinds()
        );

        let mut tasks = JoinSet::new();

        for id in 0..self.settings.concurrency {
            let worker = Worker {
                id,
                broker: self.broker.clone(),
                registry: self.registry.clone(),
                metrics: self.metrics.clone(),
                poll_interval,
            };
            tasks.spawn(worker.run(shutdown.clone()));
        }

        tasks.spawn(maintenance_loop(
            self.broker.clone(),
            Duration::from_millis(self.settings.maintenance_interval_ms),
            shutdown,
        ));

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Worker task aborted: {}", e);
            }
        }

        info!("All workers stopped");

        Ok(())
    }
}

struct Worker {
    id: usize,
    broker: Arc<dyn TaskBroker>,
    registry: Arc<HandlerRegistry>,
    metrics: MetricsCollector,
    poll_interval: Duration,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!("Worker {} started", self.id);

        while !*shutdown.borrow() {
            match self.broker.lease().await {
                Ok(Some(lease)) => self.execute(lease).await,
                Ok(None) => {
                    if !pause(self.poll_interval, &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    error!("Worker {} failed to lease a task: {}", self.id, e);
                    if !pause(self.poll_interval, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        debug!("Worker {} stopped", self.id);
    }

    async fn execute(&self, lease: Lease) {
        let envelope = &lease.envelope;
        let span = info_span!(
            "task",
            worker = self.id,
            id = %envelope.id,
            kind = %envelope.kind,
            lane = %envelope.lane,
            attempt = lease.attempt(),
        );

        self.metrics.record_lease().await;
        let timer = self.metrics.start_timer();

        let result = match self.registry.get(envelope.kind) {
            Some(handler) => handler
                .handle(&envelope.payload)
                .instrument(span.clone())
                .await
                .map_err(|e| (e.to_string(), e.is_retriable(), e.kind())),
            None => Err((
                format!("no handler registered for {}", envelope.kind),
                false,
                "unhandled_kind",
            )),
        };
        let elapsed = timer.end();

        self.settle(&lease, result, elapsed).instrument(span).await;
    }

    async fn settle(&self, lease: &Lease, result: std::result::Result<(), (String, bool, &'static str)>, elapsed: u64) {
        match result {
            Ok(()) => match self.broker.ack(lease).await {
                Ok(true) => {
                    self.metrics.record_success(elapsed).await;
                    debug!("Task succeeded in {}ms", elapsed);
                }
                Ok(false) => {
                    self.metrics.record_stale().await;
                    warn!("Task succeeded after its lease was reclaimed");
                }
                Err(e) => error!("Failed to acknowledge task: {}", e),
            },
            Err((message, retriable, kind)) => match self.broker.fail(lease, &message, retriable).await {
                Ok(outcome) => {
                    self.metrics.record_failure(kind, outcome, elapsed).await;
                    match outcome {
                        FailureOutcome::Retrying { failures, retry_at } => {
                            warn!("Task failed ({} failures), retrying at {}: {}", failures, retry_at, message)
                        }
                        FailureOutcome::Dead { failures } => {
                            error!("Task dead-lettered after {} failures: {}", failures, message)
                        }
                        FailureOutcome::Stale => warn!("Task failed after its lease was reclaimed: {}", message),
                    }
                }
                Err(e) => error!("Failed to record task failure ({}): {}", message, e),
            },
        }
    }
}

async fn maintenance_loop(broker: Arc<dyn TaskBroker>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        match broker.run_maintenance().await {
            Ok(report) if report.promoted > 0 || report.reclaimed > 0 => {
                debug!(
                    "Queue maintenance promoted {} retries and reclaimed {} expired leases",
                    report.promoted, report.reclaimed
                );
            }
            Ok(_) => {}
            Err(e) => error!("Queue maintenance failed: {}", e),
        }

        if !pause(interval, &mut shutdown).await {
            break;
        }
    }
}

/// Sleep for `duration`; `false` if shutdown was requested meanwhile
async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let changed = tokio::select! {
        _ = sleep(duration) => return true,
        changed = shutdown.changed() => changed,
    };

    changed.is_ok() && !*shutdown.borrow()
}
