use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::fetcher::PageFetcher;
use super::links;
use super::scope::HostScope;
use super::task::CrawlTask;
use crate::error::{CrawlError, Result};
use crate::queue::{EnqueueOptions, QueueError, TaskHandler, TaskQueue};
use crate::storage::documents::{DocumentStore, NewDocument};
use crate::utils::metrics::MetricsCollector;

/// What one successful task did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub document_id: String,
    pub bytes: usize,

    /// Candidate links found in the body
    pub discovered: usize,

    /// Candidates dropped as unparseable or out of scope
    pub rejected: usize,

    pub enqueued: usize,
    pub enqueue_failures: usize,
}

/// Executes crawl tasks: fetch, persist, discover, fan out
pub struct CrawlProcessor {
    fetcher: PageFetcher,
    store: Arc<dyn DocumentStore>,
    queue: Arc<dyn TaskQueue>,

    /// Lane and retry allowance given to every child task
    child_options: EnqueueOptions,

    metrics: MetricsCollector,
}

impl CrawlProcessor {
    pub fn new(
        fetcher: PageFetcher,
        store: Arc<dyn DocumentStore>,
        queue: Arc<dyn TaskQueue>,
        child_options: EnqueueOptions,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            fetcher,
            store,
            queue,
            child_options,
            metrics,
        }
    }

    /// Process one delivery of `task`
    ///
    /// The document is persisted before any child task is enqueued. Child
    /// submission is best-effort and never fails the task.
    pub async fn process(&self, task: &CrawlTask) -> Result<ProcessReport> {
        let url = task.url.as_str();
        let depth = task.depth;

        info!(url, depth, "received new url to parse");

        let scope = HostScope::from_url(&task.url).map_err(|e| {
            error!(url, depth, error = %e, "wrong url");
            e
        })?;

        let page = self.fetcher.fetch(&task.url).await.map_err(|e| {
            match e {
                CrawlError::UnsupportedContentType { ref content_type, .. } => {
                    error!(url, depth, content_type = %content_type, "not html")
                }
                _ => error!(url, depth, error = %e, "failed to get page"),
            }
            e
        })?;
        debug!(
            url,
            depth,
            status = page.status,
            content_type = %page.content_type,
            bytes = page.body.len(),
            "fetched page"
        );
        self.metrics.record_page(page.body.len()).await;

        let document = NewDocument {
            url: url.to_string(),
            html: String::from_utf8_lossy(&page.body).into_owned(),
            created_at: Utc::now(),
        };

        let document_id = self.store.insert_document(&document).await.map_err(|source| {
            error!(url, depth, error = %source, "failed to insert document");
            CrawlError::Persistence {
                url: url.to_string(),
                source,
            }
        })?;
        self.metrics.record_document().await;

        let mut report = ProcessReport {
            document_id,
            bytes: page.body.len(),
            ..Default::default()
        };

        if task.is_leaf() {
            info!(url, depth, "finished processing leaf url");
            return Ok(report);
        }

        let mut children = Vec::new();
        for candidate in links::extract(&page.body) {
            report.discovered += 1;

            match scope.normalize(&candidate) {
                Some(link) => children.extend(task.child(link)),
                None => {
                    report.rejected += 1;
                    debug!(url, depth, "dropped link {:?}", candidate);
                }
            }
        }

        info!(url, depth, count = children.len(), "invoking urls");

        for child in children {
            match self.submit(&child).await {
                Ok(()) => report.enqueued += 1,
                Err(e) => {
                    report.enqueue_failures += 1;
                    warn!(url, depth, error = %e, "skipping child task");
                }
            }
        }

        self.metrics
            .record_fan_out(report.enqueued, report.enqueue_failures, report.rejected)
            .await;

        info!(url, depth, "finished processing node url");

        Ok(report)
    }

    async fn submit(&self, child: &CrawlTask) -> Result<()> {
        let enqueue = async {
            let payload = child.to_payload()?;
            self.queue.enqueue(CrawlTask::KIND, payload, self.child_options).await?;
            Ok::<_, QueueError>(())
        };

        enqueue.await.map_err(|source| CrawlError::ChildEnqueue {
            url: child.url.to_string(),
            source,
        })
    }
}

#[async_trait]
impl TaskHandler for CrawlProcessor {
    async fn handle(&self, payload: &str) -> Result<()> {
        let task = CrawlTask::from_payload(payload).map_err(|e| {
            error!(error = %e, "failed to decode task payload");
            e
        })?;

        self.process(&task).await.map(|_| ())
    }
}
