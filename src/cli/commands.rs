use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, Context};
use chrono::{TimeZone, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cli::config::CrawlerConfig;
use crate::crawler::{CrawlProcessor, CrawlTask, PageFetcher};
use crate::queue::{
    EnqueueOptions, HandlerRegistry, Lane, MemoryQueue, RetryPolicy, TaskBroker, TaskHandler,
    TaskKind, TaskQueue, WorkerPool,
};
use crate::storage::{DocumentStore, MongoDocumentStore, RedisQueue};
use crate::utils::metrics::MetricsCollector;

/// Stored pages listed per `pages` page
const PAGE_SIZE: u64 = 10;

fn load_config(path: Option<&Path>, concurrency: Option<usize>) -> Result<CrawlerConfig> {
    let mut config = CrawlerConfig::load(path)?;

    if let Some(c) = concurrency {
        config.worker.concurrency = c;
        config.validate()?;
    }

    Ok(config)
}

fn lease_timeout(config: &CrawlerConfig) -> Duration {
    Duration::from_secs(config.worker.lease_timeout_secs)
}

/// Handlers for every task kind the configuration asks for
fn build_registry(
    config: &CrawlerConfig,
    child_options: EnqueueOptions,
    store: Arc<dyn DocumentStore>,
    queue: Arc<dyn TaskQueue>,
    metrics: &MetricsCollector,
) -> Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();

    for name in &config.worker.task_kinds {
        let handler: Arc<dyn TaskHandler> = match name.parse::<TaskKind>()? {
            TaskKind::LoadUrl => {
                let fetcher = PageFetcher::new(&config.crawler).context("Failed to create HTTP client")?;
                Arc::new(CrawlProcessor::new(
                    fetcher,
                    store.clone(),
                    queue.clone(),
                    child_options,
                    metrics.clone(),
                ))
            }
        };

        registry.register(name, handler)?;
    }

    Ok(registry)
}

/// Shutdown channel flipped by Ctrl-C
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (stop, shutdown) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Shutdown requested, finishing leased tasks");
        let _ = stop.send(true);
    });

    shutdown
}

/// Run crawl workers against Redis until interrupted
pub async fn worker(config_path: Option<&Path>, concurrency: Option<usize>) -> Result<()> {
    let config = load_config(config_path, concurrency)?;

    let queue = Arc::new(RedisQueue::new(&config.queue, lease_timeout(&config)).await?);
    let store: Arc<dyn DocumentStore> = Arc::new(MongoDocumentStore::new(&config.storage).await?);
    let metrics = MetricsCollector::new();

    let registry = build_registry(
        &config,
        config.crawler.child_options(),
        store,
        queue.clone(),
        &metrics,
    )?;

    let pool = WorkerPool::new(queue, registry, config.worker.clone(), metrics.clone());
    pool.run(shutdown_on_ctrl_c()).await?;

    info!("Worker metrics:\n{}", metrics.get_metrics().await);

    Ok(())
}

/// Enqueue a root crawl task
pub async fn submit(
    config_path: Option<&Path>,
    url: String,
    depth: u32,
    lane: Lane,
    max_retry: Option<u32>,
) -> Result<()> {
    let config = load_config(config_path, None)?;

    // Reject bad input before touching the queue
    let task = CrawlTask::root(&url, depth)?;

    let queue = RedisQueue::new(&config.queue, lease_timeout(&config)).await?;
    let options = EnqueueOptions {
        lane,
        retry: RetryPolicy::from_setting(max_retry.or(config.queue.submit_max_retry)),
    };

    let handle = queue
        .enqueue(CrawlTask::KIND, task.to_payload()?, options)
        .await
        .context("Failed to submit crawl task")?;

    info!("Submitted {} as task {} on {} lane", task.url, handle.id, handle.lane);
    println!("{}", handle.id);

    Ok(())
}

/// Crawl from `url` in this process using the in-memory queue
pub async fn crawl(
    config_path: Option<&Path>,
    url: String,
    depth: u32,
    concurrency: Option<usize>,
    max_retry: u32,
) -> Result<()> {
    let config = load_config(config_path, concurrency)?;
    let task = CrawlTask::root(&url, depth)?;

    let queue = Arc::new(
        MemoryQueue::new(config.queue.lanes, config.queue.backoff.clone(), lease_timeout(&config))
            .with_dead_letter_limit(config.queue.dead_letter_limit),
    );
    let store: Arc<dyn DocumentStore> = Arc::new(MongoDocumentStore::new(&config.storage).await?);
    let metrics = MetricsCollector::new();

    // Bounded retries so the crawl always drains
    let retry = RetryPolicy::max(max_retry);
    let child_options = EnqueueOptions {
        lane: config.crawler.child_lane,
        retry,
    };

    let registry = build_registry(&config, child_options, store, queue.clone(), &metrics)?;

    queue
        .enqueue(CrawlTask::KIND, task.to_payload()?, EnqueueOptions { lane: Lane::Default, retry })
        .await?;

    let pool = WorkerPool::new(queue.clone(), registry, config.worker.clone(), metrics.clone());
    let (stop, shutdown) = watch::channel(false);
    let poll_interval = Duration::from_millis(config.worker.poll_interval_ms);

    let finished = async {
        tokio::select! {
            _ = wait_until_idle(&queue, poll_interval) => info!("Crawl of {} finished", task.url),
            _ = tokio::signal::ctrl_c() => warn!("Interrupted, finishing leased tasks"),
        }
        let _ = stop.send(true);
    };

    let (result, _) = tokio::join!(pool.run(shutdown), finished);
    result?;

    let dead = queue.dead_letters().await;
    for envelope in &dead {
        warn!(
            "Gave up on {} after {} failures: {}",
            envelope.payload,
            envelope.failures,
            envelope.last_error.as_deref().unwrap_or("unknown error")
        );
    }

    println!("{}", metrics.get_metrics().await);
    if !dead.is_empty() {
        println!("Dead tasks: {}", dead.len());
    }

    Ok(())
}

async fn wait_until_idle(queue: &MemoryQueue, poll_interval: Duration) {
    loop {
        tokio::time::sleep(poll_interval).await;
        if queue.is_idle().await {
            return;
        }
    }
}

/// Show queue depth per lane
pub async fn status(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path, None)?;
    let queue = RedisQueue::new(&config.queue, lease_timeout(&config)).await?;

    let stats = queue.stats().await.context("Failed to read queue statistics")?;

    println!("Queue: {}", config.queue.key_prefix);
    println!("{:<10} {:>8} {:>10}", "Lane", "Ready", "Retrying");
    for lane in &stats.lanes {
        println!("{:<10} {:>8} {:>10}", lane.lane, lane.ready, lane.retrying);
    }
    println!("Leased: {}", stats.leased);
    println!("Dead: {}", stats.dead);
    println!("Outstanding: {}", stats.outstanding());

    Ok(())
}

fn format_timestamp(secs: i64) -> String {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map(|time| time.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}

/// List stored pages, oldest first
pub async fn pages(config_path: Option<&Path>, page: u64) -> Result<()> {
    let config = load_config(config_path, None)?;
    let store = MongoDocumentStore::new(&config.storage).await?;

    let page = page.max(1);
    let listing = store
        .list_documents(page, PAGE_SIZE)
        .await
        .context("Failed to list stored pages")?;

    let page_count = ((listing.total + PAGE_SIZE - 1) / PAGE_SIZE).max(1);
    println!("Page {} of {} ({} documents)", page, page_count, listing.total);

    for document in &listing.documents {
        println!(
            "{}  {}  {}  {} bytes",
            document.id,
            format_timestamp(document.created_at),
            document.url,
            document.html.len()
        );
    }

    Ok(())
}

/// Show one stored page
pub async fn page(config_path: Option<&Path>, uid: String) -> Result<()> {
    let config = load_config(config_path, None)?;
    let store = MongoDocumentStore::new(&config.storage).await?;

    let document = store
        .find_document(&uid)
        .await
        .context(format!("Failed to look up page {}", uid))?
        .with_context(|| format!("Page not found: {}", uid))?;

    println!("ID: {}", document.id);
    println!("URL: {}", document.url);
    println!("Created: {}", format_timestamp(document.created_at));
    println!();
    println!("{}", document.html);

    Ok(())
}

/// Print the effective configuration
pub fn show_config(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path, None)?;
    print!("{}", config.to_yaml()?);

    Ok(())
}

/// Write the default configuration
pub fn init_config(config_path: Option<&Path>) -> Result<()> {
    let config = CrawlerConfig::default();

    let path = match config_path {
        Some(path) => {
            config.save_to_file(path)?;
            path.to_path_buf()
        }
        None => config.save_as_default()?,
    };

    println!("Wrote default configuration to {}", path.display());

    Ok(())
}
