use serde::{Serialize, Deserialize};
use url::Url;

use crate::error::{CrawlError, Result};
use crate::queue::TaskKind;

/// Represents a crawling task to be executed
///
/// The wire form is `{"url": "...", "depth": N}`. Producers that emit the
/// capitalised `Url`/`Depth` keys are accepted as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlTask {
    /// Absolute URL to crawl
    #[serde(alias = "Url")]
    pub url: Url,

    /// Remaining link-following hops (0 marks a leaf)
    #[serde(alias = "Depth")]
    pub depth: u32,
}

impl CrawlTask {
    /// Queue task kind handled by the crawl processor
    pub const KIND: TaskKind = TaskKind::LoadUrl;

    /// Build a root task from submitted input
    pub fn root(url: &str, depth: u32) -> Result<Self> {
        let parsed = Url::parse(url.trim()).map_err(|e| CrawlError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        check_crawlable(&parsed).map_err(|reason| CrawlError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        })?;

        Ok(Self { url: parsed, depth })
    }

    /// Child task for a discovered URL, or `None` when this task is a leaf
    pub fn child(&self, url: Url) -> Option<Self> {
        self.depth.checked_sub(1).map(|depth| Self { url, depth })
    }

    pub fn is_leaf(&self) -> bool {
        self.depth == 0
    }

    /// Encode as a queue payload
    pub fn to_payload(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a queue payload
    pub fn from_payload(payload: &str) -> Result<Self> {
        let task: Self = serde_json::from_str(payload)
            .map_err(|e| CrawlError::MalformedPayload(e.to_string()))?;

        check_crawlable(&task.url)
            .map_err(|reason| CrawlError::MalformedPayload(format!("{}: {}", reason, task.url)))?;

        Ok(task)
    }
}

fn check_crawlable(url: &Url) -> std::result::Result<(), &'static str> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err("only http and https urls can be crawled");
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err("url has no host"),
    }
}
