//! Crawl task errors
use thiserror::Error;

use crate::queue::QueueError;
use crate::storage::documents::StoreError;

/// Failure of one crawl task attempt.
///
/// Only [`CrawlError::is_retriable`] errors are handed back to the queue's
/// retry path; everything else is dead-lettered on first failure.
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("malformed task payload: {0}")]
    MalformedPayload(String),

    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("content-type is not html ({content_type:?}): {url}")]
    UnsupportedContentType { url: String, content_type: String },

    #[error("failed to persist document for {url}: {source}")]
    Persistence {
        url: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to enqueue child task {url}: {source}")]
    ChildEnqueue {
        url: String,
        #[source]
        source: QueueError,
    },
}

impl CrawlError {
    /// Whether another attempt at the same task could succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            CrawlError::Fetch { .. } | CrawlError::Persistence { .. } => true,
            CrawlError::MalformedPayload(_)
            | CrawlError::InvalidUrl { .. }
            | CrawlError::UnsupportedContentType { .. }
            | CrawlError::ChildEnqueue { .. } => false,
        }
    }

    /// Short label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            CrawlError::MalformedPayload(_) => "malformed_payload",
            CrawlError::InvalidUrl { .. } => "invalid_url",
            CrawlError::Fetch { .. } => "fetch",
            CrawlError::UnsupportedContentType { .. } => "unsupported_content_type",
            CrawlError::Persistence { .. } => "persistence",
            CrawlError::ChildEnqueue { .. } => "child_enqueue",
        }
    }
}

pub type Result<T> = std::result::Result<T, CrawlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_errors_are_not_retried() {
        let malformed = CrawlError::MalformedPayload("missing field `url`".to_string());
        assert!(!malformed.is_retriable());

        let not_html = CrawlError::UnsupportedContentType {
            url: "https://example.com/data.json".to_string(),
            content_type: "application/json".to_string(),
        };
        assert!(!not_html.is_retriable());
        assert_eq!(not_html.kind(), "unsupported_content_type");
    }

    #[test]
    fn test_persistence_errors_are_retried() {
        let error = CrawlError::Persistence {
            url: "https://example.com/".to_string(),
            source: StoreError::InvalidId("nope".to_string()),
        };
        assert!(error.is_retriable());
        assert!(error.to_string().contains("https://example.com/"));
    }
}
