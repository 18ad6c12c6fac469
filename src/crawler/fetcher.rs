use std::time::Duration;

use reqwest::{Client, header::CONTENT_TYPE};
use tracing::debug;
use url::Url;

use crate::cli::config::CrawlerSettings;
use crate::error::{CrawlError, Result};

/// A fetched page that passed the content-type guard
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Bounded-timeout HTTP GET with a content-type guard
#[derive(Clone)]
pub struct PageFetcher {
    client: Client,
}

impl PageFetcher {
    pub fn new(settings: &CrawlerSettings) -> std::result::Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(Duration::from_secs(settings.fetch_timeout_secs))
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()?;

        Ok(Self { client })
    }

    /// Fetch `url` and return its body if the server declared an HTML document
    ///
    /// Network failures and 5xx responses are [`CrawlError::Fetch`]; any
    /// other status proceeds to the content-type check.
    pub async fn fetch(&self, url: &Url) -> Result<FetchedPage> {
        let fetch_error = |source| CrawlError::Fetch {
            url: url.to_string(),
            source,
        };

        let response = self.client.get(url.clone()).send().await.map_err(fetch_error)?;

        let status = response.status();
        let response = if status.is_server_error() {
            response.error_for_status().map_err(fetch_error)?
        } else {
            response
        };

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if !is_html(&content_type) {
            return Err(CrawlError::UnsupportedContentType {
                url: url.to_string(),
                content_type,
            });
        }

        let body = response.bytes().await.map_err(fetch_error)?.to_vec();
        debug!("Fetched {} ({}, {} bytes)", url, status, body.len());

        Ok(FetchedPage {
            status: status.as_u16(),
            content_type,
            body,
        })
    }
}

/// Whether a declared content type names an HTML document
fn is_html(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("html")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> PageFetcher {
        PageFetcher::new(&CrawlerSettings::default()).unwrap()
    }

    #[test]
    fn test_content_type_guard() {
        assert!(is_html("text/html"));
        assert!(is_html("text/html; charset=utf-8"));
        assert!(is_html("application/xhtml+xml"));
        assert!(is_html("TEXT/HTML"));
        assert!(!is_html("application/json"));
        assert!(!is_html(""));
    }

    #[tokio::test]
    async fn test_fetch_html_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<a href=\"/x\">x</a>", "text/html"))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let page = fetcher().fetch(&url).await.unwrap();

        assert_eq!(page.status, 200);
        assert_eq!(page.content_type, "text/html");
        assert_eq!(page.body, b"<a href=\"/x\">x</a>");
    }

    #[tokio::test]
    async fn test_non_html_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let err = fetcher().fetch(&url).await.unwrap_err();

        assert!(matches!(err, CrawlError::UnsupportedContentType { ref content_type, .. } if content_type == "application/json"));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_server_error_is_retriable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let err = fetcher().fetch(&url).await.unwrap_err();

        assert!(matches!(err, CrawlError::Fetch { .. }));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_client_error_page_is_still_fetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_raw("<h1>gone</h1>", "text/html"))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let page = fetcher().fetch(&url).await.unwrap();

        assert_eq!(page.status, 404);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_fetch_error() {
        // nothing listens on port 9 of localhost
        let url = Url::parse("http://127.0.0.1:9/").unwrap();
        let err = fetcher().fetch(&url).await.unwrap_err();

        assert!(matches!(err, CrawlError::Fetch { .. }));
    }
}
