use url::Url;
use tracing::debug;

use crate::error::{CrawlError, Result};

/// Same-host boundary for every task descending from one seed URL
///
/// Relative references resolve against `base` (the page being processed);
/// only results on the scope's host and port are admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostScope {
    /// URL that relative references are resolved against
    base: Url,

    /// Lowercased host every admitted URL must carry
    host: String,

    /// Explicit port, if any (default ports are `None`)
    port: Option<u16>,
}

impl HostScope {
    /// Derive the scope from a page URL
    pub fn from_url(url: &Url) -> Result<Self> {
        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_lowercase(),
            _ => {
                return Err(CrawlError::InvalidUrl {
                    url: url.to_string(),
                    reason: "url has no host".to_string(),
                })
            }
        };

        Ok(Self {
            base: url.clone(),
            host,
            port: url.port(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether an absolute URL falls inside this scope
    pub fn contains(&self, url: &Url) -> bool {
        url.host_str()
            .map_or(false, |host| host.eq_ignore_ascii_case(&self.host))
            && url.port() == self.port
    }

    /// Resolve a discovered reference into an absolute in-scope URL
    ///
    /// Returns `None` for anything unparseable, off-host, non-http(s),
    /// empty, or fragment-only. Fragments are dropped from the result.
    pub fn normalize(&self, candidate: &str) -> Option<Url> {
        let candidate = candidate.trim();
        if candidate.is_empty() || candidate.starts_with('#') {
            return None;
        }

        let mut resolved = match self.base.join(candidate) {
            Ok(url) => url,
            Err(e) => {
                debug!("Skipping unparseable link {:?}: {}", candidate, e);
                return None;
            }
        };

        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            debug!("Skipping non-http link: {}", resolved);
            return None;
        }

        if !self.contains(&resolved) {
            debug!("Skipping link outside {}: {}", self.host, resolved);
            return None;
        }

        resolved.set_fragment(None);

        Some(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(url: &str) -> HostScope {
        HostScope::from_url(&Url::parse(url).unwrap()).unwrap()
    }

    #[test]
    fn test_relative_link_inherits_scheme_and_host() {
        let scope = scope("https://a.example/");

        assert_eq!(
            scope.normalize("/x").map(String::from),
            Some("https://a.example/x".to_string())
        );
    }

    #[test]
    fn test_other_host_is_rejected() {
        let scope = scope("https://a.example/");

        assert_eq!(scope.normalize("https://b.example/x"), None);
        assert_eq!(scope.normalize("//b.example/x"), None);
        assert_eq!(scope.normalize("https://sub.a.example/x"), None);
    }

    #[test]
    fn test_same_host_absolute_link_is_kept() {
        let scope = scope("https://realpython.com/");

        assert_eq!(
            scope.normalize("https://realpython.com/examples").map(String::from),
            Some("https://realpython.com/examples".to_string())
        );
        assert_eq!(
            scope.normalize("https://REALPYTHON.com/Examples").map(String::from),
            Some("https://realpython.com/Examples".to_string())
        );
    }

    #[test]
    fn test_scheme_may_differ_but_port_may_not() {
        let scope = scope("https://a.example/");

        assert_eq!(
            scope.normalize("http://a.example/plain").map(String::from),
            Some("http://a.example/plain".to_string())
        );
        assert_eq!(scope.normalize("https://a.example:8443/x"), None);

        let with_port = self::scope("http://127.0.0.1:8080/");
        assert!(with_port.normalize("/ok").is_some());
        assert_eq!(with_port.normalize("http://127.0.0.1:9090/no"), None);
    }

    #[test]
    fn test_relative_path_resolves_against_page() {
        let scope = scope("https://a.example/docs/intro");

        assert_eq!(
            scope.normalize("setup").map(String::from),
            Some("https://a.example/docs/setup".to_string())
        );
        assert_eq!(
            scope.normalize("../about#team").map(String::from),
            Some("https://a.example/about".to_string())
        );
    }

    #[test]
    fn test_junk_candidates_are_rejected() {
        let scope = scope("https://a.example/");

        for candidate in ["", "  ", "#top", "mailto:me@a.example", "javascript:void(0)", "http://[::1"] {
            assert_eq!(scope.normalize(candidate), None, "candidate {:?}", candidate);
        }
    }

    #[test]
    fn test_scope_requires_host() {
        let url = Url::parse("data:text/plain,hello").unwrap();
        assert!(HostScope::from_url(&url).is_err());
    }
}
