//! Tolerant link discovery over raw response bodies
//!
//! This is a pattern scan, not an HTML parse. Broken markup, unclosed tags
//! and invalid UTF-8 only cost the links they garble.

use std::sync::OnceLock;

use regex::bytes::{Captures, Regex};

/// `href` attribute values (double, single or unquoted) and bare http(s) URLs.
/// ASCII mode so any byte sequence can be scanned.
const LINK_PATTERN: &str = concat!(
    r#"(?i-u)\bhref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'<>`]+))"#,
    r#"|\b(https?://[^\s"'<>`()\[\]{}]+)"#,
);

/// Punctuation that usually ends a sentence rather than a bare URL
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?'];

fn link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(LINK_PATTERN).expect("link pattern is a valid regex"))
}

/// Candidate URL strings in `body`, in order of appearance
///
/// The iterator borrows `body`; call again to restart the scan.
pub fn extract(body: &[u8]) -> impl Iterator<Item = String> + '_ {
    link_pattern()
        .captures_iter(body)
        .filter_map(|captures| candidate(&captures))
}

fn candidate(captures: &Captures<'_>) -> Option<String> {
    let (raw, bare) = if let Some(m) = captures.get(1).or_else(|| captures.get(2)).or_else(|| captures.get(3)) {
        (m.as_bytes(), false)
    } else {
        (captures.get(4)?.as_bytes(), true)
    };

    let text = String::from_utf8_lossy(raw);
    let mut text = text.trim();
    if bare {
        text = text.trim_end_matches(TRAILING_PUNCTUATION);
    }

    if text.is_empty() {
        return None;
    }

    Some(text.replace("&amp;", "&"))
}
