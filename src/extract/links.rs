//! Link extraction, for mails that carry a verification link instead of a code.

use crate::text::{decode_entities, html_to_text};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;

const MAX_TEXT_CHARS: usize = 100;
const CONTEXT_CHARS: usize = 40;

const VERIFICATION_KEYWORDS: [&str; 11] = [
    "verify",
    "confirm",
    "activate",
    "validation",
    "authentication",
    "signup",
    "register",
    "account",
    "token",
    "reset",
    "password",
];

static ANCHOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a\b[^>]*?\bhref\s*=\s*["']([^"']*)["'][^>]*>(.*?)</a\s*>"#)
        .expect("valid regex")
});

static URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)https?://(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)*[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?(?:\.[a-z]{2,6})+(?::\d+)?(?:/\S*)?",
    )
    .expect("valid regex")
});

/// Where a link was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkSource {
    /// An `<a href>` in the HTML body.
    Html,
    /// A bare URL in the text body.
    Text,
}

/// A link found in a mail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedLink {
    /// The URL.
    pub url: String,
    /// Anchor text, or the text around a bare URL.
    pub text: String,
    /// Where the link was found.
    pub source: LinkSource,
    /// Host part of the URL, with port.
    pub domain: String,
    /// Whether the URL or its text looks like a verification link.
    pub verification: bool,
}

/// Extracts links from a mail, preferring HTML anchors when an HTML body exists.
///
/// Fragment-only and `javascript:` links are skipped, duplicates are dropped
/// and only URLs with a scheme and a host are kept.
///
/// ```
/// use tempmail_sync::extract::extract_links;
///
/// let links = extract_links("Confirm here: https://example.com/verify?t=abc.", None);
/// assert_eq!(links[0].url, "https://example.com/verify?t=abc");
/// assert!(links[0].verification);
/// ```
#[must_use]
pub fn extract_links(text: &str, html: Option<&str>) -> Vec<ExtractedLink> {
    let (found, source) = match html.filter(|h| !h.trim().is_empty()) {
        Some(html) => (links_from_html(html), LinkSource::Html),
        None => (links_from_text(text), LinkSource::Text),
    };

    found
        .into_iter()
        .filter_map(|(url, text)| {
            let domain = domain_of(&url)?.to_string();
            let verification = is_verification_link(&url, &text);
            Some(ExtractedLink {
                url,
                text,
                source,
                domain,
                verification,
            })
        })
        .collect()
}

/// Returns `true` if the URL or its text contains a verification keyword.
#[must_use]
pub fn is_verification_link(url: &str, text: &str) -> bool {
    let url = url.to_lowercase();
    let text = text.to_lowercase();
    VERIFICATION_KEYWORDS
        .iter()
        .any(|keyword| url.contains(keyword) || text.contains(keyword))
}

fn links_from_html(html: &str) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    ANCHOR
        .captures_iter(html)
        .filter_map(|caps| {
            let url = decode_entities(caps[1].trim()).into_owned();
            if url.is_empty() || url.starts_with('#') || url.to_lowercase().starts_with("javascript:") {
                return None;
            }
            if !seen.insert(url.clone()) {
                return None;
            }

            let text = collapse_whitespace(&html_to_text(&caps[2]));
            let text = if text.is_empty() { url.clone() } else { text };
            Some((url, shorten(&text)))
        })
        .collect()
}

fn links_from_text(text: &str) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    URL.find_iter(text)
        .filter_map(|m| {
            let url = m.as_str().trim_end_matches(['.', ',', '!', '?', ';', ':']);
            if !seen.insert(url.to_string()) {
                return None;
            }

            let before = &text[..m.start()];
            let context_start = before
                .char_indices()
                .rev()
                .nth(CONTEXT_CHARS - 1)
                .map_or(0, |(i, _)| i);
            let context_end = text[m.end()..]
                .char_indices()
                .nth(CONTEXT_CHARS)
                .map_or(text.len(), |(i, _)| m.end() + i);
            let context = collapse_whitespace(&text[context_start..context_end]);

            Some((url.to_string(), shorten(&context)))
        })
        .collect()
}

/// Host of a `scheme://host/...` URL.
fn domain_of(url: &str) -> Option<&str> {
    let (scheme, rest) = url.split_once("://")?;
    if scheme.is_empty() {
        return None;
    }
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let host = &rest[..end];
    let host = host.rsplit_once('@').map_or(host, |(_, h)| h);
    (!host.is_empty()).then_some(host)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn shorten(text: &str) -> String {
    if text.chars().count() > MAX_TEXT_CHARS {
        let head: String = text.chars().take(MAX_TEXT_CHARS - 3).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}
