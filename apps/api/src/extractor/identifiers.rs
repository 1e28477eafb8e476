//! File-key cascade for comment notification e-mails.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::LOCATION;
use serde::Serialize;
use tracing::{debug, warn};

/// `comments-<key>@…`, `file+<key>@…`, `reply.<key>@…`
static SENDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:comments?|file|reply)[-+.]([A-Za-z0-9]{10,128})@").expect("valid regex")
});

static DIRECT_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)https?://(?:www\.)?figma\.com/(?:file|design|board|proto|slides)/([A-Za-z0-9]{10,128})",
    )
    .expect("valid regex")
});

static HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)href\s*=\s*["']([^"']+)["']"#).expect("valid regex"));

static CDN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)https?://[^\s/]*(?:s3|cdn|upload|image|figma-alpha)[^\s/]*/[^\s]*?([a-f0-9]{32,64})",
    )
    .expect("valid regex")
});

static BARE_HEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[a-fA-F0-9]{32,64}\b").expect("valid regex"));

/// Path or host fragments that mark a link as a click-tracking redirect.
const TRACKING_MARKERS: &[&str] = &["/track/click", "/ls/click", "/c/", "click.", "email.figma.com", "links."];

/// At most this many tracking links are followed per message.
pub const MAX_REDIRECTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierStrategy {
    SenderAddress,
    TrackingRedirect,
    DirectLink,
    CdnUrl,
    BareHex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedIdentifier {
    pub file_key: String,
    pub strategy: IdentifierStrategy,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentifierInput<'a> {
    pub from: Option<&'a str>,
    pub html: Option<&'a str>,
    pub plain: Option<&'a str>,
}

impl<'a> IdentifierInput<'a> {
    fn bodies(&self) -> impl Iterator<Item = &'a str> {
        [self.html, self.plain].into_iter().flatten()
    }
}

/// Looks up where a tracking link points without following it.
#[async_trait]
pub trait RedirectResolver: Send + Sync {
    /// `None` on timeout, network failure or a response without `Location`.
    async fn resolve(&self, url: &str) -> Option<String>;
}

/// HEAD request with redirects disabled and a hard timeout.
pub struct HttpRedirectResolver {
    client: reqwest::Client,
}

impl HttpRedirectResolver {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RedirectResolver for HttpRedirectResolver {
    async fn resolve(&self, url: &str) -> Option<String> {
        let response = match self.client.head(url).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(url, "Redirect resolution timed out");
                return None;
            }
            Err(e) => {
                warn!(url, "Redirect resolution failed: {e}");
                return None;
            }
        };
        let location = response.headers().get(LOCATION)?.to_str().ok()?;
        Some(location.to_string())
    }
}

pub fn from_sender(from: &str) -> Option<String> {
    SENDER_RE
        .captures(from)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn from_direct_link(text: &str) -> Option<String> {
    DIRECT_LINK_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn from_cdn_url(text: &str) -> Option<String> {
    CDN_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
}

pub fn from_bare_hex(text: &str) -> Option<String> {
    BARE_HEX_RE.find(text).map(|m| m.as_str().to_lowercase())
}

/// `href` targets that look like click-tracking redirects, in document order.
pub fn tracking_links(html: &str) -> Vec<String> {
    let mut links: Vec<String> = Vec::new();
    for caps in HREF_RE.captures_iter(html) {
        let Some(href) = caps.get(1) else { continue };
        let href = href.as_str().replace("&amp;", "&");
        let lower = href.to_lowercase();
        if !lower.starts_with("http") || DIRECT_LINK_RE.is_match(&href) {
            continue;
        }
        if TRACKING_MARKERS.iter().any(|m| lower.contains(m)) && !links.contains(&href) {
            links.push(href);
        }
    }
    links
}

async fn from_tracking_redirect(html: &str, resolver: &dyn RedirectResolver) -> Option<String> {
    for link in tracking_links(html).into_iter().take(MAX_REDIRECTS) {
        let Some(location) = resolver.resolve(&link).await else {
            continue;
        };
        let decoded = urlencoding::decode(&location)
            .map(|d| d.into_owned())
            .unwrap_or(location);
        if let Some(key) = from_direct_link(&decoded) {
            return Some(key);
        }
        debug!(link, "Redirect target carries no file key");
    }
    None
}

/// Runs the cascade in priority order; the first level with a result wins.
pub async fn extract_file_key(
    input: IdentifierInput<'_>,
    resolver: &dyn RedirectResolver,
) -> Option<ExtractedIdentifier> {
    let found = |file_key: String, strategy| ExtractedIdentifier { file_key, strategy };

    if let Some(key) = input.from.and_then(from_sender) {
        return Some(found(key, IdentifierStrategy::SenderAddress));
    }
    if let Some(html) = input.html {
        if let Some(key) = from_tracking_redirect(html, resolver).await {
            return Some(found(key, IdentifierStrategy::TrackingRedirect));
        }
    }

    // The remaining levels are pure and share one shape.
    let pure: [(IdentifierStrategy, fn(&str) -> Option<String>); 3] = [
        (IdentifierStrategy::DirectLink, from_direct_link),
        (IdentifierStrategy::CdnUrl, from_cdn_url),
        (IdentifierStrategy::BareHex, from_bare_hex),
    ];
    pure.iter().find_map(|(strategy, step)| {
        input
            .bodies()
            .find_map(step)
            .map(|key| found(key, *strategy))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubResolver {
        targets: HashMap<String, String>,
        calls: Mutex<Vec<String>>,
    }

    impl StubResolver {
        fn with(url: &str, location: &str) -> Self {
            let mut targets = HashMap::new();
            targets.insert(url.to_string(), location.to_string());
            Self {
                targets,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RedirectResolver for StubResolver {
        async fn resolve(&self, url: &str) -> Option<String> {
            self.calls.lock().unwrap().push(url.to_string());
            self.targets.get(url).cloned()
        }
    }

    const TRACKED: &str = "https://email.figma.com/c/eJx1abc";

    #[tokio::test]
    async fn test_sender_address_wins_over_everything() {
        let html = format!(
            r#"<a href="{TRACKED}">open</a> https://www.figma.com/file/OTHERKEY12345/x"#
        );
        let resolver = StubResolver::with(TRACKED, "https://www.figma.com/design/REDIRKEY9876");
        let input = IdentifierInput {
            from: Some("Figma <comments-SENDERKEY42xyz@email.figma.com>"),
            html: Some(&html),
            plain: None,
        };
        let found = extract_file_key(input, &resolver).await.unwrap();
        assert_eq!(found.file_key, "SENDERKEY42xyz");
        assert_eq!(found.strategy, IdentifierStrategy::SenderAddress);
        assert_eq!(resolver.calls(), 0);
    }

    #[tokio::test]
    async fn test_redirect_location_is_decoded() {
        let html = format!(r#"<a href="{TRACKED}">View comment</a>"#);
        let resolver = StubResolver::with(
            TRACKED,
            "https%3A%2F%2Fwww.figma.com%2Fdesign%2FREDIRKEY9876%2FHome",
        );
        let input = IdentifierInput {
            from: Some("Figma <notifications@figma.com>"),
            html: Some(&html),
            plain: None,
        };
        let found = extract_file_key(input, &resolver).await.unwrap();
        assert_eq!(found.file_key, "REDIRKEY9876");
        assert_eq!(found.strategy, IdentifierStrategy::TrackingRedirect);
    }

    #[tokio::test]
    async fn test_failed_redirect_falls_through_to_direct_link() {
        let html = format!(
            r#"<a href="{TRACKED}">x</a><a href="https://www.figma.com/board/BOARDKEY1234/Plan">y</a>"#
        );
        let resolver = StubResolver::default();
        let found = extract_file_key(
            IdentifierInput {
                html: Some(&html),
                ..Default::default()
            },
            &resolver,
        )
        .await
        .unwrap();
        assert_eq!(found.file_key, "BOARDKEY1234");
        assert_eq!(found.strategy, IdentifierStrategy::DirectLink);
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn test_redirects_are_capped() {
        let html: String = (0..6)
            .map(|i| format!(r#"<a href="https://links.figma.com/ls/click?u={i}">l</a>"#))
            .collect();
        let resolver = StubResolver::default();
        let found = extract_file_key(
            IdentifierInput {
                html: Some(&html),
                ..Default::default()
            },
            &resolver,
        )
        .await;
        assert!(found.is_none());
        assert_eq!(resolver.calls(), MAX_REDIRECTS);
    }

    #[tokio::test]
    async fn test_cdn_then_bare_hex() {
        let hex = "0123456789abcdef0123456789abcdef";
        let cdn = format!("<img src=\"https://s3-alpha.figma.com/thumbnails/{hex}\">");
        let found = extract_file_key(
            IdentifierInput {
                html: Some(&cdn),
                ..Default::default()
            },
            &StubResolver::default(),
        )
        .await
        .unwrap();
        assert_eq!(found.strategy, IdentifierStrategy::CdnUrl);
        assert_eq!(found.file_key, hex);

        let plain = format!("ref {}", hex.to_uppercase());
        let found = extract_file_key(
            IdentifierInput {
                plain: Some(&plain),
                ..Default::default()
            },
            &StubResolver::default(),
        )
        .await
        .unwrap();
        assert_eq!(found.strategy, IdentifierStrategy::BareHex);
        assert_eq!(found.file_key, hex);
    }

    #[tokio::test]
    async fn test_no_identifier() {
        let found = extract_file_key(
            IdentifierInput {
                from: Some("someone@example.com"),
                plain: Some("nothing to see"),
                html: None,
            },
            &StubResolver::default(),
        )
        .await;
        assert!(found.is_none());
    }

    #[test]
    fn test_direct_link_shapes() {
        for prefix in ["file", "design", "board", "proto", "slides"] {
            let url = format!("https://figma.com/{prefix}/AbCdEf123456/Name");
            assert_eq!(from_direct_link(&url).as_deref(), Some("AbCdEf123456"));
        }
        assert!(from_direct_link("https://figma.com/community/AbCdEf123456").is_none());
    }
}
