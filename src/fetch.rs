use anyhow::Context;
use async_trait::async_trait;
use pricefeed_types::{FeedType, ValidationError};
use reqwest::header::CONTENT_TYPE;
use reqwest::{redirect, Client};
use std::time::Duration;

pub const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedFeed {
    /// URL after redirects.
    pub url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedFeed, anyhow::Error>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

pub fn build_client(timeout: Duration) -> Result<Client, anyhow::Error> {
    Client::builder()
        .timeout(timeout)
        .redirect(redirect::Policy::limited(MAX_REDIRECTS))
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .build()
        .context("Unable to build HTTP client")
}

#[async_trait]
impl FeedFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedFeed, anyhow::Error> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context(format!("Unable to fetch {url}"))?
            .error_for_status()?;
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = resp
            .bytes()
            .await
            .context(format!("Unable to read {url}"))?
            .to_vec();
        log::info!("Fetched {} bytes from {final_url}", body.len());
        Ok(FetchedFeed {
            url: final_url,
            content_type,
            body,
        })
    }
}

/// Accepts absolute http(s) URLs only.
pub fn validate_url(url: &str) -> Result<url::Url, ValidationError> {
    match url::Url::parse(url.trim()) {
        Ok(u) if matches!(u.scheme(), "http" | "https") && u.host_str().is_some() => Ok(u),
        _ => Err(ValidationError::InvalidUrl(url.to_string())),
    }
}

fn type_from_url(url: &str) -> Option<FeedType> {
    let parsed = url::Url::parse(url).ok()?;
    let path = parsed.path().to_lowercase();
    if path.ends_with(".xml") {
        Some(FeedType::Xml)
    } else if path.ends_with(".csv") || parsed.host_str().is_some_and(|h| h.ends_with("1drv.ms")) {
        Some(FeedType::Csv)
    } else {
        None
    }
}

fn type_from_content_type(content_type: &str) -> Option<FeedType> {
    let content_type = content_type.to_lowercase();
    if content_type.contains("xml") {
        Some(FeedType::Xml)
    } else if content_type.contains("csv") {
        Some(FeedType::Csv)
    } else {
        None
    }
}

fn sniff(body: &[u8]) -> FeedType {
    let body = body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body);
    match body.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'<') => FeedType::Xml,
        _ => FeedType::Csv,
    }
}

/// URL suffix first, then the declared content type, then the body itself.
pub fn detect_feed_type(requested_url: &str, feed: &FetchedFeed) -> FeedType {
    type_from_url(requested_url)
        .or_else(|| type_from_url(&feed.url))
        .or_else(|| feed.content_type.as_deref().and_then(type_from_content_type))
        .unwrap_or_else(|| sniff(&feed.body))
}
