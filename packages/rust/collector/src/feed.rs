//! RSS/Atom feed reading for the news digest.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::debug;

use mcpinsider_shared::{InsiderError, Result};

use crate::github::USER_AGENT;

const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// One article as listed by a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub published: Option<DateTime<Utc>>,
    /// Plain summary or body text; empty when the feed carries none.
    pub content: String,
}

/// Reads the items of one feed, in the order the feed lists them.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch_feed(&self, url: &str) -> Result<Vec<FeedItem>>;
}

/// Fetches feeds over HTTP and parses RSS, Atom or JSON Feed.
pub struct RssClient {
    client: Client,
}

impl RssClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| InsiderError::Upstream(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedFetcher for RssClient {
    async fn fetch_feed(&self, url: &str) -> Result<Vec<FeedItem>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| InsiderError::Upstream(format!("feed {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(InsiderError::Upstream(format!("feed {url}: HTTP {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| InsiderError::Upstream(format!("feed {url}: {e}")))?;
        let feed = feed_rs::parser::parse(&body[..])
            .map_err(|e| InsiderError::parse(format!("feed {url}: {e}")))?;

        let items: Vec<FeedItem> = feed.entries.into_iter().filter_map(into_item).collect();
        debug!(url, items = items.len(), "feed parsed");
        Ok(items)
    }
}

/// Entries without a usable link cannot be deduplicated and are dropped.
fn into_item(entry: feed_rs::model::Entry) -> Option<FeedItem> {
    let link = entry
        .links
        .first()
        .map(|l| l.href.clone())
        .or_else(|| entry.id.starts_with("http").then(|| entry.id.clone()))?;

    let content = entry
        .summary
        .map(|t| t.content)
        .or_else(|| entry.content.and_then(|c| c.body))
        .unwrap_or_default();

    Some(FeedItem {
        title: entry.title.map(|t| t.content).unwrap_or_else(|| link.clone()),
        published: entry
            .published
            .or(entry.updated)
            .map(|dt| dt.with_timezone(&Utc)),
        link,
        content,
    })
}
