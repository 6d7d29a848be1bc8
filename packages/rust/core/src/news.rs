//! News digest: summarize articles from the configured feeds and keep the
//! newest items in `news_data.json`.
//!
//! Summaries go through the same [`EnrichmentSession`] as repository
//! annotations, so an unavailable model is skipped here too. A summary that
//! cannot be produced never drops the article; it is stored with the original
//! title and a fixed notice instead.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use mcpinsider_collector::{FeedFetcher, FeedItem};
use mcpinsider_shared::{FeedSource, InsiderError, NewsConfig, NewsItem, Result};
use mcpinsider_storage::Documents;

use crate::enrichment::{EnrichmentSession, TextGenerator, json_object};

/// Stored as `summary_ja` when no summary could be generated.
pub const SUMMARY_FALLBACK: &str = "要約の生成に失敗しました。";

const SLUG_MAX_CHARS: usize = 50;
const SLUG_SUFFIX_CHARS: usize = 5;

/// Limits for one news pass.
#[derive(Debug, Clone)]
pub struct NewsOptions {
    /// Newest items considered per feed.
    pub items_per_feed: usize,
    /// Size of the stored digest.
    pub max_items: usize,
    /// Article text sent to the model, in characters.
    pub excerpt_chars: usize,
}

impl Default for NewsOptions {
    fn default() -> Self {
        Self::from(&NewsConfig::default())
    }
}

impl From<&NewsConfig> for NewsOptions {
    fn from(config: &NewsConfig) -> Self {
        Self {
            items_per_feed: config.items_per_feed,
            max_items: config.max_items,
            excerpt_chars: config.excerpt_chars,
        }
    }
}

/// Result of [`run_news_pass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewsOutcome {
    /// `news_feeds.json` does not exist; nothing was written.
    NoFeeds,
    Completed {
        /// Articles summarized in this pass.
        added: usize,
        /// Items in the saved digest.
        total: usize,
    },
}

/// Fetch every feed, summarize unseen articles, and save the digest.
///
/// A feed that fails to load is logged and skipped. Store failures abort the
/// pass before the digest is written.
#[instrument(skip_all)]
pub async fn run_news_pass(
    docs: &Documents,
    fetcher: &dyn FeedFetcher,
    generator: &dyn TextGenerator,
    session: &mut EnrichmentSession,
    options: &NewsOptions,
    now: DateTime<Utc>,
) -> Result<NewsOutcome> {
    let Some(feeds) = docs.news_feeds().await? else {
        warn!("news feed list not found, skipping news pass");
        return Ok(NewsOutcome::NoFeeds);
    };
    let existing = docs.news().await?;
    let mut seen: HashSet<String> = existing.iter().map(|item| item.url.clone()).collect();

    let mut fresh = Vec::new();
    for feed in &feeds {
        info!(feed = %feed.name, "fetching feed");
        let items = match fetcher.fetch_feed(&feed.url).await {
            Ok(items) => items,
            Err(e) => {
                warn!(feed = %feed.name, error = %e, class = %e.class(), "feed failed, skipping");
                continue;
            }
        };

        for item in items.into_iter().take(options.items_per_feed) {
            if !seen.insert(item.link.clone()) {
                debug!(url = %item.link, "already in digest");
                continue;
            }
            fresh.push(summarize(generator, session, feed, item, options, now).await);
        }
    }

    let added = fresh.len();
    let mut digest = fresh;
    digest.extend(existing);
    digest.sort_by(|a, b| b.date.cmp(&a.date));
    digest.truncate(options.max_items);

    docs.save_news(&digest).await?;
    info!(added, total = digest.len(), "news digest saved");
    Ok(NewsOutcome::Completed {
        added,
        total: digest.len(),
    })
}

#[derive(Deserialize)]
struct Summary {
    title_ja: String,
    summary_ja: String,
}

async fn summarize(
    generator: &dyn TextGenerator,
    session: &mut EnrichmentSession,
    feed: &FeedSource,
    item: FeedItem,
    options: &NewsOptions,
    now: DateTime<Utc>,
) -> NewsItem {
    let prompt = build_news_prompt(&item, &feed.name, options.excerpt_chars);
    let summary = session
        .generate(generator, &prompt)
        .await
        .and_then(|text| parse_summary(&text));
    let (title_ja, summary_ja) = match summary {
        Ok(s) => (s.title_ja, s.summary_ja),
        Err(e) => {
            warn!(url = %item.link, error = %e, "summary failed, keeping original title");
            (item.title.clone(), SUMMARY_FALLBACK.to_string())
        }
    };

    NewsItem {
        slug: slug(&item.title),
        title_ja,
        url: item.link,
        date: item.published.unwrap_or(now),
        source: feed.name.clone(),
        category: feed.category.clone(),
        summary_ja,
        title: item.title,
    }
}

/// Prompt asking for a Japanese title and summary of one article.
pub fn build_news_prompt(item: &FeedItem, source: &str, excerpt_chars: usize) -> String {
    let excerpt: String = item.content.chars().take(excerpt_chars).collect();
    format!(
        "You are a tech journalist writing for Japanese developers.\n\
         Summarize the article below in Japanese.\n\
         \n\
         Title: {title}\n\
         Source: {source}\n\
         Content: {excerpt}\n\
         \n\
         Respond with a JSON object only, no markdown:\n\
         {{\"title_ja\": \"Japanese title\", \"summary_ja\": \"Japanese summary, 3 sentences at most\"}}",
        title = item.title,
    )
}

fn parse_summary(text: &str) -> Result<Summary> {
    let json = json_object(text)?;
    serde_json::from_str(json).map_err(|e| InsiderError::parse(format!("invalid summary JSON: {e}")))
}

/// URL-safe form of a title: lowercase ASCII words joined by `-`, at most
/// 50 characters.
pub fn slugify(title: &str) -> String {
    static STRIP_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[^a-z0-9\s-]").expect("valid regex"));
    static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
    static DASH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-+").expect("valid regex"));

    let lower = title.to_lowercase();
    let stripped = STRIP_RE.replace_all(&lower, "");
    let dashed = SPACE_RE.replace_all(stripped.trim(), "-");
    let collapsed = DASH_RE.replace_all(&dashed, "-");
    collapsed.chars().take(SLUG_MAX_CHARS).collect()
}

/// [`slugify`] plus a short random suffix, so equal titles get distinct
/// slugs.
fn slug(title: &str) -> String {
    let id = Uuid::now_v7().simple().to_string();
    let suffix = &id[id.len() - SLUG_SUFFIX_CHARS..];
    match slugify(title) {
        base if base.is_empty() => suffix.to_string(),
        base => format!("{base}-{suffix}"),
    }
}
