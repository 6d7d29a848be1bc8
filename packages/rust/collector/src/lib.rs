//! Collection pass: paginated repository search and raw batch persistence.
//!
//! This crate provides:
//! - [`SourceFetcher`]: the fetch capability (`fetch_page(query, page)`)
//! - [`GitHubClient`]: the GitHub search implementation
//! - [`collect`] / [`run_collection`]: the pass that pages through results
//!   and saves a [`RawBatch`]
//! - [`FeedFetcher`] / [`RssClient`]: news feed reading for the digest

pub mod feed;
pub mod github;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use mcpinsider_shared::{CollectorConfig, RawBatch, Result, SourceRecord};
use mcpinsider_storage::Documents;

pub use feed::{FeedFetcher, FeedItem, RssClient};
pub use github::GitHubClient;

// ---------------------------------------------------------------------------
// Fetch capability
// ---------------------------------------------------------------------------

/// Paginated search over a remote corpus.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch one page (1-based) of results for `query`.
    async fn fetch_page(&self, query: &str, page: u32) -> Result<Vec<SourceRecord>>;
}

/// Builds the fetcher for one pass from the collector config in effect for
/// that pass, so endpoint, page size and token changes apply without a
/// restart.
pub trait FetcherFactory: Send + Sync {
    fn fetcher(&self, config: &CollectorConfig) -> Result<Arc<dyn SourceFetcher>>;
}

/// [`FetcherFactory`] producing [`GitHubClient`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitHubFetchers;

impl FetcherFactory for GitHubFetchers {
    fn fetcher(&self, config: &CollectorConfig) -> Result<Arc<dyn SourceFetcher>> {
        Ok(Arc::new(default_fetcher(config)?))
    }
}

// ---------------------------------------------------------------------------
// Collect
// ---------------------------------------------------------------------------

/// Paging limits for one collection pass.
#[derive(Debug, Clone)]
pub struct CollectOptions {
    pub max_pages: u32,
    /// Pause after each successfully fetched page.
    pub page_delay: Duration,
}

impl From<&CollectorConfig> for CollectOptions {
    fn from(config: &CollectorConfig) -> Self {
        Self {
            max_pages: config.max_pages,
            page_delay: Duration::from_millis(config.page_delay_ms),
        }
    }
}

/// Why a collection pass stopped paging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// A page came back empty.
    Exhausted,
    /// `max_pages` pages were fetched.
    PageLimit,
    /// A page request failed; records fetched before it are kept.
    FetchError(String),
}

/// Summary of a collection pass.
#[derive(Debug, Clone)]
pub struct CollectReport {
    pub records: Vec<SourceRecord>,
    pub pages_fetched: u32,
    pub stop: StopReason,
}

/// Page through `query` until a page is empty, `max_pages` is reached, or a
/// request fails. Records are deduplicated by url, first occurrence wins.
#[instrument(skip_all, fields(query = %query, max_pages = options.max_pages))]
pub async fn collect(
    fetcher: &dyn SourceFetcher,
    query: &str,
    options: &CollectOptions,
) -> CollectReport {
    let mut records = Vec::new();
    let mut seen = HashSet::new();
    let mut pages_fetched = 0;
    let mut stop = StopReason::PageLimit;

    for page in 1..=options.max_pages {
        info!(page, "fetching page");
        let items = match fetcher.fetch_page(query, page).await {
            Ok(items) => items,
            Err(e) => {
                warn!(page, error = %e, class = %e.class(), "fetch failed, stopping collection");
                stop = StopReason::FetchError(e.to_string());
                break;
            }
        };

        pages_fetched += 1;
        if items.is_empty() {
            info!(page, "no more items found");
            stop = StopReason::Exhausted;
            break;
        }

        for item in items {
            if seen.insert(item.url.clone()) {
                info!(repo = %item.name, "collected");
                records.push(item);
            }
        }

        if page < options.max_pages && !options.page_delay.is_zero() {
            tokio::time::sleep(options.page_delay).await;
        }
    }

    CollectReport {
        records,
        pages_fetched,
        stop,
    }
}

/// Result of [`run_collection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionOutcome {
    /// The collector is disabled in config.
    Skipped,
    /// A raw batch was saved.
    Saved { count: usize, stop: StopReason },
}

/// Run a full collection pass and persist its raw batch.
///
/// A fetch failure ends paging but still saves what was collected; a store
/// failure is returned to the caller.
#[instrument(skip_all, fields(selector = %config.source_selector))]
pub async fn run_collection(
    config: &CollectorConfig,
    fetcher: &dyn SourceFetcher,
    docs: &Documents,
    now: DateTime<Utc>,
) -> Result<CollectionOutcome> {
    if !config.enabled {
        info!("collector is disabled, skipping");
        return Ok(CollectionOutcome::Skipped);
    }

    info!("starting collection");
    let report = collect(fetcher, &config.source_selector, &CollectOptions::from(config)).await;

    let count = report.records.len();
    let batch = RawBatch::new(report.records, now);
    docs.save_raw_batch(&batch).await.map_err(|e| {
        warn!(error = %e, class = %e.class(), "failed to save raw batch");
        e
    })?;

    info!(
        count,
        pages = report.pages_fetched,
        stop = ?report.stop,
        "collection completed"
    );

    Ok(CollectionOutcome::Saved {
        count,
        stop: report.stop,
    })
}

/// Build the default fetcher for a collector config.
pub fn default_fetcher(config: &CollectorConfig) -> Result<GitHubClient> {
    config.validate()?;
    GitHubClient::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use mcpinsider_shared::InsiderError;
    use mcpinsider_storage::MemoryStore;

    /// Serves `pages[i]` for page `i + 1`; pages past the end fail.
    struct ScriptedFetcher {
        pages: Vec<Result<Vec<SourceRecord>>>,
        calls: AtomicU32,
    }

    impl ScriptedFetcher {
        fn new(pages: Vec<Result<Vec<SourceRecord>>>) -> Self {
            Self {
                pages,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SourceFetcher for ScriptedFetcher {
        async fn fetch_page(&self, _query: &str, page: u32) -> Result<Vec<SourceRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.pages.get(page as usize - 1) {
                Some(Ok(items)) => Ok(items.clone()),
                Some(Err(e)) => Err(InsiderError::Upstream(e.to_string())),
                None => Err(InsiderError::Upstream("unexpected page".into())),
            }
        }
    }

    fn repo(n: u32) -> SourceRecord {
        SourceRecord {
            name: format!("acme/repo-{n}"),
            url: format!("https://github.com/acme/repo-{n}"),
            description: None,
            stars: u64::from(n),
            updated_at: None,
            language: None,
            license: None,
        }
    }

    fn options(max_pages: u32) -> CollectOptions {
        CollectOptions {
            max_pages,
            page_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn stops_at_page_limit() {
        let fetcher = ScriptedFetcher::new(vec![
            Ok(vec![repo(1), repo(2)]),
            Ok(vec![repo(3)]),
            Ok(vec![repo(4)]),
        ]);
        let report = collect(&fetcher, "topic:x", &options(2)).await;
        assert_eq!(report.records.len(), 3);
        assert_eq!(report.pages_fetched, 2);
        assert_eq!(report.stop, StopReason::PageLimit);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stops_on_empty_page() {
        let fetcher = ScriptedFetcher::new(vec![Ok(vec![repo(1)]), Ok(vec![])]);
        let report = collect(&fetcher, "topic:x", &options(3)).await;
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.stop, StopReason::Exhausted);
    }

    #[tokio::test]
    async fn fetch_error_keeps_earlier_pages() {
        let fetcher = ScriptedFetcher::new(vec![
            Ok(vec![repo(1), repo(2)]),
            Err(InsiderError::Upstream("rate limited".into())),
        ]);
        let report = collect(&fetcher, "topic:x", &options(3)).await;
        assert_eq!(report.records.len(), 2);
        assert!(matches!(report.stop, StopReason::FetchError(_)));
    }

    #[tokio::test]
    async fn duplicate_urls_across_pages_are_dropped() {
        let fetcher = ScriptedFetcher::new(vec![Ok(vec![repo(1), repo(2)]), Ok(vec![repo(2)])]);
        let report = collect(&fetcher, "topic:x", &options(2)).await;
        assert_eq!(report.records.len(), 2);
    }

    #[tokio::test]
    async fn run_collection_saves_raw_batch() {
        let docs = Documents::new(Arc::new(MemoryStore::new()));
        let fetcher = ScriptedFetcher::new(vec![Ok(vec![repo(1)]), Ok(vec![])]);
        let config = CollectorConfig {
            page_delay_ms: 0,
            ..CollectorConfig::default()
        };

        let outcome = run_collection(&config, &fetcher, &docs, Utc::now())
            .await
            .expect("collect");
        assert_eq!(
            outcome,
            CollectionOutcome::Saved {
                count: 1,
                stop: StopReason::Exhausted
            }
        );

        let batch = docs.raw_batch().await.unwrap().expect("batch saved");
        assert_eq!(batch.total_count, 1);
        assert_eq!(batch.repositories[0].name, "acme/repo-1");
    }

    #[test]
    fn github_fetchers_build_from_each_config() {
        let invalid = CollectorConfig {
            interval_hours: 0,
            ..CollectorConfig::default()
        };
        assert!(GitHubFetchers.fetcher(&invalid).is_err());

        let enterprise = CollectorConfig {
            api_base: "https://git.example.com/api/v3".into(),
            per_page: 50,
            ..CollectorConfig::default()
        };
        assert!(GitHubFetchers.fetcher(&enterprise).is_ok());
    }

    #[tokio::test]
    async fn disabled_collector_skips_without_fetching() {
        let docs = Documents::new(Arc::new(MemoryStore::new()));
        let fetcher = ScriptedFetcher::new(vec![]);
        let config = CollectorConfig {
            enabled: false,
            ..CollectorConfig::default()
        };

        let outcome = run_collection(&config, &fetcher, &docs, Utc::now())
            .await
            .expect("collect");
        assert_eq!(outcome, CollectionOutcome::Skipped);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert!(docs.raw_batch().await.unwrap().is_none());
    }
}
