//! End-to-end passes: raw batch → merge → catalog, and the scheduled
//! collect-then-analyze flow.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use mcpinsider_collector::{CollectionOutcome, FetcherFactory, run_collection};
use mcpinsider_shared::{CollectorConfig, Result};
use mcpinsider_storage::Documents;

use crate::enrichment::EnrichmentSession;
use crate::merge::{MergeEngine, PassReport};
use crate::scheduler::PassRunner;

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Callback trait for reporting merge pass progress.
///
/// The CLI implements this with indicatif progress bars.
pub trait PassProgress: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called before each record is enriched (1-based).
    fn record_progress(&self, current: usize, total: usize, name: &str);
    /// Called once the pass finished.
    fn done(&self, report: &PassReport);
}

/// No-op progress reporter.
pub struct SilentPassProgress;

impl PassProgress for SilentPassProgress {
    fn phase(&self, _name: &str) {}
    fn record_progress(&self, _current: usize, _total: usize, _name: &str) {}
    fn done(&self, _report: &PassReport) {}
}

// ---------------------------------------------------------------------------
// Analyze
// ---------------------------------------------------------------------------

/// Result of [`analyze`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyzeOutcome {
    /// No collection pass has produced a raw batch yet; nothing was written.
    NoRawBatch,
    Completed(PassReport),
}

/// Merge the latest raw batch into the persisted catalog.
///
/// Store failures abort the pass before the catalog is written, so the
/// previously persisted catalog stays intact.
#[instrument(skip_all)]
pub async fn analyze(
    docs: &Documents,
    engine: &MergeEngine,
    session: &mut EnrichmentSession,
    now: DateTime<Utc>,
    progress: &dyn PassProgress,
) -> Result<AnalyzeOutcome> {
    progress.phase("loading");
    let Some(batch) = docs.raw_batch().await.inspect_err(log_fatal)? else {
        warn!("no raw batch found, run collect first");
        return Ok(AnalyzeOutcome::NoRawBatch);
    };

    let settings = docs.settings().await.inspect_err(log_fatal)?;
    info!(
        auto_publish = settings.auto_publish,
        retention_days = settings.retention_days,
        "settings loaded"
    );
    let existing = docs.catalog().await.inspect_err(log_fatal)?;

    let outcome = engine
        .run_pass(session, &batch.repositories, &settings, existing, now, progress)
        .await;

    docs.save_catalog(&outcome.catalog)
        .await
        .inspect_err(log_fatal)?;
    info!(total = outcome.catalog.total_count, "catalog saved");

    Ok(AnalyzeOutcome::Completed(outcome.report))
}

fn log_fatal(e: &mcpinsider_shared::InsiderError) {
    warn!(error = %e, class = %e.class(), "analysis pass failed");
}

// ---------------------------------------------------------------------------
// Scheduled pass
// ---------------------------------------------------------------------------

/// Collection followed by analysis, run by the scheduler on every firing.
///
/// Holds one [`EnrichmentSession`] for its lifetime, so a model marked
/// unavailable stays skipped across scheduled passes. The fetcher is rebuilt
/// from each firing's config, so edits to the token or API base apply on the
/// next pass.
pub struct CollectAndAnalyze {
    docs: Documents,
    fetchers: Arc<dyn FetcherFactory>,
    engine: MergeEngine,
    session: Mutex<EnrichmentSession>,
}

impl CollectAndAnalyze {
    pub fn new(
        docs: Documents,
        fetchers: Arc<dyn FetcherFactory>,
        engine: MergeEngine,
        session: EnrichmentSession,
    ) -> Self {
        Self {
            docs,
            fetchers,
            engine,
            session: Mutex::new(session),
        }
    }
}

#[async_trait]
impl PassRunner for CollectAndAnalyze {
    async fn run(&self, config: &CollectorConfig) -> Result<()> {
        let fetcher = self.fetchers.fetcher(config)?;
        let outcome = run_collection(config, fetcher.as_ref(), &self.docs, Utc::now()).await?;
        if outcome == CollectionOutcome::Skipped {
            return Ok(());
        }

        let mut session = self.session.lock().await;
        match analyze(
            &self.docs,
            &self.engine,
            &mut session,
            Utc::now(),
            &SilentPassProgress,
        )
        .await?
        {
            AnalyzeOutcome::Completed(report) => {
                info!(
                    enriched = report.enriched,
                    skipped = report.skipped,
                    pruned = report.pruned,
                    exhausted = report.exhausted,
                    "scheduled pass complete"
                );
            }
            AnalyzeOutcome::NoRawBatch => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use mcpinsider_collector::SourceFetcher;
    use mcpinsider_shared::{
        Catalog, CatalogEntry, EntryStatus, InsiderError, PipelineSettings, RawBatch,
        SourceRecord,
    };
    use mcpinsider_storage::{DocKey, DocumentStore, MemoryStore};
    use serde_json::Value;

    use crate::enrichment::TextGenerator;
    use crate::merge::MergeOptions;

    struct EchoGenerator;

    #[async_trait]
    impl TextGenerator for EchoGenerator {
        async fn generate(&self, _prompt: &str, _model: &str) -> Result<String> {
            Ok(r#"{"summary": "fine"}"#.into())
        }
    }

    struct OnePageFetcher;

    #[async_trait]
    impl SourceFetcher for OnePageFetcher {
        async fn fetch_page(&self, _query: &str, page: u32) -> Result<Vec<SourceRecord>> {
            Ok(if page == 1 { vec![record("https://github.com/a/one")] } else { vec![] })
        }
    }

    /// Hands out [`OnePageFetcher`]s and records the config of each request.
    #[derive(Default)]
    struct RecordingFactory {
        seen: std::sync::Mutex<Vec<CollectorConfig>>,
    }

    impl FetcherFactory for RecordingFactory {
        fn fetcher(&self, config: &CollectorConfig) -> Result<Arc<dyn SourceFetcher>> {
            self.seen.lock().unwrap().push(config.clone());
            Ok(Arc::new(OnePageFetcher))
        }
    }

    /// Reads succeed from an inner store; every write fails.
    struct ReadOnlyStore(MemoryStore);

    #[async_trait]
    impl DocumentStore for ReadOnlyStore {
        async fn load(&self, key: &DocKey) -> Result<Option<Value>> {
            self.0.load(key).await
        }

        async fn save(&self, key: &DocKey, _doc: &Value) -> Result<()> {
            Err(InsiderError::storage(key.to_string(), "disk full"))
        }
    }

    fn record(url: &str) -> SourceRecord {
        SourceRecord {
            name: url.rsplit('/').next().unwrap_or(url).to_string(),
            url: url.into(),
            description: None,
            stars: 0,
            updated_at: None,
            language: None,
            license: None,
        }
    }

    fn engine() -> MergeEngine {
        MergeEngine::new(
            Arc::new(EchoGenerator),
            MergeOptions {
                call_delay: Duration::ZERO,
            },
        )
    }

    fn session() -> EnrichmentSession {
        EnrichmentSession::new(vec!["m".into()])
    }

    #[tokio::test]
    async fn missing_raw_batch_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let docs = Documents::new(store.clone());

        let outcome = analyze(&docs, &engine(), &mut session(), Utc::now(), &SilentPassProgress)
            .await
            .unwrap();
        assert_eq!(outcome, AnalyzeOutcome::NoRawBatch);
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn analyze_merges_raw_batch_into_catalog() {
        let docs = Documents::new(Arc::new(MemoryStore::new()));
        docs.save_raw_batch(&RawBatch::new(vec![record("https://github.com/a/x")], Utc::now()))
            .await
            .unwrap();
        docs.save_settings(&PipelineSettings {
            auto_publish: true,
            ..PipelineSettings::default()
        })
        .await
        .unwrap();

        let outcome = analyze(&docs, &engine(), &mut session(), Utc::now(), &SilentPassProgress)
            .await
            .unwrap();
        let AnalyzeOutcome::Completed(report) = outcome else {
            panic!("expected a completed pass");
        };
        assert_eq!(report.enriched, 1);

        let catalog = docs.catalog().await.unwrap();
        assert_eq!(catalog.total_count, 1);
        assert_eq!(catalog.entries[0].status, EntryStatus::Published);
    }

    #[tokio::test]
    async fn save_failure_surfaces_and_keeps_prior_catalog() {
        let inner = MemoryStore::new();
        let prior = Catalog::from_entries(
            vec![CatalogEntry::new(
                record("https://github.com/a/old"),
                None,
                EntryStatus::Published,
                None,
            )],
            Utc::now(),
        );
        inner
            .save(&DocKey::Catalog, &serde_json::to_value(&prior).unwrap())
            .await
            .unwrap();
        let batch = RawBatch::new(vec![record("https://github.com/a/new")], Utc::now());
        inner
            .save(&DocKey::RawBatch, &serde_json::to_value(&batch).unwrap())
            .await
            .unwrap();

        let docs = Documents::new(Arc::new(ReadOnlyStore(inner)));
        let err = analyze(&docs, &engine(), &mut session(), Utc::now(), &SilentPassProgress)
            .await
            .unwrap_err();
        assert_eq!(err.class(), mcpinsider_shared::ErrorClass::PersistenceFailure);
        assert_eq!(docs.catalog().await.unwrap(), prior);
    }

    #[tokio::test]
    async fn scheduled_pass_collects_then_analyzes() {
        let docs = Documents::new(Arc::new(MemoryStore::new()));
        let pass = CollectAndAnalyze::new(
            docs.clone(),
            Arc::new(RecordingFactory::default()),
            engine(),
            session(),
        );
        let config = CollectorConfig {
            page_delay_ms: 0,
            ..CollectorConfig::default()
        };

        pass.run(&config).await.unwrap();

        let catalog = docs.catalog().await.unwrap();
        assert_eq!(catalog.total_count, 1);
        assert_eq!(catalog.entries[0].url(), "https://github.com/a/one");
        assert_eq!(catalog.entries[0].status, EntryStatus::Draft);
    }

    #[tokio::test]
    async fn each_pass_builds_its_fetcher_from_that_pass_config() {
        let factory = Arc::new(RecordingFactory::default());
        let docs = Documents::new(Arc::new(MemoryStore::new()));
        let pass = CollectAndAnalyze::new(docs, factory.clone(), engine(), session());

        let mut config = CollectorConfig {
            page_delay_ms: 0,
            ..CollectorConfig::default()
        };
        pass.run(&config).await.unwrap();
        config.api_base = "https://ghe.example.com/api/v3".into();
        pass.run(&config).await.unwrap();

        let seen = factory.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].api_base, CollectorConfig::default().api_base);
        assert_eq!(seen[1].api_base, "https://ghe.example.com/api/v3");
    }

    #[tokio::test]
    async fn unbuildable_fetcher_fails_the_pass_without_writes() {
        struct Broken;
        impl FetcherFactory for Broken {
            fn fetcher(&self, _config: &CollectorConfig) -> Result<Arc<dyn SourceFetcher>> {
                Err(InsiderError::config("bad api_base"))
            }
        }

        let store = Arc::new(MemoryStore::new());
        let pass = CollectAndAnalyze::new(Documents::new(store.clone()), Arc::new(Broken), engine(), session());
        assert!(pass.run(&CollectorConfig::default()).await.is_err());
        assert!(store.keys().await.is_empty());
    }
}
