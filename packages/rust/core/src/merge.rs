//! Merge engine: retention, sequential enrichment, and reconciliation of a
//! raw batch into the catalog.
//!
//! A pass owns the catalog for its whole duration and never touches the
//! store; persisting the result is the caller's job (see
//! [`crate::pipeline::analyze`]).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use mcpinsider_shared::{
    AnalyzerConfig, Catalog, CatalogEntry, EntryStatus, PipelineSettings, SourceRecord,
};

use crate::enrichment::{EnrichmentSession, TextGenerator};
use crate::pipeline::PassProgress;

/// Tuning for one merge pass.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Pause between consecutive enrichment calls.
    pub call_delay: Duration,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            call_delay: Duration::from_secs(2),
        }
    }
}

impl From<&AnalyzerConfig> for MergeOptions {
    fn from(config: &AnalyzerConfig) -> Self {
        Self {
            call_delay: Duration::from_millis(config.call_delay_ms),
        }
    }
}

/// Counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Records that received a fresh annotation.
    pub enriched: usize,
    /// Records left unenriched (failed, or not attempted after exhaustion).
    pub skipped: usize,
    /// Existing entries dropped by the retention filter.
    pub pruned: usize,
    /// Every model was exhausted during the pass.
    pub exhausted: bool,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub catalog: Catalog,
    pub report: PassReport,
}

/// Drop entries older than `retention_days`. Entries never analyzed are kept,
/// and an age of exactly `retention_days` is kept.
///
/// Returns the retained entries and the number pruned.
pub fn apply_retention(
    entries: Vec<CatalogEntry>,
    retention_days: u32,
    now: DateTime<Utc>,
) -> (Vec<CatalogEntry>, usize) {
    let limit = chrono::Duration::days(i64::from(retention_days));
    let before = entries.len();
    let retained: Vec<_> = entries
        .into_iter()
        .filter(|entry| match entry.analyzed_at {
            Some(at) => now.signed_duration_since(at) <= limit,
            None => true,
        })
        .collect();
    let pruned = before - retained.len();
    (retained, pruned)
}

/// Url-keyed entry list that keeps first-insertion order.
///
/// Re-inserting a url replaces the entry in place.
#[derive(Default)]
struct OrderedEntries {
    entries: Vec<CatalogEntry>,
    index: HashMap<String, usize>,
}

impl OrderedEntries {
    fn get(&self, url: &str) -> Option<&CatalogEntry> {
        self.index.get(url).map(|&i| &self.entries[i])
    }

    fn upsert(&mut self, entry: CatalogEntry) {
        match self.index.get(entry.url()) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.index.insert(entry.url().to_string(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    fn into_vec(self) -> Vec<CatalogEntry> {
        self.entries
    }
}

/// Runs merge passes against a text generator.
pub struct MergeEngine {
    generator: Arc<dyn TextGenerator>,
    options: MergeOptions,
}

impl MergeEngine {
    pub fn new(generator: Arc<dyn TextGenerator>, options: MergeOptions) -> Self {
        Self { generator, options }
    }

    /// Merge `batch` into `existing`.
    ///
    /// Enrichment failures are per record and never fail the pass. When the
    /// session runs out of models the remaining records are left unenriched
    /// and the partial result is returned.
    #[instrument(skip_all, fields(batch = batch.len(), existing = existing.entries.len()))]
    pub async fn run_pass(
        &self,
        session: &mut EnrichmentSession,
        batch: &[SourceRecord],
        settings: &PipelineSettings,
        existing: Catalog,
        now: DateTime<Utc>,
        progress: &dyn PassProgress,
    ) -> MergeOutcome {
        let mut report = PassReport::default();

        progress.phase("retention");
        let (retained, pruned) = apply_retention(existing.entries, settings.retention_days, now);
        report.pruned = pruned;
        if pruned > 0 {
            info!(pruned, retention_days = settings.retention_days, "pruned expired entries");
        }

        let mut merged = OrderedEntries::default();
        for entry in retained {
            merged.upsert(entry);
        }

        progress.phase("enrichment");
        info!(count = batch.len(), "analyzing repositories");
        for (i, record) in batch.iter().enumerate() {
            progress.record_progress(i + 1, batch.len(), &record.name);

            let annotation = match session.annotate(self.generator.as_ref(), record).await {
                Ok(annotation) => annotation,
                Err(e) => {
                    warn!(error = %e, remaining = batch.len() - i, "enrichment stopped, leaving remaining records unenriched");
                    report.exhausted = true;
                    report.skipped += batch.len() - i;
                    break;
                }
            };

            match annotation {
                Some(analysis) => {
                    let previous = merged.get(&record.url);
                    let status = EntryStatus::reconcile(
                        previous.map(|e| e.status),
                        settings.auto_publish,
                    );
                    let extra = previous.map(|e| e.extra.clone()).unwrap_or_default();
                    merged.upsert(CatalogEntry {
                        record: record.clone(),
                        analysis: Some(analysis),
                        status,
                        analyzed_at: Some(now),
                        extra,
                    });
                    report.enriched += 1;
                }
                None => report.skipped += 1,
            }

            if i + 1 < batch.len() && !self.options.call_delay.is_zero() {
                tokio::time::sleep(self.options.call_delay).await;
            }
        }

        let catalog = Catalog::from_entries(merged.into_vec(), now);
        info!(
            total = catalog.total_count,
            enriched = report.enriched,
            skipped = report.skipped,
            pruned = report.pruned,
            "merge pass complete"
        );
        progress.done(&report);

        MergeOutcome { catalog, report }
    }
}
