//! Core domain types for the MCP Insider catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// SourceRecord
// ---------------------------------------------------------------------------

/// One repository as returned by a collection pass. Identity key is `url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Full repository name (`owner/repo`).
    pub name: String,
    /// Canonical HTML URL of the repository.
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub stars: u64,
    /// Last push/update time reported by the source.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub language: Option<String>,
    /// SPDX license identifier.
    #[serde(default)]
    pub license: Option<String>,
}

// ---------------------------------------------------------------------------
// Annotation
// ---------------------------------------------------------------------------

/// Risk level the enrichment model assigns to a server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyLevel {
    Safe,
    Caution,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Structured enrichment output attached to a catalog entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(alias = "summary_ja")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catchphrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wow_factor: Option<String>,
    /// Developer utility score, 1-10.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_utility: Option<u8>,
    #[serde(default, alias = "category")]
    pub categories: Vec<String>,
    #[serde(default)]
    pub safety_level: SafetyLevel,
    #[serde(default)]
    pub use_cases: Vec<String>,
}

// ---------------------------------------------------------------------------
// CatalogEntry
// ---------------------------------------------------------------------------

/// Publish state of a catalog entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    #[default]
    Draft,
    Published,
}

impl EntryStatus {
    /// Status for a freshly enriched record.
    ///
    /// A published entry stays published; otherwise `auto_publish` decides.
    pub fn reconcile(existing: Option<EntryStatus>, auto_publish: bool) -> Self {
        match existing {
            Some(Self::Published) => Self::Published,
            _ if auto_publish => Self::Published,
            _ => Self::Draft,
        }
    }
}

/// A catalog record for one source item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub record: SourceRecord,
    /// Enrichment output, absent if enrichment never succeeded.
    #[serde(default)]
    pub analysis: Option<Annotation>,
    #[serde(default)]
    pub status: EntryStatus,
    #[serde(default)]
    pub analyzed_at: Option<DateTime<Utc>>,
    /// Fields the pipeline does not model (operator annotations such as
    /// `featured`). Kept verbatim across edits and merge passes.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CatalogEntry {
    /// A new entry with no extra fields.
    pub fn new(
        record: SourceRecord,
        analysis: Option<Annotation>,
        status: EntryStatus,
        analyzed_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            record,
            analysis,
            status,
            analyzed_at,
            extra: Map::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.record.url
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// The persisted catalog document (`analyzed_data.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_count: usize,
    #[serde(default, alias = "projects")]
    pub entries: Vec<CatalogEntry>,
}

impl Catalog {
    /// Build a catalog from entries, recomputing the derived fields.
    pub fn from_entries(entries: Vec<CatalogEntry>, now: DateTime<Utc>) -> Self {
        Self {
            last_updated: Some(now),
            total_count: entries.len(),
            entries,
        }
    }

    pub fn find(&self, url: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.url() == url)
    }

    /// Position of the entry with this url.
    pub fn position(&self, url: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.url() == url)
    }

    /// Remove the entry with this url. Returns the removed entry, if any.
    pub fn remove(&mut self, url: &str) -> Option<CatalogEntry> {
        let idx = self.position(url)?;
        let removed = self.entries.remove(idx);
        self.total_count = self.entries.len();
        Some(removed)
    }
}

// ---------------------------------------------------------------------------
// PipelineSettings
// ---------------------------------------------------------------------------

/// Operator-tunable settings read at the start of every merge pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default)]
    pub auto_publish: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Persisted for catalog consumers; the pipeline does not act on it.
    #[serde(default)]
    pub maintenance_mode: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            auto_publish: false,
            retention_days: default_retention_days(),
            maintenance_mode: false,
        }
    }
}

fn default_retention_days() -> u32 {
    30
}

// ---------------------------------------------------------------------------
// News
// ---------------------------------------------------------------------------

/// One configured feed (`news_feeds.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSource {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub category: Option<String>,
}

/// One summarized article in the news digest (`news_data.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsItem {
    /// Title as published by the feed.
    pub title: String,
    pub title_ja: String,
    /// Article link; identity key of the digest.
    pub url: String,
    pub date: DateTime<Utc>,
    /// Name of the feed the item came from.
    pub source: String,
    #[serde(default)]
    pub category: Option<String>,
    pub summary_ja: String,
    pub slug: String,
}

// ---------------------------------------------------------------------------
// RawBatch
// ---------------------------------------------------------------------------

/// Output of one collection pass (`raw_data.json` and its history snapshots).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBatch {
    pub timestamp: DateTime<Utc>,
    pub total_count: usize,
    pub repositories: Vec<SourceRecord>,
}

impl RawBatch {
    pub fn new(repositories: Vec<SourceRecord>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            total_count: repositories.len(),
            repositories,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_never_downgrades() {
        assert_eq!(
            EntryStatus::reconcile(Some(EntryStatus::Published), false),
            EntryStatus::Published
        );
        assert_eq!(
            EntryStatus::reconcile(Some(EntryStatus::Draft), true),
            EntryStatus::Published
        );
        assert_eq!(EntryStatus::reconcile(None, false), EntryStatus::Draft);
    }

    #[test]
    fn catalog_accepts_legacy_projects_key() {
        let json = r#"{
            "last_updated": "2025-01-02T03:04:05Z",
            "total_count": 1,
            "projects": [{
                "name": "acme/server",
                "url": "https://github.com/acme/server",
                "stars": 12,
                "analysis": {"summary_ja": "概要", "category": ["API"], "safety_level": "Safe"},
                "status": "published",
                "analyzed_at": "2025-01-02T03:04:05Z"
            }]
        }"#;
        let catalog: Catalog = serde_json::from_str(json).expect("parse");
        assert_eq!(catalog.entries.len(), 1);
        let entry = &catalog.entries[0];
        assert_eq!(entry.status, EntryStatus::Published);
        let analysis = entry.analysis.as_ref().expect("analysis");
        assert_eq!(analysis.summary, "概要");
        assert_eq!(analysis.categories, vec!["API"]);
        assert_eq!(analysis.safety_level, SafetyLevel::Safe);
    }

    #[test]
    fn entry_serializes_flat() {
        let entry = CatalogEntry {
            record: SourceRecord {
                name: "acme/server".into(),
                url: "https://github.com/acme/server".into(),
                description: None,
                stars: 3,
                updated_at: None,
                language: Some("Rust".into()),
                license: None,
            },
            analysis: None,
            status: EntryStatus::Draft,
            analyzed_at: None,
            extra: Map::new(),
        };
        let value = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(value["url"], "https://github.com/acme/server");
        assert_eq!(value["status"], "draft");
        assert_eq!(value["language"], "Rust");
    }

    #[test]
    fn unmodelled_entry_fields_round_trip() {
        let json = r#"{
            "name": "acme/server",
            "url": "https://github.com/acme/server",
            "stars": 7,
            "status": "published",
            "featured": true,
            "note": "pin to top"
        }"#;
        let entry: CatalogEntry = serde_json::from_str(json).expect("parse");
        assert_eq!(entry.record.stars, 7);
        assert_eq!(entry.status, EntryStatus::Published);
        assert_eq!(entry.extra.len(), 2);
        assert_eq!(entry.extra["featured"], Value::Bool(true));

        let value = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(value["note"], "pin to top");
        assert_eq!(value["url"], "https://github.com/acme/server");
    }

    #[test]
    fn unknown_safety_level_falls_back() {
        let level: SafetyLevel = serde_json::from_str(r#""Dangerous""#).expect("parse");
        assert_eq!(level, SafetyLevel::Unknown);
    }

    #[test]
    fn settings_defaults_fill_missing_fields() {
        let settings: PipelineSettings = serde_json::from_str(r#"{"auto_publish": true}"#).unwrap();
        assert!(settings.auto_publish);
        assert_eq!(settings.retention_days, 30);
        assert!(!settings.maintenance_mode);
    }

    #[test]
    fn catalog_remove_recounts() {
        let mut catalog = Catalog::default();
        catalog.entries.push(CatalogEntry {
            record: SourceRecord {
                name: "a".into(),
                url: "u1".into(),
                description: None,
                stars: 0,
                updated_at: None,
                language: None,
                license: None,
            },
            analysis: None,
            status: EntryStatus::Draft,
            analyzed_at: None,
            extra: Map::new(),
        });
        catalog.total_count = 1;
        assert!(catalog.remove("missing").is_none());
        assert!(catalog.remove("u1").is_some());
        assert_eq!(catalog.total_count, 0);
    }
}
