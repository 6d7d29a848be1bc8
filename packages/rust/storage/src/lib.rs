//! Key → JSON document storage.
//!
//! Every logical entity (catalog, settings, latest raw batch, historical raw
//! snapshots, news feeds and digest) is one JSON document. The [`DocumentStore`] trait is the
//! persistence capability; [`JsonFileStore`] keeps documents as files under a
//! data directory and [`MemoryStore`] backs tests.
//!
//! **Access rules:**
//! - Documents are read and written whole; there is no optimistic
//!   concurrency check, so concurrent writers race and the last one wins.
//! - A failed save leaves the previous document intact: each save writes its
//!   own temp file and renames it over the target.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;

use mcpinsider_shared::{
    Catalog, FeedSource, InsiderError, NewsItem, PipelineSettings, RawBatch, Result, write_atomic,
};

/// Subdirectory holding timestamped raw batch snapshots.
const HISTORY_DIR: &str = "history";

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Identifies one persisted document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocKey {
    /// The enriched catalog.
    Catalog,
    /// Operator pipeline settings.
    Settings,
    /// The most recent collection output.
    RawBatch,
    /// A historical collection output, keyed by its timestamp.
    RawSnapshot(DateTime<Utc>),
    /// Feeds the news digest reads.
    NewsFeeds,
    /// The summarized news digest.
    News,
}

impl DocKey {
    /// Path of the document relative to the store root.
    pub fn relative_path(&self) -> PathBuf {
        match self {
            Self::Catalog => PathBuf::from("analyzed_data.json"),
            Self::Settings => PathBuf::from("settings.json"),
            Self::RawBatch => PathBuf::from("raw_data.json"),
            Self::RawSnapshot(ts) => Path::new(HISTORY_DIR).join(format!(
                "raw_data_{}.json",
                ts.format("%Y-%m-%dT%H-%M-%S-%3fZ")
            )),
            Self::NewsFeeds => PathBuf::from("news_feeds.json"),
            Self::News => PathBuf::from("news_data.json"),
        }
    }
}

impl std::fmt::Display for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.relative_path().display())
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Whole-document persistence capability.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load a document. `Ok(None)` means it has never been written.
    async fn load(&self, key: &DocKey) -> Result<Option<Value>>;

    /// Replace a document.
    async fn save(&self, key: &DocKey, doc: &Value) -> Result<()>;
}

// ---------------------------------------------------------------------------
// JSON file store
// ---------------------------------------------------------------------------

/// Documents stored as pretty-printed JSON files under a root directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &DocKey) -> PathBuf {
        self.root.join(key.relative_path())
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn load(&self, key: &DocKey) -> Result<Option<Value>> {
        let path = self.path_for(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(InsiderError::io(&path, e)),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| InsiderError::storage(key.to_string(), format!("invalid JSON: {e}")))
    }

    async fn save(&self, key: &DocKey, doc: &Value) -> Result<()> {
        let path = self.path_for(key);
        let body = serde_json::to_vec_pretty(doc)
            .map_err(|e| InsiderError::storage(key.to_string(), e.to_string()))?;

        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &body))
            .await
            .map_err(|e| InsiderError::io(&path, std::io::Error::other(e)))??;

        tracing::debug!(%key, path = %path.display(), "document saved");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<DocKey, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored.
    pub async fn keys(&self) -> Vec<DocKey> {
        self.docs.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load(&self, key: &DocKey) -> Result<Option<Value>> {
        Ok(self.docs.lock().await.get(key).cloned())
    }

    async fn save(&self, key: &DocKey, doc: &Value) -> Result<()> {
        self.docs.lock().await.insert(key.clone(), doc.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Typed access
// ---------------------------------------------------------------------------

/// Typed view over a [`DocumentStore`] for the pipeline's documents.
#[derive(Clone)]
pub struct Documents {
    store: Arc<dyn DocumentStore>,
}

impl Documents {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Documents backed by JSON files under `data_dir`.
    pub fn open_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(JsonFileStore::new(data_dir)))
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    async fn load_typed<T: DeserializeOwned>(&self, key: &DocKey) -> Result<Option<T>> {
        match self.store.load(key).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| InsiderError::storage(key.to_string(), format!("decode failed: {e}"))),
            None => Ok(None),
        }
    }

    async fn save_typed<T: Serialize>(&self, key: &DocKey, doc: &T) -> Result<()> {
        let value = serde_json::to_value(doc)
            .map_err(|e| InsiderError::storage(key.to_string(), format!("encode failed: {e}")))?;
        self.store.save(key, &value).await
    }

    /// The persisted catalog, or an empty one if none was written yet.
    pub async fn catalog(&self) -> Result<Catalog> {
        Ok(self.load_typed(&DocKey::Catalog).await?.unwrap_or_default())
    }

    pub async fn save_catalog(&self, catalog: &Catalog) -> Result<()> {
        self.save_typed(&DocKey::Catalog, catalog).await
    }

    /// Persisted settings, or defaults if none were written yet.
    pub async fn settings(&self) -> Result<PipelineSettings> {
        Ok(self.load_typed(&DocKey::Settings).await?.unwrap_or_default())
    }

    pub async fn save_settings(&self, settings: &PipelineSettings) -> Result<()> {
        self.save_typed(&DocKey::Settings, settings).await
    }

    /// The latest raw batch, if a collection pass has run.
    pub async fn raw_batch(&self) -> Result<Option<RawBatch>> {
        self.load_typed(&DocKey::RawBatch).await
    }

    /// Save a raw batch as the latest batch and as a history snapshot.
    pub async fn save_raw_batch(&self, batch: &RawBatch) -> Result<()> {
        self.save_typed(&DocKey::RawBatch, batch).await?;
        self.save_typed(&DocKey::RawSnapshot(batch.timestamp), batch)
            .await
    }

    /// Configured news feeds, `None` if the feed list was never written.
    pub async fn news_feeds(&self) -> Result<Option<Vec<FeedSource>>> {
        self.load_typed(&DocKey::NewsFeeds).await
    }

    pub async fn save_news_feeds(&self, feeds: &[FeedSource]) -> Result<()> {
        self.save_typed(&DocKey::NewsFeeds, &feeds).await
    }

    /// The news digest, newest first; empty if none was written yet.
    pub async fn news(&self) -> Result<Vec<NewsItem>> {
        Ok(self.load_typed(&DocKey::News).await?.unwrap_or_default())
    }

    pub async fn save_news(&self, items: &[NewsItem]) -> Result<()> {
        self.save_typed(&DocKey::News, &items).await
    }
}
