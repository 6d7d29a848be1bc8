//! Operator actions on the persisted catalog, settings and collector config.
//!
//! These run outside any merge pass. Catalog edits are read-modify-write of
//! the whole document with no concurrency check, so an edit that lands while
//! a pass is running can be overwritten when the pass saves.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::info;

use mcpinsider_shared::{
    Catalog, CatalogEntry, CollectorConfig, InsiderError, PipelineSettings, Result, load_config,
    update_collector_config,
};
use mcpinsider_storage::Documents;

pub struct CatalogAdmin {
    docs: Documents,
    config_path: PathBuf,
}

impl CatalogAdmin {
    pub fn new(docs: Documents, config_path: impl Into<PathBuf>) -> Self {
        Self {
            docs,
            config_path: config_path.into(),
        }
    }

    pub async fn catalog(&self) -> Result<Catalog> {
        self.docs.catalog().await
    }

    /// Shallow-merge `fields` into the entry keyed by `url`.
    ///
    /// Rejects a non-object body, a body that changes `url`, and a merge
    /// result that is no longer a valid entry. Fields outside the entry
    /// model are stored as given.
    pub async fn update_entry(&self, url: &str, fields: Value) -> Result<CatalogEntry> {
        let Value::Object(fields) = fields else {
            return Err(InsiderError::validation("update body must be a JSON object"));
        };
        if fields.get("url").is_some_and(|v| v.as_str() != Some(url)) {
            return Err(InsiderError::validation("an entry's url cannot be changed"));
        }

        let mut catalog = self.docs.catalog().await?;
        let idx = catalog
            .position(url)
            .ok_or_else(|| InsiderError::not_found(format!("entry {url}")))?;

        let mut merged = serde_json::to_value(&catalog.entries[idx])
            .map_err(|e| InsiderError::storage("catalog", format!("encode failed: {e}")))?;
        if let Value::Object(obj) = &mut merged {
            obj.extend(fields);
        }
        let updated: CatalogEntry = serde_json::from_value(merged)
            .map_err(|e| InsiderError::validation(format!("invalid entry after update: {e}")))?;

        catalog.entries[idx] = updated.clone();
        self.docs.save_catalog(&catalog).await?;
        info!(%url, status = ?updated.status, "entry updated");
        Ok(updated)
    }

    /// Remove the entry keyed by `url`.
    pub async fn delete_entry(&self, url: &str) -> Result<CatalogEntry> {
        let mut catalog = self.docs.catalog().await?;
        let removed = catalog
            .remove(url)
            .ok_or_else(|| InsiderError::not_found(format!("entry {url}")))?;
        self.docs.save_catalog(&catalog).await?;
        info!(%url, remaining = catalog.total_count, "entry deleted");
        Ok(removed)
    }

    pub async fn settings(&self) -> Result<PipelineSettings> {
        self.docs.settings().await
    }

    /// Replace the settings document. The next merge pass picks it up.
    pub async fn replace_settings(&self, settings: PipelineSettings) -> Result<PipelineSettings> {
        self.docs.save_settings(&settings).await?;
        info!(
            auto_publish = settings.auto_publish,
            retention_days = settings.retention_days,
            maintenance_mode = settings.maintenance_mode,
            "settings replaced"
        );
        Ok(settings)
    }

    pub async fn collector_config(&self) -> Result<CollectorConfig> {
        let path = self.config_path.clone();
        on_blocking_pool(&self.config_path, move || Ok(load_config(&path)?.collector)).await
    }

    /// Rewrite `[collector]` in the config file; a running scheduler picks
    /// the change up through its file watcher.
    pub async fn replace_collector_config(
        &self,
        collector: CollectorConfig,
    ) -> Result<CollectorConfig> {
        let path = self.config_path.clone();
        on_blocking_pool(&self.config_path, move || {
            Ok(update_collector_config(&path, collector)?.collector)
        })
        .await
    }
}

/// Run config file I/O off the async workers.
async fn on_blocking_pool<T, F>(path: &Path, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| InsiderError::io(path, std::io::Error::other(e)))?
}
