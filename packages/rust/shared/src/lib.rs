//! Shared types, error model, and configuration for MCP Insider.
//!
//! This crate is the foundation depended on by all other MCP Insider crates.
//! It provides:
//! - [`InsiderError`]: the unified error type
//! - Domain types ([`SourceRecord`], [`CatalogEntry`], [`Catalog`], [`PipelineSettings`])
//! - Configuration ([`AppConfig`], [`CollectorConfig`], config loading)

pub mod config;
pub mod error;
pub mod persist;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AnalyzerConfig, AppConfig, CollectorConfig, INTERVAL_HOURS_RANGE, NewsConfig, PathsConfig, ServerConfig,
    StagesConfig, WatchConfig, config_dir, config_file_path, init_config, load_config,
    load_config_from, resolve_api_key, save_config_to, update_collector_config,
};
pub use error::{ErrorClass, InsiderError, Result};
pub use persist::write_atomic;
pub use types::{
    Annotation, Catalog, CatalogEntry, EntryStatus, FeedSource, NewsItem, PipelineSettings, RawBatch,
    SafetyLevel, SourceRecord,
};
