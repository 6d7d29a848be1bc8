//! Application configuration for MCP Insider.
//!
//! User config lives at `~/.mcpinsider/mcpinsider.toml` unless `--config`
//! points elsewhere. The `[collector]` table is also the live configuration
//! source for the adaptive scheduler: rewriting the file reschedules a
//! running daemon.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{InsiderError, Result};
use crate::persist::write_atomic;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "mcpinsider.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".mcpinsider";

/// Allowed range for `collector.interval_hours` (one hour to one week).
pub const INTERVAL_HOURS_RANGE: std::ops::RangeInclusive<u32> = 1..=168;

// ---------------------------------------------------------------------------
// Config structs (matching mcpinsider.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub collector: CollectorConfig,

    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    #[serde(default)]
    pub server: ServerConfig,

    /// Command overrides for the streaming gateway.
    #[serde(default)]
    pub stages: StagesConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub news: NewsConfig,
}

/// `[paths]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding the catalog, settings, raw batches and stage logs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// `[collector]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Scheduled runs are skipped while this is false.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Search query sent to the source.
    #[serde(default = "default_source_selector")]
    pub source_selector: String,

    /// Hours between scheduled runs, 1-168.
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u32,

    #[serde(default = "default_per_page")]
    pub per_page: u32,

    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Pause between page requests.
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,

    #[serde(default = "default_github_api")]
    pub api_base: String,

    /// Env vars checked, in order, for a GitHub token.
    #[serde(default = "default_token_env")]
    pub token_env: Vec<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source_selector: default_source_selector(),
            interval_hours: default_interval_hours(),
            per_page: default_per_page(),
            max_pages: default_max_pages(),
            page_delay_ms: default_page_delay_ms(),
            api_base: default_github_api(),
            token_env: default_token_env(),
        }
    }
}

impl CollectorConfig {
    /// Reject values the scheduler and collector cannot act on.
    pub fn validate(&self) -> Result<()> {
        if !INTERVAL_HOURS_RANGE.contains(&self.interval_hours) {
            return Err(InsiderError::config(format!(
                "collector.interval_hours must be within 1..=168, got {}",
                self.interval_hours
            )));
        }
        if self.source_selector.trim().is_empty() {
            return Err(InsiderError::config("collector.source_selector is empty"));
        }
        if self.per_page == 0 || self.per_page > 100 {
            return Err(InsiderError::config(format!(
                "collector.per_page must be within 1..=100, got {}",
                self.per_page
            )));
        }
        url::Url::parse(&self.api_base).map_err(|e| {
            InsiderError::config(format!("collector.api_base is not a URL: {e}"))
        })?;
        Ok(())
    }

    /// First non-empty token found in the configured env vars.
    pub fn resolve_token(&self) -> Option<String> {
        self.token_env
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .find(|value| !value.is_empty())
    }
}

fn default_true() -> bool {
    true
}
fn default_source_selector() -> String {
    "topic:model-context-protocol".into()
}
fn default_interval_hours() -> u32 {
    24
}
fn default_per_page() -> u32 {
    30
}
fn default_max_pages() -> u32 {
    3
}
fn default_page_delay_ms() -> u64 {
    1_000
}
fn default_github_api() -> String {
    "https://api.github.com".into()
}
fn default_token_env() -> Vec<String> {
    vec!["GITHUB_TOKEN".into(), "GH_TOKEN".into()]
}

/// `[analyzer]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Models tried in order; a model reported missing is never retried.
    #[serde(default = "default_models")]
    pub models: Vec<String>,

    /// Pause between enrichment calls.
    #[serde(default = "default_call_delay_ms")]
    pub call_delay_ms: u64,

    #[serde(default = "default_gemini_api")]
    pub api_base: String,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            models: default_models(),
            call_delay_ms: default_call_delay_ms(),
            api_base: default_gemini_api(),
        }
    }
}

fn default_api_key_env() -> String {
    "GEMINI_API_KEY".into()
}
fn default_models() -> Vec<String> {
    vec![
        "gemini-1.5-flash".into(),
        "gemini-2.0-flash".into(),
        "gemini-1.5-pro".into(),
        "gemini-pro".into(),
    ]
}
fn default_call_delay_ms() -> u64 {
    2_000
}
fn default_gemini_api() -> String {
    "https://generativelanguage.googleapis.com".into()
}

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3000".into()
}

/// `[stages]` section: argv overrides per stage. Unset stages use built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyze: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<Vec<String>>,
    /// Working directory for stage subprocesses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

/// `[watch]` section: config change notification tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Wait after a detected change so a half-written file is not read.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    100
}

/// `[news]` section: the feed digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsConfig {
    /// Newest items taken from each feed per run.
    #[serde(default = "default_items_per_feed")]
    pub items_per_feed: usize,
    /// Items kept in the digest, newest first.
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// Article text sent to the model is cut to this many characters.
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
}

impl Default for NewsConfig {
    fn default() -> Self {
        Self {
            items_per_feed: default_items_per_feed(),
            max_items: default_max_items(),
            excerpt_chars: default_excerpt_chars(),
        }
    }
}

fn default_items_per_feed() -> usize {
    3
}
fn default_max_items() -> usize {
    50
}
fn default_excerpt_chars() -> usize {
    2_000
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.mcpinsider/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| InsiderError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.mcpinsider/mcpinsider.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the config at `path`. Returns defaults if the file does not exist.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| InsiderError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| InsiderError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Write `config` to `path`, replacing the file in one rename so watchers
/// never observe a partial write.
pub fn save_config_to(path: &Path, config: &AppConfig) -> Result<()> {
    let content =
        toml::to_string_pretty(config).map_err(|e| InsiderError::config(e.to_string()))?;

    write_atomic(path, content.as_bytes())
}

/// Replace only the `[collector]` table of the config at `path`.
pub fn update_collector_config(path: &Path, collector: CollectorConfig) -> Result<AppConfig> {
    collector.validate()?;
    let mut config = load_config(path)?;
    config.collector = collector;
    save_config_to(path, &config)?;
    tracing::info!(
        ?path,
        interval_hours = config.collector.interval_hours,
        enabled = config.collector.enabled,
        "collector config updated"
    );
    Ok(config)
}

/// Write a default config file at `path`. Returns the path.
pub fn init_config(path: &Path) -> Result<PathBuf> {
    save_config_to(path, &AppConfig::default())?;
    tracing::info!(?path, "created default config file");
    Ok(path.to_path_buf())
}

/// Check that the enrichment API key env var is set and non-empty.
pub fn resolve_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.analyzer.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(InsiderError::config(format!(
            "enrichment API key not found. Set the {var_name} environment variable."
        ))),
    }
}
