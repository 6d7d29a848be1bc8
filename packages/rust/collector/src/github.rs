//! GitHub repository search client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use mcpinsider_shared::{CollectorConfig, InsiderError, Result, SourceRecord};

use crate::SourceFetcher;

/// User-Agent string for API requests (GitHub rejects requests without one).
pub(crate) const USER_AGENT: &str = concat!("mcpinsider/", env!("CARGO_PKG_VERSION"));

/// Default timeout in seconds for a search request.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<RepoItem>,
}

#[derive(Debug, Deserialize)]
struct RepoItem {
    full_name: String,
    html_url: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    stargazers_count: u64,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    license: Option<LicenseItem>,
}

#[derive(Debug, Deserialize)]
struct LicenseItem {
    #[serde(default)]
    spdx_id: Option<String>,
}

impl From<RepoItem> for SourceRecord {
    fn from(item: RepoItem) -> Self {
        Self {
            name: item.full_name,
            url: item.html_url,
            description: item.description,
            stars: item.stargazers_count,
            updated_at: item.updated_at,
            language: item.language,
            license: item.license.and_then(|l| l.spdx_id),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Searches GitHub repositories, most-starred first.
pub struct GitHubClient {
    client: Client,
    search_url: Url,
    token: Option<String>,
    per_page: u32,
}

impl GitHubClient {
    /// Build a client from the collector config, picking up a token from the
    /// configured env vars.
    pub fn new(config: &CollectorConfig) -> Result<Self> {
        let mut base = Url::parse(&config.api_base)
            .map_err(|e| InsiderError::config(format!("invalid GitHub API base: {e}")))?;
        // Enterprise bases carry a path prefix (`/api/v3`) that `join` must keep.
        if !base.path().ends_with('/') {
            let prefixed = format!("{}/", base.path());
            base.set_path(&prefixed);
        }
        let search_url = base
            .join("search/repositories")
            .map_err(|e| InsiderError::config(format!("invalid GitHub API base: {e}")))?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| InsiderError::Upstream(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            search_url,
            token: config.resolve_token(),
            per_page: config.per_page,
        })
    }

    /// Override the token resolved from the environment.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

#[async_trait]
impl SourceFetcher for GitHubClient {
    async fn fetch_page(&self, query: &str, page: u32) -> Result<Vec<SourceRecord>> {
        debug!(query, page, per_page = self.per_page, "searching repositories");

        let mut request = self
            .client
            .get(self.search_url.clone())
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .query(&[
                ("q", query.to_string()),
                ("sort", "stars".to_string()),
                ("order", "desc".to_string()),
                ("page", page.to_string()),
                ("per_page", self.per_page.to_string()),
            ]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| InsiderError::Upstream(format!("search page {page}: {e}")))?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(InsiderError::Upstream(format!(
                "rate limited on page {page} (HTTP {status})"
            )));
        }
        if !status.is_success() {
            return Err(InsiderError::Upstream(format!(
                "search page {page}: HTTP {status}"
            )));
        }

        let body: SearchResponse = response.json().await.map_err(|e| {
            InsiderError::Upstream(format!("search page {page}: invalid response body: {e}"))
        })?;

        Ok(body.items.into_iter().map(SourceRecord::from).collect())
    }
}
