//! Repository enrichment through a text-generation model.
//!
//! [`TextGenerator`] is the model capability; [`GeminiClient`] implements it
//! over the Generative Language REST API. [`EnrichmentSession`] carries the
//! sticky model pointer: once a model is reported missing it is skipped for
//! every later call made through the same session.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use mcpinsider_shared::{AnalyzerConfig, Annotation, InsiderError, Result, SourceRecord};

/// Default timeout for one generation request.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Categories the model is asked to choose from.
pub const CATEGORIES: &[&str] = &[
    "Database",
    "Search",
    "API",
    "Utility",
    "Automation",
    "DevTools",
    "Communication",
];

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// Produces free text for a prompt with a named model.
///
/// Implementations report a missing model as
/// [`InsiderError::ModelUnavailable`] so the session can fall back.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, model: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Gemini client
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<RequestContent<'a>>,
}

#[derive(Serialize)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

/// Client for the Gemini `generateContent` endpoint.
pub struct GeminiClient {
    client: Client,
    api_base: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(config: &AnalyzerConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| InsiderError::Upstream(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, prompt: &str, model: &str) -> Result<String> {
        let url = format!("{}/v1beta/models/{model}:generateContent", self.api_base);
        let body = GenerateRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart { text: prompt }],
            }],
        };

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| InsiderError::Upstream(format!("{model}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            if status == StatusCode::NOT_FOUND || detail.to_lowercase().contains("not found") {
                return Err(InsiderError::ModelUnavailable {
                    model: model.to_string(),
                });
            }
            return Err(InsiderError::Upstream(format!(
                "{model}: HTTP {status}: {}",
                detail.chars().take(200).collect::<String>()
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| InsiderError::Upstream(format!("{model}: invalid response body: {e}")))?;

        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(InsiderError::parse(format!("{model} returned no text")));
        }
        Ok(text)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Ordered model list plus the index of the model currently in use.
#[derive(Debug, Clone)]
pub struct EnrichmentSession {
    models: Vec<String>,
    current: usize,
}

impl EnrichmentSession {
    pub fn new(models: Vec<String>) -> Self {
        Self { models, current: 0 }
    }

    pub fn from_config(config: &AnalyzerConfig) -> Self {
        Self::new(config.models.clone())
    }

    /// Model the next call will use, `None` once every model is exhausted.
    pub fn current_model(&self) -> Option<&str> {
        self.models.get(self.current).map(String::as_str)
    }

    pub fn is_exhausted(&self) -> bool {
        self.current >= self.models.len()
    }

    /// Annotate one record.
    ///
    /// Returns `Ok(None)` when the record is skipped (transport failure, rate
    /// limit, unparseable output) and `Err(ModelsExhausted)` when no model is
    /// left to try. A model reported unavailable advances the pointer and the
    /// same record is retried with the next model.
    pub async fn annotate(
        &mut self,
        generator: &dyn TextGenerator,
        record: &SourceRecord,
    ) -> Result<Option<Annotation>> {
        debug!(repo = %record.name, "requesting annotation");
        let text = match self.generate(generator, &build_prompt(record)).await {
            Ok(text) => text,
            Err(InsiderError::ModelsExhausted) => return Err(InsiderError::ModelsExhausted),
            Err(e) => {
                warn!(repo = %record.name, error = %e, class = %e.class(), "enrichment failed, skipping");
                return Ok(None);
            }
        };

        match parse_annotation(&text) {
            Ok(annotation) => Ok(Some(annotation)),
            Err(e) => {
                warn!(repo = %record.name, error = %e, "unparseable model output, skipping");
                Ok(None)
            }
        }
    }

    /// Run `prompt` on the current model.
    ///
    /// A model reported unavailable advances the pointer and the prompt is
    /// retried with the next one; any other error is returned unchanged.
    pub async fn generate(&mut self, generator: &dyn TextGenerator, prompt: &str) -> Result<String> {
        loop {
            let Some(model) = self.current_model().map(str::to_owned) else {
                warn!("no working models left");
                return Err(InsiderError::ModelsExhausted);
            };

            debug!(%model, "generating");
            match generator.generate(prompt, &model).await {
                Err(InsiderError::ModelUnavailable { .. }) => {
                    self.current += 1;
                    info!(
                        %model,
                        next = self.current_model().unwrap_or("none"),
                        "model not found, trying next"
                    );
                }
                other => return other,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Prompt + parsing
// ---------------------------------------------------------------------------

/// The outermost `{...}` span of model output, ignoring fences and prose.
pub(crate) fn json_object(text: &str) -> Result<&str> {
    static OBJECT_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

    OBJECT_RE
        .find(text)
        .map(|m| m.as_str())
        .ok_or_else(|| InsiderError::parse("no JSON object in model output"))
}

/// Prompt asking for a JSON annotation of one repository.
pub fn build_prompt(record: &SourceRecord) -> String {
    format!(
        "You are an engineer and tech writer who follows developer tooling closely.\n\
         Analyze the following MCP (Model Context Protocol) server repository and write \
         an introduction that makes developers want to try it. Write text fields in Japanese.\n\
         \n\
         Repository: {name}\n\
         Description: {description}\n\
         URL: {url}\n\
         \n\
         Respond with a JSON object with these fields:\n\
         - summary: an engaging overview of about 140 characters\n\
         - catchphrase: a one-line hook\n\
         - wow_factor: one sentence on what is technically unique\n\
         - dev_utility: how much it improves developer productivity, an integer 1-10\n\
         - categories: one or more of {categories}\n\
         - safety_level: \"Safe\" (read-only), \"Caution\" (needs write or exec access) or \"Unknown\"\n\
         - use_cases: two or three concrete scenarios\n\
         \n\
         Output only the JSON object, without a markdown code block.",
        name = record.name,
        description = record.description.as_deref().unwrap_or("(none)"),
        url = record.url,
        categories = CATEGORIES.join(", "),
    )
}

/// Extract and normalize an [`Annotation`] from raw model output.
///
/// Tolerates code fences and prose around the object, a single category
/// given as a string, and a utility score given as a string or float.
pub fn parse_annotation(text: &str) -> Result<Annotation> {
    let json = json_object(text)?;

    let mut value: Value =
        serde_json::from_str(json).map_err(|e| InsiderError::parse(format!("invalid JSON: {e}")))?;
    let obj = value
        .as_object_mut()
        .ok_or_else(|| InsiderError::parse("model output is not an object"))?;

    for key in ["categories", "category", "use_cases"] {
        if let Some(Value::String(s)) = obj.get(key) {
            let single = Value::Array(vec![Value::String(s.clone())]);
            obj.insert(key.to_string(), single);
        }
    }

    let utility = obj.remove("dev_utility").and_then(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    });
    if let Some(score) = utility {
        obj.insert(
            "dev_utility".to_string(),
            Value::from(score.round().clamp(1.0, 10.0) as u8),
        );
    }

    let annotation: Annotation = serde_json::from_value(value)
        .map_err(|e| InsiderError::parse(format!("annotation shape: {e}")))?;
    if annotation.summary.trim().is_empty() {
        return Err(InsiderError::parse("annotation has an empty summary"));
    }
    Ok(annotation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use mcpinsider_shared::SafetyLevel;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const GOOD: &str = r#"{"summary": "Fast file access", "categories": ["Utility"], "safety_level": "Caution", "dev_utility": 8}"#;

    /// Answers per model: `Err(ModelUnavailable)` for models listed as
    /// missing, otherwise the canned text. Records every model it was asked for.
    struct StubGenerator {
        missing: Vec<&'static str>,
        reply: Result<String>,
        calls: Mutex<Vec<String>>,
    }

    impl StubGenerator {
        fn new(missing: Vec<&'static str>, reply: Result<String>) -> Self {
            Self {
                missing,
                reply,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TextGenerator for StubGenerator {
        async fn generate(&self, _prompt: &str, model: &str) -> Result<String> {
            self.calls.lock().unwrap().push(model.to_string());
            if self.missing.contains(&model) {
                return Err(InsiderError::ModelUnavailable {
                    model: model.to_string(),
                });
            }
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(e) => Err(InsiderError::Upstream(e.to_string())),
            }
        }
    }

    fn record() -> SourceRecord {
        SourceRecord {
            name: "acme/files".into(),
            url: "https://github.com/acme/files".into(),
            description: Some("Filesystem server".into()),
            stars: 10,
            updated_at: None,
            language: None,
            license: None,
        }
    }

    fn session() -> EnrichmentSession {
        EnrichmentSession::new(vec!["m0".into(), "m1".into(), "m2".into()])
    }

    #[test]
    fn parses_fenced_output() {
        let text = format!("```json\n{GOOD}\n```");
        let annotation = parse_annotation(&text).expect("parse");
        assert_eq!(annotation.summary, "Fast file access");
        assert_eq!(annotation.safety_level, SafetyLevel::Caution);
        assert_eq!(annotation.dev_utility, Some(8));
    }

    #[test]
    fn normalizes_loose_fields() {
        let text = r#"Here you go: {"summary_ja": "概要", "category": "API", "dev_utility": "12.4", "safety_level": "Risky"}"#;
        let annotation = parse_annotation(text).expect("parse");
        assert_eq!(annotation.summary, "概要");
        assert_eq!(annotation.categories, vec!["API"]);
        assert_eq!(annotation.dev_utility, Some(10));
        assert_eq!(annotation.safety_level, SafetyLevel::Unknown);
    }

    #[test]
    fn rejects_output_without_object() {
        assert!(matches!(
            parse_annotation("sorry, I cannot help"),
            Err(InsiderError::Parse { .. })
        ));
        assert!(parse_annotation(r#"{"catchphrase": "no summary"}"#).is_err());
    }

    #[test]
    fn prompt_mentions_record() {
        let prompt = build_prompt(&record());
        assert!(prompt.contains("acme/files"));
        assert!(prompt.contains("https://github.com/acme/files"));
        assert!(prompt.contains("DevTools"));
    }

    #[tokio::test]
    async fn fallback_is_sticky() {
        let generator = StubGenerator::new(vec!["m0"], Ok(GOOD.into()));
        let mut session = session();

        let first = session.annotate(&generator, &record()).await.unwrap();
        assert!(first.is_some());
        let second = session.annotate(&generator, &record()).await.unwrap();
        assert!(second.is_some());

        assert_eq!(generator.calls(), vec!["m0", "m1", "m1"]);
        assert_eq!(session.current_model(), Some("m1"));
    }

    #[tokio::test]
    async fn other_failures_skip_the_record_only() {
        let generator = StubGenerator::new(vec![], Err(InsiderError::Upstream("HTTP 429".into())));
        let mut session = session();

        let result = session.annotate(&generator, &record()).await.unwrap();
        assert!(result.is_none());
        assert_eq!(session.current_model(), Some("m0"));
    }

    #[tokio::test]
    async fn exhausting_models_is_an_error() {
        let generator = StubGenerator::new(vec!["m0", "m1", "m2"], Ok(GOOD.into()));
        let mut session = session();

        let err = session.annotate(&generator, &record()).await.unwrap_err();
        assert!(matches!(err, InsiderError::ModelsExhausted));
        assert!(session.is_exhausted());
        assert_eq!(generator.calls().len(), 3);
    }

    #[tokio::test]
    async fn gemini_maps_404_to_model_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gone-model:generateContent"))
            .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
            .mount(&server)
            .await;

        let config = AnalyzerConfig {
            api_base: server.uri(),
            ..AnalyzerConfig::default()
        };
        let client = GeminiClient::new(&config, "k".into()).unwrap();
        let err = client.generate("hi", "gone-model").await.unwrap_err();
        assert!(matches!(err, InsiderError::ModelUnavailable { model } if model == "gone-model"));
    }

    #[tokio::test]
    async fn gemini_extracts_candidate_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
            .and(query_param("key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{"content": {"parts": [{"text": "{\"summary\":"}, {"text": " \"ok\"}"}]}}]
            })))
            .mount(&server)
            .await;

        let config = AnalyzerConfig {
            api_base: server.uri(),
            ..AnalyzerConfig::default()
        };
        let client = GeminiClient::new(&config, "secret".into()).unwrap();
        let text = client.generate("hi", "gemini-2.0-flash").await.unwrap();
        assert_eq!(parse_annotation(&text).unwrap().summary, "ok");
    }

    #[tokio::test]
    async fn gemini_rate_limit_is_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota exceeded"))
            .mount(&server)
            .await;

        let config = AnalyzerConfig {
            api_base: server.uri(),
            ..AnalyzerConfig::default()
        };
        let client = GeminiClient::new(&config, "k".into()).unwrap();
        let err = client.generate("hi", "m").await.unwrap_err();
        assert!(matches!(err, InsiderError::Upstream(_)));
    }
}
