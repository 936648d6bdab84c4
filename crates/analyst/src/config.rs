use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmEndpoint {
    /// Base URL including the API version, e.g. `http://localhost:8080/v1`.
    pub url: String,
    pub model: String,
    /// Sent as a bearer token when present.
    pub api_key: Option<String>,
    pub temperature: f32,
    /// Per-request timeout; the debate applies its own turn timeout on top.
    pub request_timeout: Duration,
}

/// Process-level settings read from the environment.
///
/// Engine tuning lives in the TOML config; this only covers what the binary
/// needs to reach the outside world.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub llm: LlmEndpoint,
    /// Postgres connection string; SQL queries fail without it.
    pub database_url: Option<String>,
    /// Timeout for HTTP data sources.
    pub http_timeout: Duration,
    /// Definitions file used when `--definitions` is not given.
    pub definitions_path: PathBuf,
}

fn env_secs(var: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(var)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default),
    )
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            llm: LlmEndpoint {
                url: std::env::var("ANALYST_LLM_URL")
                    .unwrap_or_else(|_| "http://localhost:8080/v1".into()),
                model: std::env::var("ANALYST_LLM_MODEL")
                    .unwrap_or_else(|_| "qwen2.5-32b-instruct".into()),
                api_key: std::env::var("ANALYST_LLM_API_KEY").ok(),
                temperature: std::env::var("ANALYST_LLM_TEMPERATURE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0.3),
                request_timeout: env_secs("ANALYST_LLM_TIMEOUT_SECS", 60),
            },
            database_url: std::env::var("ANALYST_DATABASE_URL").ok(),
            http_timeout: env_secs("ANALYST_HTTP_TIMEOUT_SECS", 15),
            definitions_path: std::env::var("ANALYST_DEFINITIONS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("queries.toml")),
        }
    }
}

impl RuntimeConfig {
    /// Redacted one-line description for startup logs.
    pub fn describe(&self) -> String {
        format!(
            "llm={} model={} key={} database={}",
            self.llm.url,
            self.llm.model,
            if self.llm.api_key.is_some() { "set" } else { "none" },
            if self.database_url.is_some() { "configured" } else { "none" },
        )
    }
}

/// Check if the generation endpoint is reachable (GET /models).
pub async fn check_endpoint(url: &str) -> bool {
    let models_url = format!("{}/models", url.trim_end_matches('/'));
    match reqwest::Client::new()
        .get(&models_url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}
