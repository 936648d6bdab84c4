//! Engine configuration.
//!
//! Loaded from TOML with every section optional, then overridden from
//! `ANALYST_*` environment variables. Endpoints and credentials are not
//! configured here; they belong to the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::citations::CitationTolerance;
use crate::data::ExecutorOptions;
use crate::debate::OrchestratorSettings;
use crate::resilience::RetryPolicy;
use crate::synthesis::SynthesisSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Results dated older than this are flagged stale.
    pub max_data_age_days: i64,
    /// Force one TTL for every query.
    pub ttl_override_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_data_age_days: 400,
            ttl_override_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub retry: RetryPolicy,
    /// Consecutive exhausted fetches before a dataset's circuit opens; 0 disables.
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub max_concurrency: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self { max_concurrency: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebateSection {
    pub session_deadline_secs: u64,
    pub turn_timeout_secs: u64,
    pub turn_retries: u32,
    pub generation_concurrency: usize,
    pub convergence_threshold: f64,
    /// Defaults to the tier's convergence check interval.
    pub convergence_window: Option<u32>,
    pub narrative_timeout_secs: u64,
}

impl Default for DebateSection {
    fn default() -> Self {
        Self {
            session_deadline_secs: 180,
            turn_timeout_secs: 45,
            turn_retries: 1,
            generation_concurrency: 3,
            convergence_threshold: 0.2,
            convergence_window: None,
            narrative_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CitationConfig {
    pub relative_tolerance: f64,
    pub absolute_tolerance: f64,
}

impl Default for CitationConfig {
    fn default() -> Self {
        let tol = CitationTolerance::default();
        Self {
            relative_tolerance: tol.relative,
            absolute_tolerance: tol.absolute,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub timeout_ms: u64,
    pub max_claims: usize,
    pub concurrency: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_claims: 20,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
    /// 0 disables heartbeats.
    pub heartbeat_secs: u64,
    pub record_history: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: crate::events::CHANNEL_CAPACITY,
            heartbeat_secs: 15,
            record_history: false,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalystConfig {
    pub cache: CacheConfig,
    pub backend: BackendConfig,
    pub prefetch: PrefetchConfig,
    pub debate: DebateSection,
    pub citations: CitationConfig,
    pub verification: VerificationConfig,
    pub events: EventsConfig,
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

macro_rules! override_from_env {
    ($target:expr, $var:literal) => {
        if let Some(v) = env_parse($var)? {
            $target = v;
        }
    };
}

impl AnalystConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// File (or defaults), then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_path(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ANALYST_*` overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        override_from_env!(self.debate.session_deadline_secs, "ANALYST_SESSION_DEADLINE_SECS");
        override_from_env!(self.debate.turn_timeout_secs, "ANALYST_TURN_TIMEOUT_SECS");
        override_from_env!(self.debate.generation_concurrency, "ANALYST_GENERATION_CONCURRENCY");
        override_from_env!(self.debate.convergence_threshold, "ANALYST_CONVERGENCE_THRESHOLD");
        override_from_env!(self.prefetch.max_concurrency, "ANALYST_PREFETCH_CONCURRENCY");
        override_from_env!(self.backend.retry.max_attempts, "ANALYST_BACKEND_MAX_ATTEMPTS");
        override_from_env!(self.cache.max_data_age_days, "ANALYST_MAX_DATA_AGE_DAYS");
        override_from_env!(self.events.heartbeat_secs, "ANALYST_HEARTBEAT_SECS");
        if let Some(window) = env_parse::<u32>("ANALYST_CONVERGENCE_WINDOW")? {
            self.debate.convergence_window = Some(window);
        }
        if let Some(ttl) = env_parse::<u64>("ANALYST_TTL_OVERRIDE_SECS")? {
            self.cache.ttl_override_secs = Some(ttl);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{} must be in [0, 1], got {}", name, v)))
            }
        };
        let positive = |name: &str, v: u64| {
            if v > 0 {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{} must be greater than zero", name)))
            }
        };

        positive("prefetch.max_concurrency", self.prefetch.max_concurrency as u64)?;
        positive("debate.generation_concurrency", self.debate.generation_concurrency as u64)?;
        positive("debate.session_deadline_secs", self.debate.session_deadline_secs)?;
        positive("debate.turn_timeout_secs", self.debate.turn_timeout_secs)?;
        positive("backend.retry.max_attempts", self.backend.retry.max_attempts as u64)?;
        positive("verification.concurrency", self.verification.concurrency as u64)?;
        positive("events.channel_capacity", self.events.channel_capacity as u64)?;
        unit("debate.convergence_threshold", self.debate.convergence_threshold)?;
        unit("citations.relative_tolerance", self.citations.relative_tolerance)?;
        if self.citations.absolute_tolerance < 0.0 {
            return Err(ConfigError::Invalid(
                "citations.absolute_tolerance must not be negative".to_string(),
            ));
        }
        if self.debate.convergence_window == Some(0) {
            return Err(ConfigError::Invalid(
                "debate.convergence_window must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_deadline(&self) -> Duration {
        Duration::from_secs(self.debate.session_deadline_secs)
    }

    pub fn ttl_override(&self) -> Option<Duration> {
        self.cache.ttl_override_secs.map(Duration::from_secs)
    }

    pub fn heartbeat(&self) -> Option<Duration> {
        (self.events.heartbeat_secs > 0).then(|| Duration::from_secs(self.events.heartbeat_secs))
    }

    pub fn citation_tolerance(&self) -> CitationTolerance {
        CitationTolerance {
            relative: self.citations.relative_tolerance,
            absolute: self.citations.absolute_tolerance,
        }
    }

    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            retry: self.backend.retry.clone(),
            max_data_age: chrono::Duration::days(self.cache.max_data_age_days),
            failure_threshold: self.backend.failure_threshold,
            cooldown_secs: self.backend.cooldown_secs,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            turn_timeout: Duration::from_secs(self.debate.turn_timeout_secs),
            turn_retries: self.debate.turn_retries,
            generation_concurrency: self.debate.generation_concurrency,
            convergence_threshold: self.debate.convergence_threshold,
            convergence_window: self.debate.convergence_window,
            citation_tolerance: self.citation_tolerance(),
        }
    }

    pub fn synthesis_settings(&self) -> SynthesisSettings {
        SynthesisSettings {
            narrative_timeout: Duration::from_secs(self.debate.narrative_timeout_secs),
            verification_timeout: Duration::from_millis(self.verification.timeout_ms),
            max_claims: self.verification.max_claims,
            verification_concurrency: self.verification.concurrency,
            citation_tolerance: self.citation_tolerance(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = AnalystConfig::default();
        config.validate().unwrap();
        assert_eq!(config.debate.turn_retries, 1);
        assert_eq!(config.backend.retry.max_attempts, 3);
        assert_eq!(config.orchestrator_settings().convergence_window, None);
    }

    #[test]
    fn test_partial_toml() {
        let config = AnalystConfig::from_toml_str(
            r#"
            [debate]
            session_deadline_secs = 30
            convergence_window = 4

            [backend.retry]
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.debate.session_deadline_secs, 30);
        assert_eq!(config.debate.convergence_window, Some(4));
        assert_eq!(config.debate.turn_timeout_secs, 45);
        assert_eq!(config.backend.retry.max_attempts, 5);
        assert_eq!(config.backend.retry.initial_backoff_ms, 200);
        assert_eq!(config.session_deadline(), Duration::from_secs(30));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AnalystConfig::default();
        config.debate.convergence_threshold = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AnalystConfig::default();
        config.prefetch.max_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = AnalystConfig::default();
        config.backend.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[prefetch]\nmax_concurrency = 2").unwrap();
        let config = AnalystConfig::from_path(file.path()).unwrap();
        assert_eq!(config.prefetch.max_concurrency, 2);

        let missing = AnalystConfig::from_path(Path::new("/nonexistent/analyst.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_garbage_is_parse_error() {
        assert!(matches!(
            AnalystConfig::from_toml_str("[debate\nbroken"),
            Err(ConfigError::Parse(_))
        ));
    }
}
