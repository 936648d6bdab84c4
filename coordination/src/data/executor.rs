//! `execute_cached`: registry lookup, parameter binding, single-flight cache,
//! circuit breaker and retrying backend call, in that order.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::backend::{bind_params, BackendSet, BoundParam, QueryBackend};
use super::cache::{CacheKey, CacheStats, Cached, SingleFlightCache};
use super::circuit_breaker::CircuitBreaker;
use super::error::DataError;
use super::registry::QueryRegistry;
use super::types::{
    normalize_percent, numeric_value, param_fingerprint, Freshness, Provenance, QueryDefinition,
    QueryParams, QueryResult, Row,
};
use crate::resilience::{retry_with_backoff, RetryPolicy};

/// Cache of fetched results. Values are shared, never copied per caller.
pub type ResultCache = SingleFlightCache<Arc<QueryResult>, DataError>;

/// Knobs for [`QueryExecutor`].
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub retry: RetryPolicy,
    /// Results with an as-of date older than this are flagged stale.
    pub max_data_age: chrono::Duration,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_data_age: chrono::Duration::days(400),
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

pub struct QueryExecutor {
    registry: Arc<QueryRegistry>,
    backends: BackendSet,
    cache: ResultCache,
    breaker: Arc<Mutex<CircuitBreaker>>,
    options: ExecutorOptions,
}

impl QueryExecutor {
    pub fn new(registry: Arc<QueryRegistry>, backends: BackendSet, options: ExecutorOptions) -> Self {
        let breaker = CircuitBreaker::new(options.failure_threshold, options.cooldown_secs);
        Self {
            registry,
            backends,
            cache: ResultCache::new(),
            breaker: Arc::new(Mutex::new(breaker)),
            options,
        }
    }

    pub fn registry(&self) -> &Arc<QueryRegistry> {
        &self.registry
    }

    /// Run a registered query through the cache.
    ///
    /// A live entry is returned unless `invalidate` is set. Otherwise the
    /// backend is called (once across concurrent callers for the same key)
    /// and the result is stored for `ttl_override` or the definition's TTL.
    pub async fn execute_cached(
        &self,
        query_id: &str,
        params: &QueryParams,
        ttl_override: Option<Duration>,
        invalidate: bool,
    ) -> Result<Cached<Arc<QueryResult>>, DataError> {
        let definition = self.registry.get(query_id)?;
        let bound = bind_params(&definition, params)?;
        let kind = definition.backend_locator.kind();
        let backend = self
            .backends
            .get(kind)
            .ok_or_else(|| DataError::BackendMissing {
                query_id: query_id.to_string(),
                kind,
            })?;
        let source_type = self
            .registry
            .snapshot()
            .dataset(&definition.dataset)
            .map(|d| d.source_type.clone())
            .unwrap_or_else(|| kind.to_string());

        let key = CacheKey::new(query_id, param_fingerprint(params));
        let ttl = ttl_override.unwrap_or_else(|| definition.ttl());
        let fetch = FetchJob {
            definition,
            source_type,
            backend,
            bound,
            breaker: Arc::clone(&self.breaker),
            retry: self.options.retry.clone(),
            max_data_age: self.options.max_data_age,
        };

        let cached = self
            .cache
            .get_or_compute(key, ttl, invalidate, move || fetch.run())
            .await?;
        debug!(query_id, status = cached.status.as_str(), "Query served");
        Ok(cached)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop cached results for one query.
    pub fn invalidate_query(&self, query_id: &str) -> usize {
        self.cache.invalidate_query(query_id)
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    /// Datasets currently failing fast.
    pub fn open_circuits(&self) -> Vec<String> {
        self.breaker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open_datasets()
    }
}

/// Everything one backend fetch needs, detached from the executor borrow.
struct FetchJob {
    definition: Arc<QueryDefinition>,
    source_type: String,
    backend: Arc<dyn QueryBackend>,
    bound: Vec<BoundParam>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    retry: RetryPolicy,
    max_data_age: chrono::Duration,
}

impl FetchJob {
    async fn run(self) -> Result<Arc<QueryResult>, DataError> {
        let query_id = self.definition.query_id.as_str();
        let dataset = self.definition.dataset.as_str();

        let available = self
            .breaker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_available(dataset);
        if !available {
            warn!(query_id, dataset, "Circuit open, failing fast");
            return Err(DataError::unavailable(
                query_id,
                format!("circuit open for dataset {}", dataset),
                0,
            ));
        }

        let started = Instant::now();
        let locator = &self.definition.backend_locator;
        let backend = &self.backend;
        let bound = &self.bound;
        let outcome = retry_with_backoff(&self.retry, query_id, |attempt| {
            debug!(query_id, attempt, "Executing backend call");
            backend.execute(locator, bound)
        })
        .await;

        let mut breaker = self.breaker.lock().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Ok(rows) => {
                breaker.record_success(dataset);
                drop(breaker);
                let result = build_result(
                    &self.definition,
                    &self.source_type,
                    rows,
                    self.max_data_age,
                );
                info!(
                    query_id,
                    rows = result.rows.len(),
                    stale = result.freshness.stale,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Query fetched"
                );
                Ok(Arc::new(result))
            }
            Err(exhausted) => {
                breaker.record_failure(dataset);
                drop(breaker);
                warn!(
                    query_id,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "Query unavailable"
                );
                Err(DataError::unavailable(
                    query_id,
                    exhausted.last_error.to_string(),
                    exhausted.attempts,
                ))
            }
        }
    }
}

/// Attach provenance and freshness to raw rows and renormalize percent
/// columns.
pub fn build_result(
    definition: &QueryDefinition,
    source_type: &str,
    mut rows: Vec<Row>,
    max_data_age: chrono::Duration,
) -> QueryResult {
    for row in rows.iter_mut() {
        for field in &definition.percent_fields {
            let normalized = row
                .get(field)
                .and_then(numeric_value)
                .and_then(|v| normalize_percent(Some(v)))
                .and_then(serde_json::Number::from_f64);
            if let Some(n) = normalized {
                row.insert(field.clone(), Value::Number(n));
            }
        }
    }

    let fields = if definition.metric_fields.is_empty() {
        let mut seen: Vec<String> = Vec::new();
        for key in rows.iter().flat_map(|r| r.keys()) {
            if !seen.contains(key) {
                seen.push(key.clone());
            }
        }
        seen
    } else {
        definition.metric_fields.clone()
    };

    let freshness = Freshness::observe(
        &rows,
        definition.date_field.as_deref(),
        definition.year_field.as_deref(),
        max_data_age,
        Utc::now(),
    );

    QueryResult {
        query_id: definition.query_id.clone(),
        rows,
        unit: definition.unit.clone(),
        provenance: Provenance {
            source_type: source_type.to_string(),
            dataset_id: definition.dataset.clone(),
            locator: definition.backend_locator.describe(),
            fields,
        },
        freshness,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::backend::FixtureBackend;
    use crate::data::error::BackendError;
    use crate::data::types::{BackendKind, BackendLocator};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    const DEFINITIONS: &str = r#"
[[datasets]]
id = "labor"
source_type = "fixture"

[[datasets]]
id = "flaky"
source_type = "warehouse"

[[queries]]
query_id = "unemployment_rate"
dataset = "labor"
unit = "percent"
metric_fields = ["unemployment_rate"]
percent_fields = ["unemployment_rate"]
date_field = "period"
backend_locator = { type = "fixture", name = "labor", params = ["region"] }

[[queries]]
query_id = "flaky_series"
dataset = "flaky"
backend_locator = { type = "sql", statement = "select value from series", bind = [] }
"#;

    struct FailingSql {
        calls: AtomicU32,
    }

    #[async_trait]
    impl QueryBackend for FailingSql {
        fn kind(&self) -> BackendKind {
            BackendKind::Sql
        }

        async fn execute(
            &self,
            _locator: &BackendLocator,
            _params: &[BoundParam],
        ) -> Result<Vec<Row>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Transient("connection reset".into()))
        }
    }

    fn executor(sql: Arc<FailingSql>, threshold: u32) -> QueryExecutor {
        let registry = Arc::new(QueryRegistry::from_toml_str(DEFINITIONS).unwrap());
        let fixtures = FixtureBackend::from_json(json!({
            "labor": [
                {"region": "US", "period": "2024-05-01", "unemployment_rate": 39},
                {"region": "US", "period": "2024-06-01", "unemployment_rate": 4.0}
            ]
        }))
        .unwrap();
        let backends = BackendSet::new().with(Arc::new(fixtures)).with(sql);
        QueryExecutor::new(
            registry,
            backends,
            ExecutorOptions {
                retry: RetryPolicy {
                    max_attempts: 3,
                    initial_backoff_ms: 10,
                    max_backoff_ms: 20,
                    attempt_timeout_ms: 100,
                },
                max_data_age: chrono::Duration::days(36_500),
                failure_threshold: threshold,
                cooldown_secs: 9999,
            },
        )
    }

    fn us() -> QueryParams {
        let mut p = QueryParams::new();
        p.insert("region".into(), json!("US"));
        p
    }

    #[tokio::test]
    async fn test_result_carries_provenance_and_normalized_percent() {
        let exec = executor(Arc::new(FailingSql { calls: AtomicU32::new(0) }), 5);
        let cached = exec
            .execute_cached("unemployment_rate", &us(), None, false)
            .await
            .unwrap();
        let result = &cached.value;
        assert_eq!(result.provenance.dataset_id, "labor");
        assert_eq!(result.provenance.source_type, "fixture");
        assert_eq!(result.provenance.locator, "fixture:labor");
        assert_eq!(result.rows[0]["unemployment_rate"], json!(0.39));
        assert_eq!(result.rows[1]["unemployment_rate"], json!(4.0));
        assert_eq!(
            result.freshness.asof_date,
            chrono::NaiveDate::from_ymd_opt(2024, 6, 1)
        );
        assert_eq!(result.unit.as_deref(), Some("percent"));
    }

    #[tokio::test]
    async fn test_unknown_query_and_bad_params() {
        let exec = executor(Arc::new(FailingSql { calls: AtomicU32::new(0) }), 5);
        let err = exec
            .execute_cached("missing", &QueryParams::new(), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::NotFound(_)));

        let err = exec
            .execute_cached("unemployment_rate", &QueryParams::new(), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::InvalidParams { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_is_data_unavailable() {
        let sql = Arc::new(FailingSql { calls: AtomicU32::new(0) });
        let exec = executor(sql.clone(), 10);
        let err = exec
            .execute_cached("flaky_series", &QueryParams::new(), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::DataUnavailable { attempts: 3, .. }));
        assert_eq!(sql.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast() {
        let sql = Arc::new(FailingSql { calls: AtomicU32::new(0) });
        let exec = executor(sql.clone(), 1);
        let _ = exec
            .execute_cached("flaky_series", &QueryParams::new(), None, false)
            .await;
        assert_eq!(exec.open_circuits(), vec!["flaky".to_string()]);
        let calls_before = sql.calls.load(Ordering::SeqCst);

        let err = exec
            .execute_cached("flaky_series", &QueryParams::new(), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::DataUnavailable { attempts: 0, .. }));
        assert_eq!(sql.calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn test_stale_result_is_flagged() {
        let registry = Arc::new(QueryRegistry::from_toml_str(DEFINITIONS).unwrap());
        let fixtures = FixtureBackend::new().with_table(
            "labor",
            vec![json!({"region": "US", "period": "2001-01-01", "unemployment_rate": 4.0})
                .as_object()
                .cloned()
                .unwrap()],
        );
        let exec = QueryExecutor::new(
            registry,
            BackendSet::new().with(Arc::new(fixtures)),
            ExecutorOptions::default(),
        );
        let cached = exec
            .execute_cached("unemployment_rate", &us(), None, false)
            .await
            .unwrap();
        assert!(cached.value.freshness.stale);
    }
}
