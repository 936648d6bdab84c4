use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::routing::{resolve_plan, PlannedQuery};
use super::{DataGap, Fact, FactSet, SourceRecord, INTERRUPTED};
use crate::data::{
    numeric_value, Cached, DataError, QueryDefinition, QueryExecutor, QueryResult, Row,
};
use crate::router::ComplexityTier;

/// Horizon for plans run without a deadline.
const UNBOUNDED: Duration = Duration::from_secs(365 * 24 * 3600);

/// Prefetches and flattens facts for a question.
pub struct FactExtractor {
    executor: Arc<QueryExecutor>,
    max_concurrency: usize,
    ttl_override: Option<Duration>,
}

impl FactExtractor {
    pub fn new(executor: Arc<QueryExecutor>, max_concurrency: usize) -> Self {
        Self {
            executor,
            max_concurrency: max_concurrency.max(1),
            ttl_override: None,
        }
    }

    /// Use one TTL for every query instead of each definition's own.
    pub fn with_ttl_override(mut self, ttl: Option<Duration>) -> Self {
        self.ttl_override = ttl;
        self
    }

    /// Resolve, fetch and flatten. Never fails: a source that cannot be
    /// fetched becomes a [`DataGap`].
    pub async fn fetch_facts(&self, question: &str, tier: ComplexityTier) -> FactSet {
        let snapshot = self.executor.registry().snapshot();
        let plan = resolve_plan(&snapshot, question, tier.max_sources());
        self.fetch_plan(plan).await
    }

    /// Like [`fetch_facts`](Self::fetch_facts), but stops at `deadline` or
    /// when `cancel` fires. Sources already fetched are kept; the rest are
    /// recorded as `interrupted` gaps.
    pub async fn fetch_facts_until(
        &self,
        question: &str,
        tier: ComplexityTier,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> FactSet {
        let snapshot = self.executor.registry().snapshot();
        let plan = resolve_plan(&snapshot, question, tier.max_sources());
        self.fetch_plan_until(plan, deadline, cancel).await
    }

    /// Execute an explicit plan. Results keep plan order.
    pub async fn fetch_plan(&self, plan: Vec<PlannedQuery>) -> FactSet {
        let cancel = CancellationToken::new();
        self.fetch_plan_until(plan, Instant::now() + UNBOUNDED, &cancel)
            .await
    }

    /// Execute an explicit plan until `deadline` or `cancel`. Results keep
    /// plan order whether or not the plan finished.
    pub async fn fetch_plan_until(
        &self,
        plan: Vec<PlannedQuery>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> FactSet {
        let started = Instant::now();
        let requested = plan.len();
        let ttl_override = self.ttl_override;

        let mut slots: Vec<Option<Result<Cached<Arc<QueryResult>>, DataError>>> =
            plan.iter().map(|_| None).collect();
        let mut pending = stream::iter(plan.iter().cloned().enumerate())
            .map(|(slot, planned)| {
                let executor = Arc::clone(&self.executor);
                async move {
                    let result = executor
                        .execute_cached(&planned.query_id, &planned.params, ttl_override, false)
                        .await;
                    (slot, result)
                }
            })
            .buffer_unordered(self.max_concurrency);

        let interrupted = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Some("prefetch cancelled"),
                _ = tokio::time::sleep_until(deadline) => break Some("session deadline reached during prefetch"),
                next = pending.next() => match next {
                    Some((slot, result)) => slots[slot] = Some(result),
                    None => break None,
                },
            }
        };
        if interrupted.is_some() {
            while let Some(Some((slot, result))) = pending.next().now_or_never() {
                slots[slot] = Some(result);
            }
        }
        drop(pending);

        let mut set = FactSet::new();
        set.set_requested(requested);
        let snapshot = self.executor.registry().snapshot();
        for (planned, outcome) in plan.into_iter().zip(slots) {
            match outcome {
                Some(Ok(cached)) => {
                    let result = &cached.value;
                    match snapshot.get(&planned.query_id) {
                        Some(definition) => {
                            for fact in flatten(definition, result) {
                                set.push_fact(fact);
                            }
                        }
                        None => warn!(
                            query_id = %planned.query_id,
                            "Definition removed by reload; skipping flatten"
                        ),
                    }
                    set.push_source(SourceRecord {
                        query_id: result.query_id.clone(),
                        provenance: result.provenance.clone(),
                        freshness: result.freshness.clone(),
                        row_count: result.rows.len(),
                        cache_status: cached.status,
                    });
                }
                Some(Err(err)) => {
                    warn!(query_id = %planned.query_id, error = %err, "Recording data gap");
                    set.push_gap(DataGap {
                        query_id: planned.query_id,
                        dataset: Some(planned.dataset),
                        code: err.code().to_string(),
                        reason: err.to_string(),
                    });
                }
                None => {
                    let reason = interrupted.unwrap_or("not fetched");
                    warn!(query_id = %planned.query_id, reason, "Recording interrupted source");
                    set.push_gap(DataGap {
                        query_id: planned.query_id,
                        dataset: Some(planned.dataset),
                        code: INTERRUPTED.to_string(),
                        reason: reason.to_string(),
                    });
                }
            }
        }

        info!(
            requested = set.requested(),
            fetched = set.sources().len(),
            facts = set.len(),
            gaps = set.gaps().len(),
            interrupted = interrupted.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Facts prefetched"
        );
        set
    }
}

/// One fact per numeric metric cell, in row order.
pub fn flatten(definition: &QueryDefinition, result: &QueryResult) -> Vec<Fact> {
    let skip = |name: &str| {
        definition.date_field.as_deref() == Some(name)
            || definition.year_field.as_deref() == Some(name)
    };

    let mut facts = Vec::new();
    for row in &result.rows {
        let metrics: Vec<&String> = if definition.metric_fields.is_empty() {
            row.iter()
                .filter(|(k, v)| !skip(k) && matches!(v, Value::Number(_)))
                .map(|(k, _)| k)
                .collect()
        } else {
            definition.metric_fields.iter().collect()
        };

        let dimensions: BTreeMap<String, String> = row
            .iter()
            .filter(|(k, _)| !skip(k) && !metrics.contains(k))
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect();
        let year = row_year(row, definition);

        for metric in metrics {
            let Some(value) = row.get(metric.as_str()).and_then(numeric_value) else {
                continue;
            };
            facts.push(Fact {
                metric: metric.clone(),
                value,
                unit: result.unit.clone(),
                year,
                source_query_id: result.query_id.clone(),
                dimensions: dimensions.clone(),
            });
        }
    }
    facts
}

fn row_year(row: &Row, definition: &QueryDefinition) -> Option<i32> {
    let from_year = definition
        .year_field
        .as_deref()
        .and_then(|f| row.get(f))
        .and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });
    let from_date = || {
        definition
            .date_field
            .as_deref()
            .and_then(|f| row.get(f))
            .and_then(Value::as_str)
            .and_then(|s| s.get(..4))
            .and_then(|y| y.parse::<i64>().ok())
    };
    from_year
        .or_else(from_date)
        .and_then(|y| i32::try_from(y).ok())
}
