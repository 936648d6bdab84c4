//! Fact Extraction: the grounded evidence a debate may cite.
//!
//! ```text
//! question ──routing──► [PlannedQuery] ──execute_cached (bounded)──► QueryResult*
//!                                                         │
//!                             ┌───────────────────────────┴───────────┐
//!                             ▼                                       ▼
//!                   Fact per numeric metric cell               DataGap per failure
//! ```
//!
//! A [`FactSet`] is append-only for the lifetime of a session.

pub mod extractor;
pub mod routing;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data::{CacheStatus, Freshness, Provenance};

pub use extractor::FactExtractor;
pub use routing::{resolve_plan, PlannedQuery};

/// A normalized, source-traceable (metric, value) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub metric: String,
    pub value: f64,
    pub unit: Option<String>,
    pub year: Option<i32>,
    pub source_query_id: String,
    /// Text columns of the source row, e.g. `region = "US"`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dimensions: BTreeMap<String, String>,
}

impl Fact {
    /// One-line rendering used in prompts and reports.
    pub fn describe(&self) -> String {
        let mut out = format!("{} = {}", self.metric, format_value(self.value));
        if let Some(unit) = &self.unit {
            out.push(' ');
            out.push_str(unit);
        }
        if let Some(year) = self.year {
            out.push_str(&format!(" ({})", year));
        }
        if !self.dimensions.is_empty() {
            let dims: Vec<String> = self
                .dimensions
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            out.push_str(&format!(" [{}]", dims.join(", ")));
        }
        out
    }
}

/// Shortest faithful rendering of a number.
pub fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        let s = format!("{:.6}", value);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// Gap code for a planned source the deadline or a cancel cut off.
pub const INTERRUPTED: &str = "interrupted";

/// An explicit, recorded absence of data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataGap {
    pub query_id: String,
    pub dataset: Option<String>,
    /// Machine-readable kind, see [`crate::data::DataError::code`].
    pub code: String,
    pub reason: String,
}

/// A query that delivered rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub query_id: String,
    pub provenance: Provenance,
    pub freshness: Freshness,
    pub row_count: usize,
    pub cache_status: CacheStatus,
}

/// Session evidence: facts, gaps and per-source metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactSet {
    facts: Vec<Fact>,
    gaps: Vec<DataGap>,
    sources: Vec<SourceRecord>,
    requested: usize,
}

impl FactSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build directly from facts, e.g. for tests or offline replays.
    pub fn from_facts(facts: Vec<Fact>) -> Self {
        let mut set = Self::new();
        for fact in facts {
            set.push_fact(fact);
        }
        set
    }

    pub fn push_fact(&mut self, fact: Fact) {
        self.facts.push(fact);
    }

    pub fn push_gap(&mut self, gap: DataGap) {
        self.gaps.push(gap);
    }

    pub fn push_source(&mut self, source: SourceRecord) {
        self.sources.push(source);
    }

    pub fn set_requested(&mut self, requested: usize) {
        self.requested = requested;
    }

    pub fn facts(&self) -> &[Fact] {
        &self.facts
    }

    pub fn gaps(&self) -> &[DataGap] {
        &self.gaps
    }

    pub fn sources(&self) -> &[SourceRecord] {
        &self.sources
    }

    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    /// Fraction of requested sources that delivered. 0 when nothing was
    /// requested.
    pub fn coverage(&self) -> f64 {
        if self.requested == 0 {
            return 0.0;
        }
        (self.sources.len() as f64 / self.requested as f64).min(1.0)
    }

    /// Distinct query ids that produced facts, in first-seen order.
    pub fn query_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for fact in &self.facts {
            if !ids.contains(&fact.source_query_id) {
                ids.push(fact.source_query_id.clone());
            }
        }
        ids
    }

    pub fn facts_for<'a>(&'a self, query_id: &'a str) -> impl Iterator<Item = &'a Fact> + 'a {
        self.facts
            .iter()
            .filter(move |f| f.source_query_id == query_id)
    }

    /// Whether prefetch stopped before every planned source answered.
    pub fn was_interrupted(&self) -> bool {
        self.gaps.iter().any(|g| g.code == INTERRUPTED)
    }

    /// Sources flagged stale.
    pub fn stale_sources(&self) -> Vec<&SourceRecord> {
        self.sources.iter().filter(|s| s.freshness.stale).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(metric: &str, value: f64, q: &str) -> Fact {
        Fact {
            metric: metric.into(),
            value,
            unit: None,
            year: None,
            source_query_id: q.into(),
            dimensions: BTreeMap::new(),
        }
    }

    #[test]
    fn test_coverage() {
        let mut set = FactSet::new();
        assert_eq!(set.coverage(), 0.0);
        set.set_requested(4);
        set.push_gap(DataGap {
            query_id: "q2".into(),
            dataset: None,
            code: "data_unavailable".into(),
            reason: "timeout".into(),
        });
        assert_eq!(set.coverage(), 0.0);
        assert_eq!(set.gaps().len(), 1);
    }

    #[test]
    fn test_query_ids_dedup_in_order() {
        let set = FactSet::from_facts(vec![
            fact("a", 1.0, "q2"),
            fact("b", 2.0, "q1"),
            fact("c", 3.0, "q2"),
        ]);
        assert_eq!(set.query_ids(), vec!["q2".to_string(), "q1".to_string()]);
        assert_eq!(set.facts_for("q2").count(), 2);
    }

    #[test]
    fn test_describe() {
        let mut f = fact("unemployment_rate", 4.1, "q1");
        f.unit = Some("percent".into());
        f.year = Some(2024);
        f.dimensions.insert("region".into(), "US".into());
        assert_eq!(f.describe(), "unemployment_rate = 4.1 percent (2024) [region=US]");
        assert_eq!(format_value(2500.0), "2500");
        assert_eq!(format_value(0.125), "0.125");
    }
}
