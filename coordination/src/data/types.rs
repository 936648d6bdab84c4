//! Query definitions, results, provenance and freshness.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single result row, column name → value.
pub type Row = serde_json::Map<String, Value>;

/// Named query parameters. Ordered so the fingerprint is canonical.
pub type QueryParams = BTreeMap<String, Value>;

/// TTL applied when neither the definition nor the file declares one.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

/// Who may execute a query. Enforced by an external authorization layer;
/// the registry only carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    #[default]
    Public,
    Internal,
    Restricted,
}

/// Backend family a locator is executed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Sql,
    Http,
    Fixture,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sql => write!(f, "sql"),
            Self::Http => write!(f, "http"),
            Self::Fixture => write!(f, "fixture"),
        }
    }
}

/// Where and how a query is executed.
///
/// Parameters are never spliced into `statement` or `url`: SQL uses
/// positional `$n` placeholders filled from `bind` in order, HTTP sends
/// `params` as encoded query pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendLocator {
    Sql {
        statement: String,
        #[serde(default)]
        bind: Vec<String>,
    },
    Http {
        url: String,
        #[serde(default)]
        params: Vec<String>,
        /// JSON pointer to the row array in the response body.
        #[serde(default)]
        rows_pointer: Option<String>,
    },
    Fixture {
        name: String,
        /// Columns the rows are filtered on.
        #[serde(default)]
        params: Vec<String>,
    },
}

impl BackendLocator {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Sql { .. } => BackendKind::Sql,
            Self::Http { .. } => BackendKind::Http,
            Self::Fixture { .. } => BackendKind::Fixture,
        }
    }

    /// Parameter names the locator binds, in binding order.
    pub fn parameter_names(&self) -> &[String] {
        match self {
            Self::Sql { bind, .. } => bind,
            Self::Http { params, .. } => params,
            Self::Fixture { params, .. } => params,
        }
    }

    /// Compact description used in provenance records.
    pub fn describe(&self) -> String {
        match self {
            Self::Sql { statement, .. } => {
                format!("sql:{}", statement.split_whitespace().collect::<Vec<_>>().join(" "))
            }
            Self::Http { url, .. } => format!("http:{}", url),
            Self::Fixture { name, .. } => format!("fixture:{}", name),
        }
    }
}

/// A registered dataset that queries belong to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDefinition {
    pub id: String,
    /// Source system family, e.g. "postgres", "fred_api".
    pub source_type: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// A named, parameterized data query. Immutable after registry load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDefinition {
    pub query_id: String,
    pub dataset: String,
    pub backend_locator: BackendLocator,
    pub cache_ttl_seconds: u64,
    #[serde(default)]
    pub access_level: AccessLevel,
    #[serde(default)]
    pub unit: Option<String>,
    /// Numeric columns flattened into facts.
    #[serde(default)]
    pub metric_fields: Vec<String>,
    /// Columns renormalized with [`normalize_percent`].
    #[serde(default)]
    pub percent_fields: Vec<String>,
    /// Column holding an ISO date; drives `Freshness::asof_date`.
    #[serde(default)]
    pub date_field: Option<String>,
    /// Column holding a year; used when no date field is present.
    #[serde(default)]
    pub year_field: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl QueryDefinition {
    pub fn ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cache_ttl_seconds)
    }
}

/// Origin of a query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_type: String,
    pub dataset_id: String,
    pub locator: String,
    pub fields: Vec<String>,
}

/// Recency of a query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Freshness {
    /// Latest date observed in the batch.
    pub asof_date: Option<NaiveDate>,
    /// Wall-clock time of the fetch.
    pub updated_at: DateTime<Utc>,
    /// Older than the configured max age. Flagged, never blocked.
    pub stale: bool,
}

impl Freshness {
    /// Compute freshness for a batch of rows.
    pub fn observe(
        rows: &[Row],
        date_field: Option<&str>,
        year_field: Option<&str>,
        max_age: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let asof_date = rows
            .iter()
            .filter_map(|row| {
                date_field
                    .and_then(|f| row.get(f))
                    .and_then(parse_date)
                    .or_else(|| year_field.and_then(|f| row.get(f)).and_then(parse_year))
            })
            .max();
        let stale = asof_date
            .map(|d| now.date_naive() - d > max_age)
            .unwrap_or(false);
        Self {
            asof_date,
            updated_at: now,
            stale,
        }
    }
}

fn parse_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .or_else(|| {
                    // Timestamps: keep the date portion.
                    s.get(..10)
                        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
                })
                .or_else(|| NaiveDate::parse_from_str(&format!("{}-01", s), "%Y-%m-%d").ok())
                .or_else(|| parse_year(value))
        }
        Value::Number(_) => parse_year(value),
        _ => None,
    }
}

/// A bare year is dated at its last day.
fn parse_year(value: &Value) -> Option<NaiveDate> {
    let year = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    if !(1000..=9999).contains(&year) {
        return None;
    }
    NaiveDate::from_ymd_opt(year as i32, 12, 31)
}

/// Output of one query execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub query_id: String,
    pub rows: Vec<Row>,
    pub unit: Option<String>,
    pub provenance: Provenance,
    pub freshness: Freshness,
}

/// Canonical fingerprint of a parameter set. `QueryParams` is ordered, so
/// equal maps always serialize identically.
pub fn param_fingerprint(params: &QueryParams) -> String {
    serde_json::to_string(params).unwrap_or_default()
}

/// Renormalize a percent value to the "already-percent" contract.
///
/// Values in `(10, 10000]` are taken to be scaled by 100: `11 → 0.11`,
/// `569 → 5.69`. A quotient still above 10 is divided once more
/// (`5000 → 50 → 0.5`), otherwise a second call would change it. Everything
/// else passes through. Repeated application is a no-op.
pub fn normalize_percent(value: Option<f64>) -> Option<f64> {
    let v = value?;
    if v > 10.0 && v <= 10_000.0 {
        let mut scaled = v / 100.0;
        if scaled > 10.0 {
            scaled /= 100.0;
        }
        Some(scaled)
    } else {
        Some(v)
    }
}

/// Numeric view of a JSON cell; numeric strings count.
pub fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}
