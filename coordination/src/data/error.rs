//! Error types for the data layer.
//!
//! `DataError` is carried as data through fact extraction: an unavailable
//! source becomes a recorded gap, never a substituted number.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::types::BackendKind;

/// Per-query failure seen by callers of `execute_cached`.
///
/// `Clone` because one single-flight result fans out to every waiter.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    #[error("Query not found: {0}")]
    NotFound(String),

    #[error("Data unavailable for {query_id} after {attempts} attempt(s): {reason}")]
    DataUnavailable {
        query_id: String,
        reason: String,
        attempts: u32,
    },

    #[error("No {kind} backend registered for {query_id}")]
    BackendMissing { query_id: String, kind: BackendKind },

    #[error("Invalid parameters for {query_id}: {reason}")]
    InvalidParams { query_id: String, reason: String },
}

impl DataError {
    pub fn unavailable(query_id: &str, reason: impl Into<String>, attempts: u32) -> Self {
        Self::DataUnavailable {
            query_id: query_id.to_string(),
            reason: reason.into(),
            attempts,
        }
    }

    /// Short machine-readable kind, used in gap records and event payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::DataUnavailable { .. } => "data_unavailable",
            Self::BackendMissing { .. } => "backend_missing",
            Self::InvalidParams { .. } => "invalid_params",
        }
    }
}

/// Failure reported by a single backend call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transient backend failure: {0}")]
    Transient(String),

    #[error("Backend failure: {0}")]
    Permanent(String),
}

impl BackendError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transient(_))
    }
}

/// Fatal registry load failure. Aborts startup.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read definitions from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse definitions: {0}")]
    Parse(String),

    #[error("Unsupported definitions format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("Duplicate query_id: {0}")]
    DuplicateQuery(String),

    #[error("Duplicate dataset: {0}")]
    DuplicateDataset(String),

    #[error("Query {query_id} references unknown dataset {dataset}")]
    UnknownDataset { query_id: String, dataset: String },

    #[error("Route references unknown dataset {0}")]
    UnknownRouteDataset(String),

    #[error("Invalid locator for {query_id}: {reason}")]
    InvalidLocator { query_id: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BackendError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(BackendError::Transient("503".into()).is_transient());
        assert!(!BackendError::Permanent("syntax error".into()).is_transient());
    }

    #[test]
    fn test_data_error_display() {
        let err = DataError::unavailable("gdp_growth", "connection refused", 3);
        let msg = err.to_string();
        assert!(msg.contains("gdp_growth"));
        assert!(msg.contains("3 attempt"));
        assert_eq!(err.code(), "data_unavailable");
    }
}
