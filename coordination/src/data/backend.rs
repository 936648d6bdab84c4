//! Backend execution seam.
//!
//! One [`QueryBackend`] per [`BackendKind`]. Backends receive the locator and
//! the already-bound parameters in locator order; they never see raw user
//! input and never build statements by string concatenation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::error::{BackendError, DataError};
use super::types::{BackendKind, BackendLocator, QueryDefinition, QueryParams, Row};

/// A parameter value in binding position.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParam {
    pub name: String,
    pub value: Value,
}

impl BoundParam {
    /// Text form for backends that only accept strings (HTTP query pairs).
    pub fn as_text(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Executes one kind of locator.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn execute(
        &self,
        locator: &BackendLocator,
        params: &[BoundParam],
    ) -> Result<Vec<Row>, BackendError>;
}

/// Bind `params` to the definition's declared parameters.
///
/// Every declared parameter must be present. Undeclared parameters are
/// rejected because they would split the cache key without changing the
/// result.
pub fn bind_params(
    definition: &QueryDefinition,
    params: &QueryParams,
) -> Result<Vec<BoundParam>, DataError> {
    let declared = definition.backend_locator.parameter_names();

    if let Some(unknown) = params.keys().find(|k| !declared.contains(k)) {
        return Err(DataError::InvalidParams {
            query_id: definition.query_id.clone(),
            reason: format!("unknown parameter '{}'", unknown),
        });
    }

    declared
        .iter()
        .map(|name| match params.get(name) {
            Some(value) if !value.is_null() => Ok(BoundParam {
                name: name.clone(),
                value: value.clone(),
            }),
            _ => Err(DataError::InvalidParams {
                query_id: definition.query_id.clone(),
                reason: format!("missing parameter '{}'", name),
            }),
        })
        .collect()
}

/// The registered backends, one per kind.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: HashMap<BackendKind, Arc<dyn QueryBackend>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend, replacing any previous one of the same kind.
    pub fn with(mut self, backend: Arc<dyn QueryBackend>) -> Self {
        self.register(backend);
        self
    }

    pub fn register(&mut self, backend: Arc<dyn QueryBackend>) {
        self.backends.insert(backend.kind(), backend);
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn QueryBackend>> {
        self.backends.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.backends.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSet")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// In-memory tables keyed by fixture name.
///
/// Rows are filtered by the bound parameters: a row matches when every bound
/// parameter either equals the row's same-named column or the row has no such
/// column.
#[derive(Debug, Clone, Default)]
pub struct FixtureBackend {
    tables: HashMap<String, Vec<Row>>,
}

impl FixtureBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: impl Into<String>, rows: Vec<Row>) -> Self {
        self.tables.insert(name.into(), rows);
        self
    }

    /// Load from a JSON object of `name → [row, …]`.
    pub fn from_json(value: Value) -> Result<Self, BackendError> {
        let Value::Object(map) = value else {
            return Err(BackendError::Permanent(
                "fixture document must be an object of tables".to_string(),
            ));
        };
        let mut tables = HashMap::new();
        for (name, rows) in map {
            let Value::Array(items) = rows else {
                return Err(BackendError::Permanent(format!(
                    "fixture table '{}' is not an array",
                    name
                )));
            };
            let rows = items
                .into_iter()
                .map(|item| match item {
                    Value::Object(row) => Ok(row),
                    _ => Err(BackendError::Permanent(format!(
                        "fixture table '{}' contains a non-object row",
                        name
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            tables.insert(name, rows);
        }
        Ok(Self { tables })
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl QueryBackend for FixtureBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fixture
    }

    async fn execute(
        &self,
        locator: &BackendLocator,
        params: &[BoundParam],
    ) -> Result<Vec<Row>, BackendError> {
        let BackendLocator::Fixture { name, .. } = locator else {
            return Err(BackendError::Permanent(format!(
                "fixture backend cannot execute {} locator",
                locator.kind()
            )));
        };
        let rows = self
            .tables
            .get(name)
            .ok_or_else(|| BackendError::Permanent(format!("unknown fixture '{}'", name)))?;
        Ok(rows
            .iter()
            .filter(|row| {
                params
                    .iter()
                    .all(|p| row.get(&p.name).map_or(true, |v| v == &p.value))
            })
            .cloned()
            .collect())
    }
}
