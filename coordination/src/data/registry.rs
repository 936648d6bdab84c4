//! Query Registry: named query definitions, datasets and routes.
//!
//! Definitions are loaded once at startup from a TOML or YAML file (or an
//! inline string). Validation is strict: any duplicate id, dangling dataset
//! reference or textual parameter template aborts the load. A reload builds a
//! complete new snapshot and swaps it in; readers holding the old `Arc` keep a
//! consistent view.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::{DataError, RegistryError};
use super::types::{
    AccessLevel, BackendLocator, DatasetDefinition, QueryDefinition, QueryParams,
    DEFAULT_CACHE_TTL_SECS,
};

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(\d+)").expect("PLACEHOLDER_RE regex should compile")
});

fn default_ttl() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

/// A query definition as written in the definitions file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDefinitionSpec {
    pub query_id: String,
    pub dataset: String,
    pub backend_locator: BackendLocator,
    /// Falls back to the file-level `default_ttl_seconds`.
    #[serde(default)]
    pub cache_ttl_seconds: Option<u64>,
    #[serde(default)]
    pub access_level: AccessLevel,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub metric_fields: Vec<String>,
    #[serde(default)]
    pub percent_fields: Vec<String>,
    #[serde(default)]
    pub date_field: Option<String>,
    #[serde(default)]
    pub year_field: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Question → dataset routing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub dataset: String,
    /// Lowercase keywords; any match selects the dataset.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Default parameters offered to the dataset's queries.
    #[serde(default)]
    pub params: QueryParams,
    /// Used when no keyword route matches.
    #[serde(default)]
    pub fallback: bool,
}

/// Parsed contents of a definitions file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionSet {
    #[serde(default = "default_ttl")]
    pub default_ttl_seconds: u64,
    #[serde(default)]
    pub datasets: Vec<DatasetDefinition>,
    #[serde(default)]
    pub queries: Vec<QueryDefinitionSpec>,
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,
}

impl DefinitionSet {
    pub fn from_toml_str(text: &str) -> Result<Self, RegistryError> {
        toml::from_str(text).map_err(|e| RegistryError::Parse(e.to_string()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, RegistryError> {
        serde_yaml::from_str(text).map_err(|e| RegistryError::Parse(e.to_string()))
    }

    /// Read a definitions file; the format follows the extension.
    pub fn from_path(path: &Path) -> Result<Self, RegistryError> {
        let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text),
            _ => Err(RegistryError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// Where the registry reads its definitions from.
#[derive(Debug, Clone)]
pub enum DefinitionSource {
    File(PathBuf),
    Toml(String),
    Yaml(String),
}

impl DefinitionSource {
    fn read(&self) -> Result<DefinitionSet, RegistryError> {
        match self {
            Self::File(path) => DefinitionSet::from_path(path),
            Self::Toml(text) => DefinitionSet::from_toml_str(text),
            Self::Yaml(text) => DefinitionSet::from_yaml_str(text),
        }
    }
}

/// Immutable, validated view of the definitions.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    datasets: BTreeMap<String, DatasetDefinition>,
    queries: BTreeMap<String, Arc<QueryDefinition>>,
    routes: Vec<RouteDefinition>,
}

impl RegistrySnapshot {
    /// Validate a definition set into a snapshot.
    pub fn build(set: DefinitionSet) -> Result<Self, RegistryError> {
        let mut datasets = BTreeMap::new();
        for dataset in set.datasets {
            if datasets.contains_key(&dataset.id) {
                return Err(RegistryError::DuplicateDataset(dataset.id));
            }
            datasets.insert(dataset.id.clone(), dataset);
        }

        let mut queries = BTreeMap::new();
        for spec in set.queries {
            if queries.contains_key(&spec.query_id) {
                return Err(RegistryError::DuplicateQuery(spec.query_id));
            }
            if !datasets.contains_key(&spec.dataset) {
                return Err(RegistryError::UnknownDataset {
                    query_id: spec.query_id,
                    dataset: spec.dataset,
                });
            }
            validate_locator(&spec.query_id, &spec.backend_locator)?;

            let definition = QueryDefinition {
                cache_ttl_seconds: spec.cache_ttl_seconds.unwrap_or(set.default_ttl_seconds),
                query_id: spec.query_id.clone(),
                dataset: spec.dataset,
                backend_locator: spec.backend_locator,
                access_level: spec.access_level,
                unit: spec.unit,
                metric_fields: spec.metric_fields,
                percent_fields: spec.percent_fields,
                date_field: spec.date_field,
                year_field: spec.year_field,
                description: spec.description,
            };
            queries.insert(spec.query_id, Arc::new(definition));
        }

        for route in &set.routes {
            if !datasets.contains_key(&route.dataset) {
                return Err(RegistryError::UnknownRouteDataset(route.dataset.clone()));
            }
        }

        Ok(Self {
            datasets,
            queries,
            routes: set.routes,
        })
    }

    pub fn get(&self, query_id: &str) -> Option<&Arc<QueryDefinition>> {
        self.queries.get(query_id)
    }

    pub fn dataset(&self, id: &str) -> Option<&DatasetDefinition> {
        self.datasets.get(id)
    }

    /// Query ids in sorted order.
    pub fn query_ids(&self) -> Vec<String> {
        self.queries.keys().cloned().collect()
    }

    /// Queries belonging to a dataset, in query_id order.
    pub fn queries_for_dataset(&self, dataset: &str) -> Vec<Arc<QueryDefinition>> {
        self.queries
            .values()
            .filter(|q| q.dataset == dataset)
            .cloned()
            .collect()
    }

    pub fn routes(&self) -> &[RouteDefinition] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

fn validate_locator(query_id: &str, locator: &BackendLocator) -> Result<(), RegistryError> {
    let invalid = |reason: String| RegistryError::InvalidLocator {
        query_id: query_id.to_string(),
        reason,
    };

    let names = locator.parameter_names();
    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(invalid("empty parameter name".to_string()));
        }
        if !seen.insert(name.as_str()) {
            return Err(invalid(format!("parameter '{}' bound twice", name)));
        }
    }

    match locator {
        BackendLocator::Sql { statement, bind } => {
            if statement.contains('{') || statement.contains('}') {
                return Err(invalid(
                    "textual templates are not allowed; use $n placeholders".to_string(),
                ));
            }
            for cap in PLACEHOLDER_RE.captures_iter(statement) {
                let index: usize = cap[1].parse().unwrap_or(0);
                if index == 0 || index > bind.len() {
                    return Err(invalid(format!(
                        "placeholder ${} has no bound parameter ({} bound)",
                        index,
                        bind.len()
                    )));
                }
            }
        }
        BackendLocator::Http { url, .. } => {
            if url.contains('{') || url.contains('}') {
                return Err(invalid(
                    "textual templates are not allowed; declare params instead".to_string(),
                ));
            }
        }
        BackendLocator::Fixture { name, .. } => {
            if name.trim().is_empty() {
                return Err(invalid("fixture name is empty".to_string()));
            }
        }
    }
    Ok(())
}

/// Shared, reloadable registry of query definitions.
pub struct QueryRegistry {
    source: Option<DefinitionSource>,
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl QueryRegistry {
    /// Load and validate every definition from `source`.
    pub fn load_all(source: DefinitionSource) -> Result<Self, RegistryError> {
        let snapshot = RegistrySnapshot::build(source.read()?)?;
        info!(
            queries = snapshot.len(),
            datasets = snapshot.datasets.len(),
            routes = snapshot.routes.len(),
            "Query registry loaded"
        );
        Ok(Self {
            source: Some(source),
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Build from an already-parsed set. `reload` keeps this snapshot.
    pub fn from_definitions(set: DefinitionSet) -> Result<Self, RegistryError> {
        let snapshot = RegistrySnapshot::build(set)?;
        Ok(Self {
            source: None,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        Self::load_all(DefinitionSource::File(path.into()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self, RegistryError> {
        Self::load_all(DefinitionSource::Toml(text.to_string()))
    }

    /// Re-read the source and swap the snapshot. On error the previous
    /// snapshot stays in place.
    pub fn reload(&self) -> Result<usize, RegistryError> {
        let Some(source) = &self.source else {
            return Ok(self.snapshot().len());
        };
        match source.read().and_then(RegistrySnapshot::build) {
            Ok(snapshot) => Ok(self.install(snapshot)),
            Err(e) => {
                warn!(error = %e, "Registry reload failed; keeping previous definitions");
                Err(e)
            }
        }
    }

    /// Replace the definitions with a new set, atomically.
    pub fn replace(&self, set: DefinitionSet) -> Result<usize, RegistryError> {
        let snapshot = RegistrySnapshot::build(set)?;
        Ok(self.install(snapshot))
    }

    fn install(&self, snapshot: RegistrySnapshot) -> usize {
        let count = snapshot.len();
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Arc::new(snapshot);
        info!(queries = count, "Query registry reloaded");
        count
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Look up a definition by id.
    pub fn get(&self, query_id: &str) -> Result<Arc<QueryDefinition>, DataError> {
        self.snapshot()
            .get(query_id)
            .cloned()
            .ok_or_else(|| DataError::NotFound(query_id.to_string()))
    }

    pub fn query_ids(&self) -> Vec<String> {
        self.snapshot().query_ids()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFINITIONS: &str = r#"
default_ttl_seconds = 600

[[datasets]]
id = "labor"
source_type = "postgres"

[[datasets]]
id = "macro"
source_type = "fixture"

[[queries]]
query_id = "unemployment_rate"
dataset = "labor"
cache_ttl_seconds = 120
metric_fields = ["unemployment_rate"]
percent_fields = ["unemployment_rate"]
date_field = "period"
backend_locator = { type = "sql", statement = "select period, unemployment_rate from labor where region = $1", bind = ["region"] }

[[queries]]
query_id = "gdp_growth"
dataset = "macro"
access_level = "internal"
metric_fields = ["gdp_growth"]
backend_locator = { type = "fixture", name = "gdp" }

[[routes]]
dataset = "labor"
keywords = ["unemployment", "jobs"]
params = { region = "US" }

[[routes]]
dataset = "macro"
fallback = true
"#;

    #[test]
    fn test_load_applies_default_ttl() {
        let registry = QueryRegistry::from_toml_str(DEFINITIONS).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("unemployment_rate").unwrap().cache_ttl_seconds, 120);
        let gdp = registry.get("gdp_growth").unwrap();
        assert_eq!(gdp.cache_ttl_seconds, 600);
        assert_eq!(gdp.access_level, AccessLevel::Internal);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let registry = QueryRegistry::from_toml_str(DEFINITIONS).unwrap();
        let err = registry.get("nope").unwrap_err();
        assert_eq!(err, DataError::NotFound("nope".to_string()));
    }

    #[test]
    fn test_duplicate_query_rejected() {
        let text = format!(
            "{}\n[[queries]]\nquery_id = \"gdp_growth\"\ndataset = \"macro\"\nbackend_locator = {{ type = \"fixture\", name = \"x\" }}\n",
            DEFINITIONS
        );
        let err = QueryRegistry::from_toml_str(&text).err().unwrap();
        assert!(matches!(err, RegistryError::DuplicateQuery(id) if id == "gdp_growth"));
    }

    #[test]
    fn test_unknown_dataset_rejected() {
        let text = r#"
[[queries]]
query_id = "orphan"
dataset = "missing"
backend_locator = { type = "fixture", name = "x" }
"#;
        let err = QueryRegistry::from_toml_str(text).err().unwrap();
        assert!(matches!(err, RegistryError::UnknownDataset { .. }));
    }

    #[test]
    fn test_textual_template_rejected() {
        let text = r#"
[[datasets]]
id = "labor"
source_type = "postgres"

[[queries]]
query_id = "bad"
dataset = "labor"
backend_locator = { type = "sql", statement = "select * from t where region = '{region}'", bind = ["region"] }
"#;
        let err = QueryRegistry::from_toml_str(text).err().unwrap();
        assert!(matches!(err, RegistryError::InvalidLocator { .. }));
    }

    #[test]
    fn test_unbound_placeholder_rejected() {
        let text = r#"
[[datasets]]
id = "labor"
source_type = "postgres"

[[queries]]
query_id = "bad"
dataset = "labor"
backend_locator = { type = "sql", statement = "select * from t where a = $1 and b = $2", bind = ["a"] }
"#;
        let err = QueryRegistry::from_toml_str(text).err().unwrap();
        assert!(err.to_string().contains("$2"));
    }

    #[test]
    fn test_route_with_unknown_dataset_rejected() {
        let text = r#"
[[routes]]
dataset = "ghost"
keywords = ["x"]
"#;
        let err = QueryRegistry::from_toml_str(text).err().unwrap();
        assert!(matches!(err, RegistryError::UnknownRouteDataset(d) if d == "ghost"));
    }

    #[test]
    fn test_yaml_definitions() {
        let yaml = r#"
datasets:
  - id: macro
    source_type: fixture
queries:
  - query_id: cpi
    dataset: macro
    metric_fields: [cpi]
    backend_locator:
      type: fixture
      name: cpi
"#;
        let registry = QueryRegistry::load_all(DefinitionSource::Yaml(yaml.to_string())).unwrap();
        assert_eq!(registry.query_ids(), vec!["cpi".to_string()]);
        assert_eq!(registry.get("cpi").unwrap().cache_ttl_seconds, DEFAULT_CACHE_TTL_SECS);
    }

    #[test]
    fn test_reload_keeps_snapshot_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queries.toml");
        std::fs::write(&path, DEFINITIONS).unwrap();

        let registry = QueryRegistry::from_path(&path).unwrap();
        let before = registry.snapshot();

        std::fs::write(&path, "[[queries]]\nquery_id = 1").unwrap();
        assert!(registry.reload().is_err());
        assert_eq!(registry.len(), 2);

        std::fs::write(&path, DEFINITIONS.replace("cache_ttl_seconds = 120", "cache_ttl_seconds = 60")).unwrap();
        assert_eq!(registry.reload().unwrap(), 2);
        assert_eq!(registry.get("unemployment_rate").unwrap().cache_ttl_seconds, 60);
        // Readers holding the old snapshot still see the old value.
        assert_eq!(before.get("unemployment_rate").unwrap().cache_ttl_seconds, 120);
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queries.ini");
        std::fs::write(&path, "").unwrap();
        let err = QueryRegistry::from_path(&path).err().unwrap();
        assert!(matches!(err, RegistryError::UnsupportedFormat(_)));
    }
}
