//! Data layer: registered queries, backends and the single-flight cache.
//!
//! ```text
//! execute_cached(query_id, params)
//!   → QueryRegistry::get        (NotFound)
//!   → bind_params               (InvalidParams)
//!   → SingleFlightCache         (Hit | Coalesced | Miss)
//!       → CircuitBreaker        (fail fast while open)
//!       → retry_with_backoff → QueryBackend::execute
//!       → build_result          (percent renormalization, provenance, freshness)
//! ```

pub mod backend;
pub mod cache;
pub mod circuit_breaker;
pub mod error;
pub mod executor;
pub mod registry;
pub mod types;

pub use backend::{bind_params, BackendSet, BoundParam, FixtureBackend, QueryBackend};
pub use cache::{CacheKey, CacheStats, CacheStatus, Cached, SingleFlightCache};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use error::{BackendError, DataError, RegistryError};
pub use executor::{build_result, ExecutorOptions, QueryExecutor, ResultCache};
pub use registry::{
    DefinitionSet, DefinitionSource, QueryDefinitionSpec, QueryRegistry, RegistrySnapshot,
    RouteDefinition,
};
pub use types::{
    normalize_percent, numeric_value, param_fingerprint, AccessLevel, BackendKind,
    BackendLocator, DatasetDefinition, Freshness, Provenance, QueryDefinition, QueryParams,
    QueryResult, Row, DEFAULT_CACHE_TTL_SECS,
};
