//! Runtime adapters for the analysis engine: an HTTP text generator,
//! network query backends and environment-driven process settings.

pub mod backends;
pub mod config;
pub mod generator;

pub use backends::{HttpJsonBackend, PostgresBackend};
pub use config::{check_endpoint, LlmEndpoint, RuntimeConfig};
pub use generator::ChatCompletionsGenerator;
