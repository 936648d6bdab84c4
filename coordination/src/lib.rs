//! Analyst Coordination Library
//!
//! Answers analytical questions by running a structured debate between
//! role-specialized participants whose claims are grounded in facts fetched
//! from a registry of curated queries.
//!
//! # Components
//!
//! ## Data
//! - [`data::QueryRegistry`]: named, parameterized query definitions loaded from TOML/YAML
//! - [`data::QueryExecutor`]: single-flight TTL cache, retries and circuit breaking per backend
//!
//! ## Debate
//! - [`router::QuestionClassifier`]: complexity tier and debate shape for a question
//! - [`facts::FactExtractor`]: concurrent prefetch into a [`facts::FactSet`]
//! - [`debate::DebateOrchestrator`]: turn scheduling, convergence and guardrails
//! - [`citations`]: numeric claim linking and claim verification
//! - [`synthesis::Synthesizer`]: narrative, confidence and caveats
//!
//! ## Runtime
//! - [`engine::AnalysisEngine`]: one question in, one [`SynthesisResult`] out
//! - [`events::EventBus`]: ordered per-session progress events
//! - [`config::AnalystConfig`]: TOML config with `ANALYST_*` env overrides

#![allow(clippy::uninlined_format_args)]

pub mod citations;
pub mod config;
pub mod data;
pub mod debate;
pub mod engine;
pub mod events;
pub mod facts;
pub mod participants;
pub mod resilience;
pub mod router;
pub mod synthesis;

// Runtime
pub use config::{AnalystConfig, ConfigError};
pub use engine::{AnalysisContext, AnalysisEngine, RunOptions};
pub use events::{EventBus, EventFilter, SharedEventBus, Stage, StageStatus, StreamEvent};

// Data layer
pub use data::{
    BackendError, BackendSet, DataError, FixtureBackend, QueryBackend, QueryExecutor,
    QueryRegistry, QueryResult, RegistryError,
};
pub use facts::{Fact, FactSet};

// Debate and synthesis
pub use citations::{ClaimVerifier, FactConsistencyVerifier, Verdict, VerificationResult};
pub use debate::{DebatePhase, DebateSession, SessionStatus};
pub use participants::{GenerationError, ParticipantRole, TextGenerator, TurnConstraints};
pub use resilience::RetryPolicy;
pub use router::{ComplexityTier, DebateConfig, QuestionClassifier};
pub use synthesis::{Completeness, SynthesisResult, Synthesizer};
