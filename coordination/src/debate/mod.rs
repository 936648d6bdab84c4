//! Debate Orchestration: multi-party, fact-grounded debate
//!
//! State machine for a structured debate between role-specialized
//! participants. Turns are grounded in a session's [`FactSet`](crate::facts::FactSet)
//! and every numeric claim is linked to its source query.
//!
//! # Debate Flow
//!
//! ```text
//! Init → Opening → Round ──► ConvergenceCheck ──┬─ converged → Closing → Done
//!          │         ▲              │           │
//!          │         └──────────────┘           └─ budget spent → Closing → Done
//!          │         (not converged)
//!          └─ deadline at any point → Timeout
//!          └─ cancel / all silent   → Error
//! ```

pub mod convergence;
pub mod guardrails;
pub mod orchestrator;
pub mod state;

pub use convergence::{
    novelty, ConvergenceCheck, ConvergenceState, JaccardSimilarity, SimilarityFn,
};
pub use guardrails::{GuardrailEngine, GuardrailOutcome};
pub use orchestrator::{DebateError, DebateOrchestrator, DebateOutcome, OrchestratorSettings};
pub use state::{
    DebatePhase, DebateSession, DebateTransition, DebateTurn, SessionStatus, TransitionError,
    TurnFailure, TurnType,
};
