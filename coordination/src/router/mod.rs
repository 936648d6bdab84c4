//! Question Router Module
//!
//! Routes a question to a debate shape based on its complexity tier.
//!
//! ```text
//! Tier      | max_turns | participants | check every | max sources
//! ----------|-----------|--------------|-------------|------------
//! simple    |     4     |      2       |      2      |      3
//! standard  |     9     |      3       |      3      |      6
//! complex   |    16     |      4       |      4      |     10
//! critical  |    20     |      5       |      5      |     12
//! ```

pub mod classifier;

pub use classifier::{classify, Classification, ComplexityTier, DebateConfig, QuestionClassifier};
