//! Participant Pool: role-specialized debaters behind one generation seam.
//!
//! Participants are a closed set of roles. Every role produces turns through
//! the same [`TextGenerator`]; what differs is the brief it is given and its
//! [`Capabilities`]. Adding a role means adding a variant here and a brief in
//! [`prompts`].

pub mod prompts;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::debate::TurnType;

pub use prompts::{build_synthesis_context, build_turn_context, role_brief, TurnContext};

/// Errors from a text generation call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerationError {
    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Generation request failed: {0}")]
    RequestFailed(String),

    #[error("Rate limited: retry after {0:?}")]
    RateLimited(Duration),

    #[error("Generator returned an empty response")]
    EmptyResponse,

    #[error("Generator unavailable: {0}")]
    Unavailable(String),
}

/// Role of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    /// Frames options and second-order effects.
    Strategist,
    /// Macro and market mechanics.
    Economist,
    /// Downside scenarios and exposure.
    RiskAnalyst,
    /// Challenges unsupported claims.
    Skeptic,
    /// Magnitudes, rates and arithmetic.
    Quant,
    /// Writes the final narrative; never debates.
    Synthesizer,
}

impl ParticipantRole {
    /// Debate roles in fixed speaking order.
    pub fn debate_roles() -> &'static [ParticipantRole] {
        &[
            Self::Strategist,
            Self::Economist,
            Self::RiskAnalyst,
            Self::Skeptic,
            Self::Quant,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strategist => "strategist",
            Self::Economist => "economist",
            Self::RiskAnalyst => "risk_analyst",
            Self::Skeptic => "skeptic",
            Self::Quant => "quant",
            Self::Synthesizer => "synthesizer",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Strategist => "Options, positioning and second-order effects",
            Self::Economist => "Macro drivers, incentives and market mechanics",
            Self::RiskAnalyst => "Downside scenarios, exposure and tail risks",
            Self::Skeptic => "Stress-tests claims and demands evidence",
            Self::Quant => "Magnitudes, growth rates and arithmetic checks",
            Self::Synthesizer => "Integrates the debate into a cited conclusion",
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            Self::Synthesizer => Capabilities {
                debates: false,
                max_words: 450,
            },
            Self::Quant => Capabilities {
                debates: true,
                max_words: 180,
            },
            _ => Capabilities {
                debates: true,
                max_words: 220,
            },
        }
    }
}

impl std::fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ParticipantRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strategist" => Ok(Self::Strategist),
            "economist" => Ok(Self::Economist),
            "risk_analyst" => Ok(Self::RiskAnalyst),
            "skeptic" => Ok(Self::Skeptic),
            "quant" => Ok(Self::Quant),
            "synthesizer" => Ok(Self::Synthesizer),
            other => Err(format!("unknown participant role: {}", other)),
        }
    }
}

/// What a role is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Takes part in opening/rebuttal/closing rounds.
    pub debates: bool,
    /// Soft length limit passed to the generator.
    pub max_words: u32,
}

/// Constraints attached to every generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnConstraints {
    pub turn_type: TurnType,
    /// Every numeric claim must carry a `[src:<query_id>]` marker.
    pub require_citations: bool,
    /// The only query ids that may be cited.
    pub allowed_query_ids: Vec<String>,
    pub max_words: u32,
}

/// External text generation capability.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Produce text for `role` given the rendered `context`.
    async fn generate(
        &self,
        role: ParticipantRole,
        context: &str,
        constraints: &TurnConstraints,
    ) -> Result<String, GenerationError>;
}

/// A debate participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub role: ParticipantRole,
    pub capabilities: Capabilities,
}

impl Participant {
    pub fn new(role: ParticipantRole) -> Self {
        Self {
            role,
            capabilities: role.capabilities(),
        }
    }

    pub fn constraints(&self, turn_type: TurnType, allowed_query_ids: Vec<String>) -> TurnConstraints {
        TurnConstraints {
            turn_type,
            require_citations: true,
            allowed_query_ids,
            max_words: self.capabilities.max_words,
        }
    }

    /// Produce one turn's raw text. Empty output is an error.
    pub async fn produce_turn(
        &self,
        generator: &dyn TextGenerator,
        context: &str,
        constraints: &TurnConstraints,
    ) -> Result<String, GenerationError> {
        let text = generator.generate(self.role, context, constraints).await?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        Ok(trimmed.to_string())
    }
}

/// The first `count` debate roles, in speaking order.
pub fn select_participants(count: usize) -> Vec<Participant> {
    ParticipantRole::debate_roles()
        .iter()
        .take(count.max(1))
        .copied()
        .map(Participant::new)
        .collect()
}
