//! Turn-budget, deadline and silence guardrails for debate sessions.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::state::DebateSession;

/// Outcome when guardrails trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuardrailOutcome {
    /// Continue debate; no guardrails triggered.
    Continue,
    /// `max_turns` used up.
    MaxTurnsReached { turns: u32 },
    /// Session deadline crossed.
    DeadlineExceeded { overrun_ms: u64 },
    /// Every participant was silenced in the same round.
    AllParticipantsSilent { round: u32 },
    /// External cancellation.
    Cancelled,
}

impl GuardrailOutcome {
    pub fn should_stop(&self) -> bool {
        !matches!(self, Self::Continue)
    }

    /// Whether the outcome ends the session abnormally.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::DeadlineExceeded { .. } | Self::AllParticipantsSilent { .. } | Self::Cancelled
        )
    }
}

impl std::fmt::Display for GuardrailOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::MaxTurnsReached { turns } => write!(f, "max_turns_reached ({})", turns),
            Self::DeadlineExceeded { overrun_ms } => {
                write!(f, "deadline_exceeded (+{}ms)", overrun_ms)
            }
            Self::AllParticipantsSilent { round } => {
                write!(f, "all_participants_silent (round {})", round)
            }
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Evaluates guardrails between rounds.
#[derive(Debug, Clone, Copy)]
pub struct GuardrailEngine {
    deadline: Instant,
}

impl GuardrailEngine {
    pub fn new(deadline: Instant) -> Self {
        Self { deadline }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Check cancellation, deadline and turn budget, in that order.
    pub fn evaluate(&self, session: &DebateSession, cancelled: bool) -> GuardrailOutcome {
        if cancelled {
            return GuardrailOutcome::Cancelled;
        }

        let now = Instant::now();
        if now >= self.deadline {
            return GuardrailOutcome::DeadlineExceeded {
                overrun_ms: now.duration_since(self.deadline).as_millis() as u64,
            };
        }

        if session.remaining_turns() == 0 {
            return GuardrailOutcome::MaxTurnsReached {
                turns: session.turns().len() as u32,
            };
        }

        GuardrailOutcome::Continue
    }
}
