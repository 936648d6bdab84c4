//! Debate state machine: phases, transitions, turns and session tracking.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::convergence::ConvergenceState;
use crate::facts::FactSet;
use crate::participants::ParticipantRole;
use crate::router::{ComplexityTier, DebateConfig};

/// Phase of a debate session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebatePhase {
    /// Session created but not started.
    Init,
    /// One opening turn per participant.
    Opening,
    /// Rebuttal turns.
    Round,
    /// Novelty averages are being evaluated.
    ConvergenceCheck,
    /// Closing statements.
    Closing,
    /// Finished normally.
    Done,
    /// Session deadline crossed.
    Timeout,
    /// Unrecoverable failure or cancellation.
    Error,
}

impl DebatePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Timeout | Self::Error)
    }

    /// Valid transitions from this phase.
    pub fn valid_transitions(self) -> &'static [DebatePhase] {
        match self {
            Self::Init => &[Self::Opening, Self::Timeout, Self::Error],
            Self::Opening => &[Self::Round, Self::Closing, Self::Timeout, Self::Error],
            Self::Round => &[
                Self::Round,
                Self::ConvergenceCheck,
                Self::Closing,
                Self::Timeout,
                Self::Error,
            ],
            Self::ConvergenceCheck => &[Self::Round, Self::Closing, Self::Timeout, Self::Error],
            Self::Closing => &[Self::Done, Self::Timeout, Self::Error],
            Self::Done | Self::Timeout | Self::Error => &[],
        }
    }
}

impl std::fmt::Display for DebatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Opening => write!(f, "opening"),
            Self::Round => write!(f, "round"),
            Self::ConvergenceCheck => write!(f, "convergence_check"),
            Self::Closing => write!(f, "closing"),
            Self::Done => write!(f, "done"),
            Self::Timeout => write!(f, "timeout"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Externally visible session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    /// Convergence detected; closing statements in progress.
    Converged,
    Timeout,
    Error,
    Done,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Timeout | Self::Error | Self::Done)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Converged => write!(f, "converged"),
            Self::Timeout => write!(f, "timeout"),
            Self::Error => write!(f, "error"),
            Self::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnType {
    Opening,
    Rebuttal,
    Closing,
}

impl std::fmt::Display for TurnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opening => write!(f, "opening"),
            Self::Rebuttal => write!(f, "rebuttal"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

/// One appended turn. Immutable once in the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateTurn {
    /// 0-based position in the session.
    pub turn_index: u32,
    /// 1-based round; the opening is round 1.
    pub round: u32,
    pub participant_role: ParticipantRole,
    pub turn_type: TurnType,
    /// Text after citation injection.
    pub message_text: String,
    pub citations: BTreeSet<String>,
    /// Numbers that matched no fact.
    pub uncited_numbers: Vec<String>,
    /// `1 − similarity` to the same participant's previous turn.
    pub novelty_score: f64,
    pub created_at: DateTime<Utc>,
}

/// A participant that was silenced for a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnFailure {
    pub round: u32,
    pub participant_role: ParticipantRole,
    pub attempts: u32,
    pub reason: String,
}

/// A phase transition record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateTransition {
    pub from: DebatePhase,
    pub to: DebatePhase,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Error for invalid state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: DebatePhase,
    pub to: DebatePhase,
    pub reason: String,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} → {}: {}",
            self.from, self.to, self.reason
        )
    }
}

impl std::error::Error for TransitionError {}

/// A debate over one question. Only the orchestrator mutates it.
#[derive(Debug, Clone, Serialize)]
pub struct DebateSession {
    id: String,
    question: String,
    tier: ComplexityTier,
    config: DebateConfig,
    facts: Arc<FactSet>,
    participants: Vec<ParticipantRole>,
    phase: DebatePhase,
    status: SessionStatus,
    current_round: u32,
    turns: Vec<DebateTurn>,
    failures: Vec<TurnFailure>,
    convergence: ConvergenceState,
    transitions: Vec<DebateTransition>,
    created_at: DateTime<Utc>,
}

impl DebateSession {
    pub fn new(
        question: &str,
        tier: ComplexityTier,
        config: DebateConfig,
        facts: Arc<FactSet>,
        participants: Vec<ParticipantRole>,
        convergence: ConvergenceState,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            question: question.to_string(),
            tier,
            config,
            facts,
            participants,
            phase: DebatePhase::Init,
            status: SessionStatus::Running,
            current_round: 0,
            turns: Vec::new(),
            failures: Vec::new(),
            convergence,
            transitions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Replace the generated id, e.g. to correlate with an outer request.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn tier(&self) -> ComplexityTier {
        self.tier
    }

    pub fn config(&self) -> &DebateConfig {
        &self.config
    }

    pub fn facts(&self) -> &Arc<FactSet> {
        &self.facts
    }

    pub fn participants(&self) -> &[ParticipantRole] {
        &self.participants
    }

    pub fn phase(&self) -> DebatePhase {
        self.phase
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn current_round(&self) -> u32 {
        self.current_round
    }

    pub fn turns(&self) -> &[DebateTurn] {
        &self.turns
    }

    pub fn failures(&self) -> &[TurnFailure] {
        &self.failures
    }

    pub fn convergence(&self) -> &ConvergenceState {
        &self.convergence
    }

    pub fn transitions(&self) -> &[DebateTransition] {
        &self.transitions
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_complete(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Turns left under the `max_turns` ceiling.
    pub fn remaining_turns(&self) -> u32 {
        self.config.max_turns.saturating_sub(self.turns.len() as u32)
    }

    /// The most recent turn by `role`.
    pub fn last_turn_by(&self, role: ParticipantRole) -> Option<&DebateTurn> {
        self.turns.iter().rev().find(|t| t.participant_role == role)
    }

    /// Every distinct query id cited so far.
    pub fn cited_query_ids(&self) -> BTreeSet<String> {
        self.turns
            .iter()
            .flat_map(|t| t.citations.iter().cloned())
            .collect()
    }

    pub fn status_line(&self) -> String {
        format!(
            "[{}] round {} | {}/{} turns | {} silenced | tier={}",
            self.phase,
            self.current_round,
            self.turns.len(),
            self.config.max_turns,
            self.failures.len(),
            self.tier
        )
    }

    /// Transition to a new phase with a reason.
    pub(crate) fn transition(
        &mut self,
        to: DebatePhase,
        reason: &str,
    ) -> Result<(), TransitionError> {
        if !self.phase.valid_transitions().contains(&to) {
            return Err(TransitionError {
                from: self.phase,
                to,
                reason: format!(
                    "not a valid transition (allowed: {:?})",
                    self.phase.valid_transitions()
                ),
            });
        }

        self.transitions.push(DebateTransition {
            from: self.phase,
            to,
            timestamp: Utc::now(),
            reason: reason.to_string(),
        });
        self.phase = to;

        if matches!(to, DebatePhase::Opening | DebatePhase::Round | DebatePhase::Closing) {
            self.current_round += 1;
        }
        match to {
            DebatePhase::Done => self.status = SessionStatus::Done,
            DebatePhase::Timeout => self.status = SessionStatus::Timeout,
            DebatePhase::Error => self.status = SessionStatus::Error,
            _ => {}
        }
        Ok(())
    }

    /// Append a turn. Indices are assigned here, so they are always dense.
    pub(crate) fn append_turn(&mut self, mut turn: DebateTurn) -> &DebateTurn {
        turn.turn_index = self.turns.len() as u32;
        self.turns.push(turn);
        &self.turns[self.turns.len() - 1]
    }

    pub(crate) fn record_failure(&mut self, failure: TurnFailure) {
        self.failures.push(failure);
    }

    pub(crate) fn convergence_mut(&mut self) -> &mut ConvergenceState {
        &mut self.convergence
    }

    pub(crate) fn mark_converged(&mut self) {
        if !self.status.is_terminal() {
            self.status = SessionStatus::Converged;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(max_turns: u32) -> DebateSession {
        DebateSession::new(
            "Is inflation sticky?",
            ComplexityTier::Standard,
            DebateConfig {
                max_turns,
                participant_count: 2,
                convergence_check_interval: 2,
            },
            Arc::new(FactSet::new()),
            vec![ParticipantRole::Strategist, ParticipantRole::Economist],
            ConvergenceState::new(0.2, 2),
        )
    }

    fn turn(role: ParticipantRole) -> DebateTurn {
        DebateTurn {
            turn_index: 99,
            round: 1,
            participant_role: role,
            turn_type: TurnType::Opening,
            message_text: "text".into(),
            citations: BTreeSet::new(),
            uncited_numbers: vec![],
            novelty_score: 1.0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_new_session() {
        let s = session(4);
        assert_eq!(s.phase(), DebatePhase::Init);
        assert_eq!(s.status(), SessionStatus::Running);
        assert_eq!(s.remaining_turns(), 4);
        assert!(!s.is_complete());
        assert!(!s.id().is_empty());
    }

    #[test]
    fn test_full_cycle() {
        let mut s = session(4);
        s.transition(DebatePhase::Opening, "start").unwrap();
        s.transition(DebatePhase::Round, "rebut").unwrap();
        s.transition(DebatePhase::ConvergenceCheck, "interval").unwrap();
        s.transition(DebatePhase::Closing, "converged").unwrap();
        s.transition(DebatePhase::Done, "closed").unwrap();
        assert!(s.is_complete());
        assert_eq!(s.status(), SessionStatus::Done);
        assert_eq!(s.current_round(), 3);
        assert_eq!(s.transitions().len(), 5);
        assert_eq!(s.transitions()[0].from, DebatePhase::Init);
    }

    #[test]
    fn test_invalid_transition() {
        let mut s = session(4);
        let err = s.transition(DebatePhase::Done, "skip").unwrap_err();
        assert_eq!(err.from, DebatePhase::Init);
        assert_eq!(err.to, DebatePhase::Done);
        assert!(err.to_string().contains("init → done"));
    }

    #[test]
    fn test_terminal_has_no_exits() {
        let mut s = session(4);
        s.transition(DebatePhase::Opening, "start").unwrap();
        s.transition(DebatePhase::Timeout, "deadline").unwrap();
        assert_eq!(s.status(), SessionStatus::Timeout);
        assert!(s.transition(DebatePhase::Round, "again").is_err());
        assert!(s.transition(DebatePhase::Error, "again").is_err());
    }

    #[test]
    fn test_append_assigns_dense_indices() {
        let mut s = session(4);
        s.append_turn(turn(ParticipantRole::Strategist));
        s.append_turn(turn(ParticipantRole::Economist));
        s.append_turn(turn(ParticipantRole::Strategist));
        let idx: Vec<u32> = s.turns().iter().map(|t| t.turn_index).collect();
        assert_eq!(idx, vec![0, 1, 2]);
        assert_eq!(s.remaining_turns(), 1);
        assert_eq!(s.last_turn_by(ParticipantRole::Strategist).unwrap().turn_index, 2);
    }

    #[test]
    fn test_converged_does_not_override_terminal() {
        let mut s = session(4);
        s.mark_converged();
        assert_eq!(s.status(), SessionStatus::Converged);
        s.transition(DebatePhase::Error, "boom").unwrap();
        s.mark_converged();
        assert_eq!(s.status(), SessionStatus::Error);
    }

    #[test]
    fn test_status_line() {
        let mut s = session(4);
        s.transition(DebatePhase::Opening, "start").unwrap();
        let line = s.status_line();
        assert!(line.contains("[opening]"));
        assert!(line.contains("0/4 turns"));
    }
}
