//! Debate orchestrator: drives opening, rebuttal and closing rounds.
//!
//! Ties together the state machine, the participant pool, citation
//! injection, convergence detection and guardrails to run a complete debate
//! over a [`DebateSession`].
//!
//! Within a round, turns are generated concurrently (bounded by a shared
//! semaphore) but appended and emitted in fixed role order. Crossing the
//! deadline or cancellation drops the generations still in flight; turns
//! that already finished are kept and the unfinished roles are recorded as
//! silenced.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::convergence::{novelty, ConvergenceState, SimilarityFn};
use super::guardrails::{GuardrailEngine, GuardrailOutcome};
use super::state::{
    DebatePhase, DebateSession, DebateTurn, SessionStatus, TurnFailure, TurnType,
};
use crate::citations::{inject_citations, CitationTolerance};
use crate::events::{SharedEventBus, Stage, StageStatus};
use crate::facts::FactSet;
use crate::participants::{
    build_turn_context, GenerationError, Participant, ParticipantRole, TextGenerator, TurnContext,
};
use crate::router::{ComplexityTier, DebateConfig};

/// Tunables for turn production and convergence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Per-attempt generation timeout.
    pub turn_timeout: Duration,
    /// Extra attempts after a failed generation.
    pub turn_retries: u32,
    /// Simultaneous generations across all sessions sharing this orchestrator.
    pub generation_concurrency: usize,
    pub convergence_threshold: f64,
    /// Moving-average window; `None` uses the tier's check interval.
    pub convergence_window: Option<u32>,
    pub citation_tolerance: CitationTolerance,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            turn_timeout: Duration::from_secs(45),
            turn_retries: 1,
            generation_concurrency: 3,
            convergence_threshold: 0.2,
            convergence_window: None,
            citation_tolerance: CitationTolerance::default(),
        }
    }
}

/// Error from the debate orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebateError {
    /// State transition failed.
    TransitionFailed(String),
    /// `run` was called on a session that is not in `Init`.
    AlreadyStarted(DebatePhase),
}

impl std::fmt::Display for DebateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransitionFailed(msg) => write!(f, "transition failed: {}", msg),
            Self::AlreadyStarted(phase) => write!(f, "debate already started (phase {})", phase),
        }
    }
}

impl std::error::Error for DebateError {}

/// Outcome of a completed debate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateOutcome {
    pub terminal_phase: DebatePhase,
    pub status: SessionStatus,
    pub turns_used: u32,
    pub converged: bool,
    /// Guardrail that ended the debate; `Continue` when closing finished.
    pub termination: GuardrailOutcome,
    pub silenced: usize,
    pub elapsed_ms: u64,
}

impl DebateOutcome {
    pub fn is_success(&self) -> bool {
        self.terminal_phase == DebatePhase::Done
    }

    /// Compact summary line.
    pub fn summary_line(&self) -> String {
        format!(
            "[{}] {} turns | converged={} | silenced={} | {} | {}ms",
            self.terminal_phase.to_string().to_uppercase(),
            self.turns_used,
            self.converged,
            self.silenced,
            self.termination,
            self.elapsed_ms
        )
    }
}

/// How a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundEnd {
    Completed { produced: u32 },
    Deadline,
    Cancelled,
}

/// Turns appended and uncited numbers flagged in one round.
#[derive(Default)]
struct RoundTally {
    produced: u32,
    flagged: Vec<serde_json::Value>,
}

/// One participant's generation result.
struct TurnAttempt {
    role: ParticipantRole,
    attempts: u32,
    result: Result<String, GenerationError>,
}

/// The debate orchestrator.
pub struct DebateOrchestrator {
    generator: Arc<dyn TextGenerator>,
    similarity: Arc<dyn SimilarityFn>,
    bus: Option<SharedEventBus>,
    permits: Arc<Semaphore>,
    settings: OrchestratorSettings,
}

impl DebateOrchestrator {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        similarity: Arc<dyn SimilarityFn>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            generator,
            similarity,
            bus: None,
            permits: Arc::new(Semaphore::new(settings.generation_concurrency.max(1))),
            settings,
        }
    }

    /// Publish progress to `bus`.
    pub fn with_bus(mut self, bus: SharedEventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Share one generation pool across orchestrators.
    pub fn with_permits(mut self, permits: Arc<Semaphore>) -> Self {
        self.permits = permits;
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// A fresh session wired with this orchestrator's convergence tunables.
    pub fn new_session(
        &self,
        question: &str,
        tier: ComplexityTier,
        config: DebateConfig,
        facts: Arc<FactSet>,
    ) -> DebateSession {
        let window = self
            .settings
            .convergence_window
            .unwrap_or(config.convergence_check_interval);
        let participants = crate::participants::select_participants(config.participant_count)
            .into_iter()
            .map(|p| p.role)
            .collect();
        DebateSession::new(
            question,
            tier,
            config,
            facts,
            participants,
            ConvergenceState::new(self.settings.convergence_threshold, window),
        )
    }

    fn emit(&self, session_id: &str, stage: Stage, status: StageStatus, payload: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.emit(session_id, stage, status, payload);
        }
    }

    /// Run the debate to a terminal phase.
    ///
    /// Always leaves `session` in `Done`, `Timeout` or `Error`; the turns
    /// produced so far are kept in every case.
    pub async fn run(
        &self,
        session: &mut DebateSession,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<DebateOutcome, DebateError> {
        if session.phase() != DebatePhase::Init {
            return Err(DebateError::AlreadyStarted(session.phase()));
        }
        let started = Instant::now();
        let guard = GuardrailEngine::new(deadline);
        let interval = session.config().convergence_check_interval.max(1);

        info!(
            session_id = %session.id(),
            tier = %session.tier(),
            max_turns = session.config().max_turns,
            participants = session.participants().len(),
            "Debate starting"
        );
        self.emit(
            session.id(),
            Stage::Debate,
            StageStatus::Running,
            json!({
                "max_turns": session.config().max_turns,
                "participants": session.participants(),
            }),
        );

        let precheck = guard.evaluate(session, cancel.is_cancelled());
        if precheck.is_failure() {
            return self.finish(session, precheck, started);
        }

        Self::step(session, DebatePhase::Opening, "opening statements")?;
        match self.run_round(session, TurnType::Opening, deadline, cancel).await {
            RoundEnd::Deadline => {
                return self.finish(session, guard.evaluate(session, false), started);
            }
            RoundEnd::Cancelled => return self.finish(session, GuardrailOutcome::Cancelled, started),
            RoundEnd::Completed { produced: 0 } => {
                let round = session.current_round();
                return self.finish(session, GuardrailOutcome::AllParticipantsSilent { round }, started);
            }
            RoundEnd::Completed { .. } => {}
        }

        let mut since_check = 0u32;
        let termination = loop {
            let outcome = guard.evaluate(session, cancel.is_cancelled());
            if outcome.is_failure() {
                return self.finish(session, outcome, started);
            }
            if outcome.should_stop() {
                break outcome;
            }

            Self::step(session, DebatePhase::Round, "rebuttal round")?;
            let produced = match self.run_round(session, TurnType::Rebuttal, deadline, cancel).await {
                RoundEnd::Deadline => {
                    return self.finish(session, guard.evaluate(session, false), started);
                }
                RoundEnd::Cancelled => {
                    return self.finish(session, GuardrailOutcome::Cancelled, started);
                }
                RoundEnd::Completed { produced: 0 } => {
                    let round = session.current_round();
                    return self.finish(
                        session,
                        GuardrailOutcome::AllParticipantsSilent { round },
                        started,
                    );
                }
                RoundEnd::Completed { produced } => produced,
            };

            since_check += produced;
            if since_check >= interval {
                since_check = 0;
                Self::step(session, DebatePhase::ConvergenceCheck, "check interval reached")?;
                let active = self.active_participants(session);
                let at_turn = session.turns().len() as u32;
                let check = session.convergence_mut().check(&active, at_turn).clone();
                debug!(
                    session_id = %session.id(),
                    at_turn,
                    converged = check.converged,
                    "Convergence check"
                );
                self.emit(
                    session.id(),
                    Stage::Debate,
                    StageStatus::Running,
                    json!({ "convergence_check": check }),
                );
                if check.converged {
                    session.mark_converged();
                    info!(session_id = %session.id(), at_turn, "Debate converged");
                    break GuardrailOutcome::Continue;
                }
            }
        };

        let converged = session.convergence().is_converged();
        Self::step(session, DebatePhase::Closing, &termination.to_string())?;
        if converged && session.remaining_turns() > 0 {
            match self.run_round(session, TurnType::Closing, deadline, cancel).await {
                RoundEnd::Deadline => {
                    return self.finish(session, guard.evaluate(session, false), started);
                }
                RoundEnd::Cancelled => {
                    return self.finish(session, GuardrailOutcome::Cancelled, started);
                }
                RoundEnd::Completed { produced: 0 } => {
                    let round = session.current_round();
                    return self.finish(
                        session,
                        GuardrailOutcome::AllParticipantsSilent { round },
                        started,
                    );
                }
                RoundEnd::Completed { .. } => {}
            }
        }

        self.finish(session, termination, started)
    }

    fn step(session: &mut DebateSession, to: DebatePhase, reason: &str) -> Result<(), DebateError> {
        session
            .transition(to, reason)
            .map_err(|e| DebateError::TransitionFailed(e.to_string()))
    }

    /// Move to the terminal phase implied by `termination` and report.
    fn finish(
        &self,
        session: &mut DebateSession,
        termination: GuardrailOutcome,
        started: Instant,
    ) -> Result<DebateOutcome, DebateError> {
        let terminal = match termination {
            GuardrailOutcome::DeadlineExceeded { .. } => DebatePhase::Timeout,
            GuardrailOutcome::AllParticipantsSilent { .. } | GuardrailOutcome::Cancelled => {
                DebatePhase::Error
            }
            GuardrailOutcome::Continue | GuardrailOutcome::MaxTurnsReached { .. } => {
                DebatePhase::Done
            }
        };
        if !session.phase().is_terminal() {
            Self::step(session, terminal, &termination.to_string())?;
        }

        let outcome = DebateOutcome {
            terminal_phase: session.phase(),
            status: session.status(),
            turns_used: session.turns().len() as u32,
            converged: session.convergence().is_converged(),
            termination,
            silenced: session.failures().len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        match outcome.terminal_phase {
            DebatePhase::Done => info!(session_id = %session.id(), "{}", outcome.summary_line()),
            _ => warn!(session_id = %session.id(), "{}", outcome.summary_line()),
        }
        let status = if outcome.is_success() {
            StageStatus::Complete
        } else {
            StageStatus::Error
        };
        self.emit(
            session.id(),
            Stage::Debate,
            status,
            serde_json::to_value(&outcome).unwrap_or_default(),
        );
        Ok(outcome)
    }

    /// Participants not silenced in the latest round.
    fn active_participants(&self, session: &DebateSession) -> Vec<ParticipantRole> {
        let round = session.current_round();
        session
            .participants()
            .iter()
            .copied()
            .filter(|role| {
                !session
                    .failures()
                    .iter()
                    .any(|f| f.round == round && f.participant_role == *role)
            })
            .collect()
    }

    fn turn_future(
        &self,
        role: ParticipantRole,
        context: String,
        turn_type: TurnType,
        allowed: Vec<String>,
        session_id: String,
    ) -> BoxFuture<'static, TurnAttempt> {
        let generator = Arc::clone(&self.generator);
        let permits = Arc::clone(&self.permits);
        let bus = self.bus.clone();
        let timeout = self.settings.turn_timeout;
        let retries = self.settings.turn_retries;

        Box::pin(async move {
            let participant = Participant::new(role);
            let constraints = participant.constraints(turn_type, allowed);
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return TurnAttempt {
                        role,
                        attempts: 0,
                        result: Err(GenerationError::Unavailable("generation pool closed".into())),
                    };
                }
            };
            if let Some(bus) = &bus {
                bus.emit(
                    &session_id,
                    Stage::Agent(role),
                    StageStatus::Running,
                    json!({ "turn_type": turn_type }),
                );
            }

            let mut attempts = 0;
            loop {
                attempts += 1;
                let result = match tokio::time::timeout(
                    timeout,
                    participant.produce_turn(generator.as_ref(), &context, &constraints),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(GenerationError::Timeout(timeout)),
                };
                match result {
                    Ok(text) => {
                        return TurnAttempt {
                            role,
                            attempts,
                            result: Ok(text),
                        }
                    }
                    Err(e) if attempts > retries => {
                        return TurnAttempt {
                            role,
                            attempts,
                            result: Err(e),
                        }
                    }
                    Err(e) => {
                        warn!(role = %role, attempt = attempts, error = %e, "Turn generation failed, retrying");
                    }
                }
            }
        })
    }

    /// Run one round for as many participants as the budget allows.
    async fn run_round(
        &self,
        session: &mut DebateSession,
        turn_type: TurnType,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> RoundEnd {
        let roster: Vec<ParticipantRole> = session
            .participants()
            .iter()
            .copied()
            .take(session.remaining_turns() as usize)
            .collect();
        let round = session.current_round();
        let allowed = session.facts().query_ids();

        let mut pending: FuturesUnordered<BoxFuture<'static, (usize, TurnAttempt)>> =
            FuturesUnordered::new();
        for (slot, role) in roster.iter().enumerate() {
            let context = build_turn_context(
                *role,
                &TurnContext {
                    question: session.question(),
                    facts: session.facts(),
                    prior_turns: session.turns(),
                    turn_type,
                    round,
                },
            );
            let turn = self.turn_future(
                *role,
                context,
                turn_type,
                allowed.clone(),
                session.id().to_string(),
            );
            pending.push(turn.map(move |attempt| (slot, attempt)).boxed());
        }

        // Finished attempts wait in their roster slot until every earlier
        // slot has been settled.
        let mut slots: Vec<Option<TurnAttempt>> = roster.iter().map(|_| None).collect();
        let mut next_slot = 0usize;
        let mut tally = RoundTally::default();
        let interrupted = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(session_id = %session.id(), round, "Debate cancelled mid-round");
                    break Some(RoundEnd::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(session_id = %session.id(), round, "Session deadline crossed mid-round");
                    break Some(RoundEnd::Deadline);
                }
                next = pending.next() => {
                    let Some((slot, attempt)) = next else { break None };
                    slots[slot] = Some(attempt);
                    while let Some(attempt) = slots.get_mut(next_slot).and_then(Option::take) {
                        self.settle(session, attempt, turn_type, round, &mut tally);
                        next_slot += 1;
                    }
                }
            }
        };

        if let Some(end) = interrupted {
            while let Some(Some((slot, attempt))) = pending.next().now_or_never() {
                slots[slot] = Some(attempt);
            }
            drop(pending);
            let reason = match end {
                RoundEnd::Cancelled => "cancelled before the turn finished",
                _ => "session deadline crossed before the turn finished",
            };
            let mut abandoned = 0usize;
            for (slot, role) in roster.iter().enumerate().skip(next_slot) {
                match slots[slot].take() {
                    Some(attempt) => self.settle(session, attempt, turn_type, round, &mut tally),
                    None => {
                        abandoned += 1;
                        self.silence(session, *role, round, 1, reason);
                    }
                }
            }
            info!(
                session_id = %session.id(),
                round,
                kept = tally.produced,
                abandoned,
                "Round cut off; finished turns kept"
            );
            return end;
        }

        self.emit(
            session.id(),
            Stage::Critique,
            StageStatus::Complete,
            json!({ "round": round, "turn_type": turn_type, "flagged": tally.flagged }),
        );
        RoundEnd::Completed {
            produced: tally.produced,
        }
    }

    /// Append a successful attempt or record the participant as silenced.
    fn settle(
        &self,
        session: &mut DebateSession,
        attempt: TurnAttempt,
        turn_type: TurnType,
        round: u32,
        tally: &mut RoundTally,
    ) {
        match attempt.result {
            Ok(text) => {
                let turn = self.accept_turn(session, attempt.role, turn_type, round, &text);
                if !turn.uncited_numbers.is_empty() {
                    tally.flagged.push(json!({
                        "participant_role": turn.participant_role,
                        "turn_index": turn.turn_index,
                        "numbers": turn.uncited_numbers,
                    }));
                }
                tally.produced += 1;
            }
            Err(e) => self.silence(session, attempt.role, round, attempt.attempts, &e.to_string()),
        }
    }

    fn silence(
        &self,
        session: &mut DebateSession,
        role: ParticipantRole,
        round: u32,
        attempts: u32,
        reason: &str,
    ) {
        warn!(
            session_id = %session.id(),
            role = %role,
            round,
            attempts,
            error = reason,
            "Participant silenced for round"
        );
        self.emit(
            session.id(),
            Stage::Agent(role),
            StageStatus::Error,
            json!({ "round": round, "reason": reason }),
        );
        session.record_failure(TurnFailure {
            round,
            participant_role: role,
            attempts,
            reason: reason.to_string(),
        });
    }

    /// Inject citations, score novelty, append and publish one turn.
    fn accept_turn(
        &self,
        session: &mut DebateSession,
        role: ParticipantRole,
        turn_type: TurnType,
        round: u32,
        text: &str,
    ) -> DebateTurn {
        let injection = inject_citations(text, session.facts(), self.settings.citation_tolerance);
        let previous = session.last_turn_by(role).map(|t| t.message_text.as_str());
        let novelty_score = novelty(self.similarity.as_ref(), previous, &injection.text);
        session.convergence_mut().record(role, turn_type, novelty_score);

        let turn = session
            .append_turn(DebateTurn {
                turn_index: 0,
                round,
                participant_role: role,
                turn_type,
                message_text: injection.text,
                citations: injection.citations,
                uncited_numbers: injection.uncited_numbers,
                novelty_score,
                created_at: Utc::now(),
            })
            .clone();

        debug!(
            session_id = %session.id(),
            role = %role,
            turn_index = turn.turn_index,
            novelty = novelty_score,
            citations = turn.citations.len(),
            "Turn appended"
        );
        self.emit(
            session.id(),
            Stage::Agent(role),
            StageStatus::Complete,
            json!({ "turn_index": turn.turn_index, "novelty_score": novelty_score }),
        );
        self.emit(
            session.id(),
            Stage::DebateTurn,
            StageStatus::Complete,
            serde_json::to_value(&turn).unwrap_or_default(),
        );
        turn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debate::convergence::JaccardSimilarity;
    use crate::events::EventBus;
    use crate::facts::Fact;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::participants::TurnConstraints;

    /// Says something new every time.
    struct Fresh(AtomicU32);

    #[async_trait]
    impl TextGenerator for Fresh {
        async fn generate(
            &self,
            role: ParticipantRole,
            _context: &str,
            _constraints: &TurnConstraints,
        ) -> Result<String, GenerationError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{} point{} alpha{} beta{} gamma{}", role, n, n, n, n))
        }
    }

    /// Repeats itself, so it converges.
    struct Parrot;

    #[async_trait]
    impl TextGenerator for Parrot {
        async fn generate(
            &self,
            role: ParticipantRole,
            _context: &str,
            _constraints: &TurnConstraints,
        ) -> Result<String, GenerationError> {
            Ok(format!("{} holds that unemployment stands at 10%", role))
        }
    }

    /// Fails for one role, works for the rest.
    struct FailsFor(ParticipantRole, AtomicU32);

    #[async_trait]
    impl TextGenerator for FailsFor {
        async fn generate(
            &self,
            role: ParticipantRole,
            _context: &str,
            _constraints: &TurnConstraints,
        ) -> Result<String, GenerationError> {
            if role == self.0 {
                self.1.fetch_add(1, Ordering::SeqCst);
                return Err(GenerationError::RequestFailed("boom".into()));
            }
            Ok(format!("{} speaks", role))
        }
    }

    fn orchestrator(generator: Arc<dyn TextGenerator>) -> DebateOrchestrator {
        DebateOrchestrator::new(
            generator,
            Arc::new(JaccardSimilarity::new()),
            OrchestratorSettings {
                turn_timeout: Duration::from_secs(5),
                ..OrchestratorSettings::default()
            },
        )
    }

    fn config(max_turns: u32, participants: usize, interval: u32) -> DebateConfig {
        DebateConfig {
            max_turns,
            participant_count: participants,
            convergence_check_interval: interval,
        }
    }

    fn facts() -> Arc<FactSet> {
        Arc::new(FactSet::from_facts(vec![Fact {
            metric: "unemployment_rate".into(),
            value: 0.10,
            unit: None,
            year: None,
            source_query_id: "q1".into(),
            dimensions: BTreeMap::new(),
        }]))
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(600)
    }

    #[tokio::test]
    async fn test_budget_is_hard_ceiling() {
        let orch = orchestrator(Arc::new(Fresh(AtomicU32::new(0))));
        let mut session = orch.new_session("q", ComplexityTier::Standard, config(10, 3, 3), facts());
        let outcome = orch
            .run(&mut session, far_deadline(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.terminal_phase, DebatePhase::Done);
        assert_eq!(outcome.turns_used, 10);
        assert!(!outcome.converged);
        assert_eq!(outcome.termination, GuardrailOutcome::MaxTurnsReached { turns: 10 });
        let idx: Vec<u32> = session.turns().iter().map(|t| t.turn_index).collect();
        assert_eq!(idx, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_turns_in_fixed_role_order() {
        let orch = orchestrator(Arc::new(Fresh(AtomicU32::new(0))));
        let mut session = orch.new_session("q", ComplexityTier::Standard, config(6, 3, 3), facts());
        orch.run(&mut session, far_deadline(), &CancellationToken::new())
            .await
            .unwrap();
        let roles: Vec<ParticipantRole> =
            session.turns().iter().map(|t| t.participant_role).collect();
        let order = [
            ParticipantRole::Strategist,
            ParticipantRole::Economist,
            ParticipantRole::RiskAnalyst,
        ];
        assert_eq!(&roles[..3], &order);
        assert_eq!(&roles[3..], &order);
        assert_eq!(session.turns()[0].turn_type, TurnType::Opening);
        assert_eq!(session.turns()[3].turn_type, TurnType::Rebuttal);
    }

    #[tokio::test]
    async fn test_convergence_leads_to_closing() {
        let orch = orchestrator(Arc::new(Parrot));
        let mut session = orch.new_session("q", ComplexityTier::Complex, config(16, 2, 2), facts());
        let outcome = orch
            .run(&mut session, far_deadline(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.converged);
        assert_eq!(outcome.terminal_phase, DebatePhase::Done);
        // opening 2 + rebuttal 2 + closing 2
        assert_eq!(outcome.turns_used, 6);
        let last = session.turns().last().unwrap();
        assert_eq!(last.turn_type, TurnType::Closing);
        assert!(last.citations.contains("q1"));
        assert!(session.turns()[2].novelty_score < 0.2);
    }

    #[tokio::test]
    async fn test_failing_participant_is_silenced() {
        let generator = Arc::new(FailsFor(ParticipantRole::Economist, AtomicU32::new(0)));
        let orch = orchestrator(generator.clone());
        let mut session = orch.new_session("q", ComplexityTier::Standard, config(4, 2, 2), facts());
        let outcome = orch
            .run(&mut session, far_deadline(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.terminal_phase, DebatePhase::Done);
        assert!(session
            .turns()
            .iter()
            .all(|t| t.participant_role == ParticipantRole::Strategist));
        assert!(outcome.silenced >= 1);
        assert_eq!(session.failures()[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_all_silent_is_error() {
        let generator = Arc::new(FailsFor(ParticipantRole::Strategist, AtomicU32::new(0)));
        let orch = orchestrator(generator.clone());
        let mut session = orch.new_session("q", ComplexityTier::Simple, config(4, 1, 2), facts());
        let outcome = orch
            .run(&mut session, far_deadline(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.terminal_phase, DebatePhase::Error);
        assert_eq!(outcome.status, SessionStatus::Error);
        assert_eq!(generator.1.load(Ordering::SeqCst), 2);
        assert!(session.turns().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let orch = orchestrator(Arc::new(Parrot));
        let mut session = orch.new_session("q", ComplexityTier::Simple, config(4, 2, 2), facts());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = orch.run(&mut session, far_deadline(), &cancel).await.unwrap();
        assert_eq!(outcome.terminal_phase, DebatePhase::Error);
        assert_eq!(outcome.termination, GuardrailOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_events_emitted_per_turn() {
        let bus = EventBus::with_history().shared();
        let orch = orchestrator(Arc::new(Fresh(AtomicU32::new(0)))).with_bus(bus.clone());
        let mut session = orch.new_session("q", ComplexityTier::Simple, config(4, 2, 2), facts());
        orch.run(&mut session, far_deadline(), &CancellationToken::new())
            .await
            .unwrap();

        let history = bus.history();
        let turns = history.iter().filter(|e| e.stage == Stage::DebateTurn).count();
        assert_eq!(turns, 4);
        assert!(history.iter().any(|e| e.stage == Stage::Critique));
        assert!(history.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    /// Never answers for one role; the rest answer at once.
    struct StallsFor(ParticipantRole);

    #[async_trait]
    impl TextGenerator for StallsFor {
        async fn generate(
            &self,
            role: ParticipantRole,
            _context: &str,
            _constraints: &TurnConstraints,
        ) -> Result<String, GenerationError> {
            if role == self.0 {
                return std::future::pending().await;
            }
            Ok(format!("{} opens with a position", role))
        }
    }

    fn patient_orchestrator(generator: Arc<dyn TextGenerator>) -> DebateOrchestrator {
        DebateOrchestrator::new(
            generator,
            Arc::new(JaccardSimilarity::new()),
            OrchestratorSettings {
                turn_timeout: Duration::from_secs(300),
                ..OrchestratorSettings::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_keeps_finished_turns_of_the_round() {
        let bus = EventBus::with_history().shared();
        let orch =
            patient_orchestrator(Arc::new(StallsFor(ParticipantRole::Strategist))).with_bus(bus.clone());
        let mut session = orch.new_session("q", ComplexityTier::Standard, config(9, 3, 3), facts());

        let started = Instant::now();
        let deadline = started + Duration::from_secs(30);
        let outcome = orch
            .run(&mut session, deadline, &CancellationToken::new())
            .await
            .unwrap();

        assert!(started.elapsed() <= Duration::from_secs(30) + Duration::from_millis(50));
        assert_eq!(outcome.terminal_phase, DebatePhase::Timeout);
        assert_eq!(outcome.turns_used, 2);
        let roles: Vec<ParticipantRole> =
            session.turns().iter().map(|t| t.participant_role).collect();
        assert_eq!(roles, vec![ParticipantRole::Economist, ParticipantRole::RiskAnalyst]);
        let idx: Vec<u32> = session.turns().iter().map(|t| t.turn_index).collect();
        assert_eq!(idx, vec![0, 1]);
        assert_eq!(session.failures().len(), 1);
        assert_eq!(session.failures()[0].participant_role, ParticipantRole::Strategist);

        let streamed = bus
            .history()
            .iter()
            .filter(|e| e.stage == Stage::DebateTurn)
            .count();
        assert_eq!(streamed, 2);
    }

    #[tokio::test]
    async fn test_cancel_mid_round_keeps_finished_turns() {
        let orch = patient_orchestrator(Arc::new(StallsFor(ParticipantRole::Strategist)));
        let mut session = orch.new_session("q", ComplexityTier::Standard, config(9, 3, 3), facts());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = orch.run(&mut session, far_deadline(), &cancel).await.unwrap();
        assert_eq!(outcome.terminal_phase, DebatePhase::Error);
        assert_eq!(outcome.termination, GuardrailOutcome::Cancelled);
        assert_eq!(session.turns().len(), 2);
        assert_eq!(session.turns()[0].participant_role, ParticipantRole::Economist);
    }

    #[tokio::test]
    async fn test_run_twice_rejected() {
        let orch = orchestrator(Arc::new(Parrot));
        let mut session = orch.new_session("q", ComplexityTier::Simple, config(2, 2, 2), facts());
        orch.run(&mut session, far_deadline(), &CancellationToken::new())
            .await
            .unwrap();
        let err = orch
            .run(&mut session, far_deadline(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, DebateError::AlreadyStarted(DebatePhase::Done));
    }
}
