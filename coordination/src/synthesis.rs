//! Synthesizer: turns a finished debate into a cited, scored answer.
//!
//! Always produces a [`SynthesisResult`]. When the narrative cannot be
//! generated, or the debate ended on its deadline, a deterministic report is
//! assembled from the turns and facts already in hand.
//!
//! Confidence is `0.5·verified + 0.3·coverage + 0.2·completeness`, clamped to
//! `[0, 1]`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::citations::{
    extract_claims, inject_citations, split_sentences, verify_claims, CitationTolerance,
    ClaimVerifier, InjectionResult, Verdict,
};
use crate::debate::{DebateSession, SessionStatus};
use crate::events::{SharedEventBus, Stage, StageStatus};
use crate::facts::{DataGap, FactSet};
use crate::participants::{
    build_synthesis_context, Participant, ParticipantRole, TextGenerator,
};

/// How much of the debate the answer rests on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    Full,
    Partial,
    Emergency,
}

impl Completeness {
    /// `done → full`, `error → partial` (or `emergency` with no turns),
    /// anything else → `emergency`.
    pub fn for_session(status: SessionStatus, has_turns: bool) -> Self {
        match status {
            SessionStatus::Done => Self::Full,
            SessionStatus::Error if has_turns => Self::Partial,
            _ => Self::Emergency,
        }
    }

    pub fn factor(self) -> f64 {
        match self {
            Self::Full => 1.0,
            Self::Partial => 0.6,
            Self::Emergency => 0.3,
        }
    }
}

impl std::fmt::Display for Completeness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Partial => write!(f, "partial"),
            Self::Emergency => write!(f, "emergency"),
        }
    }
}

/// Tally of claim verdicts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub checked: usize,
    pub supported: usize,
    pub contradicted: usize,
    pub unverifiable: usize,
    /// External verification was not run (emergency mode).
    pub skipped: bool,
    /// Fraction used for confidence.
    pub verified_fraction: f64,
}

impl VerificationSummary {
    fn from_verdicts(verdicts: impl IntoIterator<Item = Verdict>) -> Self {
        let mut summary = Self::default();
        for verdict in verdicts {
            summary.checked += 1;
            match verdict {
                Verdict::Supported => summary.supported += 1,
                Verdict::Contradicted => summary.contradicted += 1,
                Verdict::Unverifiable => summary.unverifiable += 1,
            }
        }
        summary.verified_fraction = if summary.checked == 0 {
            0.5
        } else {
            summary.supported as f64 / summary.checked as f64
        };
        summary
    }

    fn skipped(citation_coverage: f64) -> Self {
        Self {
            skipped: true,
            verified_fraction: citation_coverage,
            ..Self::default()
        }
    }
}

/// Final output of an analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisResult {
    pub session_id: String,
    pub narrative: String,
    pub citations_used: Vec<String>,
    pub confidence_score: f64,
    pub completeness: Completeness,
    pub data_gaps: Vec<DataGap>,
    pub caveats: Vec<String>,
    pub verification: VerificationSummary,
    pub session_status: SessionStatus,
    pub turns_used: u32,
    /// The narrative came from the generator rather than the fallback report.
    pub generated: bool,
}

impl SynthesisResult {
    pub fn summary_line(&self) -> String {
        format!(
            "[{}] confidence={:.2} | {} citations | {} gaps | {} caveats",
            self.completeness,
            self.confidence_score,
            self.citations_used.len(),
            self.data_gaps.len(),
            self.caveats.len()
        )
    }
}

/// `0.5·verified + 0.3·coverage + 0.2·completeness`, clamped.
pub fn confidence(verified_fraction: f64, source_coverage: f64, completeness: Completeness) -> f64 {
    (0.5 * verified_fraction + 0.3 * source_coverage + 0.2 * completeness.factor()).clamp(0.0, 1.0)
}

/// Share of numeric claims across all turns that carry a known citation.
/// `0.5` when the transcript has no numeric claims.
pub fn transcript_citation_coverage(session: &DebateSession, tol: CitationTolerance) -> f64 {
    let (cited, total) = session.turns().iter().fold((0usize, 0usize), |(c, t), turn| {
        let check = inject_citations(&turn.message_text, session.facts(), tol);
        (
            c + check.matches.len(),
            t + check.matches.len() + check.uncited_numbers.len(),
        )
    });
    if total == 0 {
        0.5
    } else {
        cited as f64 / total as f64
    }
}

fn lead_sentences(text: &str, n: usize) -> String {
    split_sentences(text).into_iter().take(n).collect::<Vec<_>>().join(" ")
}

/// Deterministic report from facts and each participant's latest turn.
pub fn fallback_report(session: &DebateSession) -> String {
    let facts: &FactSet = session.facts();
    let mut out = format!("Question: {}\n", session.question().trim());

    if !facts.is_empty() {
        out.push_str("\nKey facts:\n");
        for fact in facts.facts() {
            out.push_str(&format!("- {} [src:{}]\n", fact.describe(), fact.source_query_id));
        }
    }

    let positions: Vec<(ParticipantRole, String)> = session
        .participants()
        .iter()
        .filter_map(|role| {
            session
                .last_turn_by(*role)
                .map(|t| (*role, lead_sentences(&t.message_text, 2)))
        })
        .collect();
    if positions.is_empty() {
        out.push_str("\nNo debate turns were completed.\n");
    } else {
        out.push_str("\nPositions:\n");
        for (role, text) in positions {
            out.push_str(&format!("- {}: {}\n", role, text));
        }
    }

    if !facts.gaps().is_empty() {
        out.push_str("\nMissing data:\n");
        for gap in facts.gaps() {
            out.push_str(&format!("- {} ({})\n", gap.query_id, gap.code));
        }
    }
    out
}

/// Tunables for synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisSettings {
    pub narrative_timeout: Duration,
    pub verification_timeout: Duration,
    pub max_claims: usize,
    pub verification_concurrency: usize,
    pub citation_tolerance: CitationTolerance,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            narrative_timeout: Duration::from_secs(60),
            verification_timeout: Duration::from_secs(5),
            max_claims: 20,
            verification_concurrency: 4,
            citation_tolerance: CitationTolerance::default(),
        }
    }
}

pub struct Synthesizer {
    generator: Arc<dyn TextGenerator>,
    verifier: Arc<dyn ClaimVerifier>,
    bus: Option<SharedEventBus>,
    settings: SynthesisSettings,
}

impl Synthesizer {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        verifier: Arc<dyn ClaimVerifier>,
        settings: SynthesisSettings,
    ) -> Self {
        Self {
            generator,
            verifier,
            bus: None,
            settings,
        }
    }

    pub fn with_bus(mut self, bus: SharedEventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    fn emit(&self, session_id: &str, stage: Stage, status: StageStatus, payload: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.emit(session_id, stage, status, payload);
        }
    }

    /// Ask the synthesizer role for a narrative.
    async fn generate_narrative(&self, session: &DebateSession) -> Result<String, String> {
        let context = build_synthesis_context(session.question(), session.facts(), session.turns());
        let participant = Participant::new(ParticipantRole::Synthesizer);
        let constraints = participant.constraints(
            crate::debate::TurnType::Closing,
            session.facts().query_ids(),
        );
        match tokio::time::timeout(
            self.settings.narrative_timeout,
            participant.produce_turn(self.generator.as_ref(), &context, &constraints),
        )
        .await
        {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "timed out after {}ms",
                self.settings.narrative_timeout.as_millis()
            )),
        }
    }

    /// Produce the final result for a session in any terminal state.
    pub async fn synthesize(&self, session: &DebateSession) -> SynthesisResult {
        let facts = session.facts();
        let completeness =
            Completeness::for_session(session.status(), !session.turns().is_empty());
        let tol = self.settings.citation_tolerance;
        let mut caveats = Vec::new();
        self.emit(
            session.id(),
            Stage::Synthesize,
            StageStatus::Running,
            json!({ "completeness": completeness }),
        );

        let (narrative, generated) = if completeness == Completeness::Emergency {
            (fallback_report(session), false)
        } else {
            match self.generate_narrative(session).await {
                Ok(text) => (text, true),
                Err(reason) => {
                    warn!(session_id = %session.id(), reason = %reason, "Narrative generation failed, using fallback report");
                    caveats.push(format!("Narrative generation failed ({}); showing assembled report", reason));
                    (fallback_report(session), false)
                }
            }
        };
        let injection = if generated {
            inject_citations(&narrative, facts, tol)
        } else {
            InjectionResult {
                text: narrative,
                ..InjectionResult::default()
            }
        };

        let verification = if completeness == Completeness::Emergency {
            VerificationSummary::skipped(transcript_citation_coverage(session, tol))
        } else {
            self.emit(session.id(), Stage::Verify, StageStatus::Running, json!({}));
            let claims = extract_claims(&injection.text);
            let checked = verify_claims(
                self.verifier.as_ref(),
                &claims,
                facts,
                self.settings.verification_timeout,
                self.settings.max_claims,
                self.settings.verification_concurrency,
            )
            .await;
            let summary = VerificationSummary::from_verdicts(checked.iter().map(|(_, r)| r.verdict));
            self.emit(
                session.id(),
                Stage::Verify,
                StageStatus::Complete,
                serde_json::to_value(&summary).unwrap_or_default(),
            );
            summary
        };

        let mut citations: BTreeSet<String> = session.cited_query_ids();
        citations.extend(injection.citations.iter().cloned());

        collect_caveats(&mut caveats, session, &verification, injection.ambiguous.len());

        let confidence_score = confidence(verification.verified_fraction, facts.coverage(), completeness);
        let result = SynthesisResult {
            session_id: session.id().to_string(),
            narrative: injection.text,
            citations_used: citations.into_iter().collect(),
            confidence_score,
            completeness,
            data_gaps: facts.gaps().to_vec(),
            caveats,
            verification,
            session_status: session.status(),
            turns_used: session.turns().len() as u32,
            generated,
        };

        info!(session_id = %session.id(), "{}", result.summary_line());
        self.emit(
            session.id(),
            Stage::Synthesize,
            StageStatus::Complete,
            json!({
                "completeness": result.completeness,
                "confidence_score": result.confidence_score,
                "citations_used": result.citations_used,
            }),
        );
        result
    }
}

fn collect_caveats(
    caveats: &mut Vec<String>,
    session: &DebateSession,
    verification: &VerificationSummary,
    ambiguous: usize,
) {
    match session.status() {
        SessionStatus::Timeout => caveats.push(
            "The debate hit its deadline; this report is assembled from the partial transcript"
                .to_string(),
        ),
        SessionStatus::Error => caveats.push("The debate ended early after an error".to_string()),
        _ => {}
    }

    for gap in session.facts().gaps() {
        caveats.push(format!("No data for {}: {}", gap.query_id, gap.reason));
    }
    for source in session.facts().stale_sources() {
        let asof = source
            .freshness
            .asof_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "unknown date".to_string());
        caveats.push(format!("Data for {} may be stale (as of {})", source.query_id, asof));
    }

    let uncited: usize = session.turns().iter().map(|t| t.uncited_numbers.len()).sum();
    if uncited > 0 {
        caveats.push(format!("{} numeric claims in the debate could not be linked to a source", uncited));
    }
    if ambiguous > 0 {
        caveats.push(format!("{} figures matched more than one source", ambiguous));
    }

    let silenced: BTreeSet<ParticipantRole> =
        session.failures().iter().map(|f| f.participant_role).collect();
    if !silenced.is_empty() {
        let names: Vec<&str> = silenced.iter().map(|r| r.as_str()).collect();
        caveats.push(format!("Some turns were lost from: {}", names.join(", ")));
    }

    if verification.contradicted > 0 {
        caveats.push(format!("{} claims contradict the cited data", verification.contradicted));
    }
    if verification.unverifiable > 0 {
        caveats.push(format!("{} claims could not be verified", verification.unverifiable));
    }
    if verification.skipped {
        caveats.push("Claim verification was skipped".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::citations::FactConsistencyVerifier;
    use crate::debate::{ConvergenceState, DebatePhase, DebateTurn, TurnType};
    use crate::facts::Fact;
    use crate::participants::{GenerationError, TurnConstraints};
    use crate::router::{ComplexityTier, DebateConfig};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::BTreeMap;

    struct Writes(&'static str);

    #[async_trait]
    impl TextGenerator for Writes {
        async fn generate(
            &self,
            _role: ParticipantRole,
            _context: &str,
            _constraints: &TurnConstraints,
        ) -> Result<String, GenerationError> {
            Ok(self.0.to_string())
        }
    }

    struct Down;

    #[async_trait]
    impl TextGenerator for Down {
        async fn generate(
            &self,
            _role: ParticipantRole,
            _context: &str,
            _constraints: &TurnConstraints,
        ) -> Result<String, GenerationError> {
            Err(GenerationError::Unavailable("offline".into()))
        }
    }

    fn session_with(phase: DebatePhase, with_turn: bool) -> DebateSession {
        let mut facts = FactSet::from_facts(vec![Fact {
            metric: "unemployment_rate".into(),
            value: 0.041,
            unit: None,
            year: Some(2024),
            source_query_id: "q1".into(),
            dimensions: BTreeMap::new(),
        }]);
        facts.set_requested(1);
        let mut session = DebateSession::new(
            "Is the labor market cooling?",
            ComplexityTier::Standard,
            DebateConfig {
                max_turns: 4,
                participant_count: 1,
                convergence_check_interval: 2,
            },
            Arc::new(facts),
            vec![ParticipantRole::Economist],
            ConvergenceState::new(0.2, 2),
        );
        session.transition(DebatePhase::Opening, "start").unwrap();
        if with_turn {
            session.append_turn(DebateTurn {
                turn_index: 0,
                round: 1,
                participant_role: ParticipantRole::Economist,
                turn_type: TurnType::Opening,
                message_text: "Unemployment is 4.1% [src:q1]. Wages rose 9%.".into(),
                citations: BTreeSet::from(["q1".to_string()]),
                uncited_numbers: vec!["9%".into()],
                novelty_score: 1.0,
                created_at: Utc::now(),
            });
        }
        match phase {
            DebatePhase::Done => {
                session.transition(DebatePhase::Closing, "x").unwrap();
                session.transition(DebatePhase::Done, "x").unwrap();
            }
            other => session.transition(other, "x").unwrap(),
        }
        session
    }

    fn synthesizer(generator: Arc<dyn TextGenerator>) -> Synthesizer {
        Synthesizer::new(
            generator,
            Arc::new(FactConsistencyVerifier::default()),
            SynthesisSettings::default(),
        )
    }

    #[test]
    fn test_completeness_mapping() {
        assert_eq!(Completeness::for_session(SessionStatus::Done, true), Completeness::Full);
        assert_eq!(Completeness::for_session(SessionStatus::Error, true), Completeness::Partial);
        assert_eq!(Completeness::for_session(SessionStatus::Error, false), Completeness::Emergency);
        assert_eq!(Completeness::for_session(SessionStatus::Timeout, true), Completeness::Emergency);
    }

    #[test]
    fn test_confidence_formula() {
        assert!((confidence(1.0, 1.0, Completeness::Full) - 1.0).abs() < 1e-9);
        assert!((confidence(0.5, 0.0, Completeness::Emergency) - 0.31).abs() < 1e-9);
        assert!((confidence(0.0, 0.5, Completeness::Partial) - 0.27).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_full_path_generates_and_verifies() {
        let synth = synthesizer(Arc::new(Writes("The labor market is cooling: unemployment rate is 4.1%.")));
        let result = synth.synthesize(&session_with(DebatePhase::Done, true)).await;

        assert_eq!(result.completeness, Completeness::Full);
        assert!(result.generated);
        assert!(result.narrative.contains("4.1% [src:q1]"));
        assert_eq!(result.verification.checked, 1);
        assert_eq!(result.verification.supported, 1);
        assert_eq!(result.citations_used, vec!["q1"]);
        // 0.5·1 + 0.3·0 (no source records) + 0.2·1
        assert!((result.confidence_score - 0.7).abs() < 1e-9);
        assert!(result.caveats.iter().any(|c| c.contains("could not be linked")));
    }

    #[tokio::test]
    async fn test_generator_failure_falls_back() {
        let synth = synthesizer(Arc::new(Down));
        let result = synth.synthesize(&session_with(DebatePhase::Error, true)).await;
        assert_eq!(result.completeness, Completeness::Partial);
        assert!(!result.generated);
        assert!(result.narrative.starts_with("Question: Is the labor market cooling?"));
        assert!(result.caveats.iter().any(|c| c.contains("Narrative generation failed")));
    }

    #[tokio::test]
    async fn test_emergency_skips_verification() {
        let synth = synthesizer(Arc::new(Writes("unused")));
        let result = synth.synthesize(&session_with(DebatePhase::Timeout, true)).await;
        assert_eq!(result.completeness, Completeness::Emergency);
        assert!(result.verification.skipped);
        assert_eq!(result.verification.checked, 0);
        // one cited, one uncited number in the transcript
        assert!((result.verification.verified_fraction - 0.5).abs() < 1e-9);
        assert!(result.narrative.contains("Positions:"));
        assert_eq!(result.session_status, SessionStatus::Timeout);
    }

    #[tokio::test]
    async fn test_emergency_with_no_turns() {
        let synth = synthesizer(Arc::new(Writes("unused")));
        let result = synth.synthesize(&session_with(DebatePhase::Timeout, false)).await;
        assert_eq!(result.completeness, Completeness::Emergency);
        assert!(result.narrative.contains("No debate turns were completed"));
        assert!(result.confidence_score > 0.0);
    }
}
