//! Context rendering for participant and synthesizer turns.

use crate::debate::{DebateTurn, TurnType};
use crate::facts::FactSet;

use super::ParticipantRole;

/// Most prior turns rendered into a context.
pub const MAX_PRIOR_TURNS: usize = 12;
/// Longest excerpt of a prior turn.
const PRIOR_TURN_CHARS: usize = 600;

/// Inputs for one participant turn.
#[derive(Debug, Clone, Copy)]
pub struct TurnContext<'a> {
    pub question: &'a str,
    pub facts: &'a FactSet,
    pub prior_turns: &'a [DebateTurn],
    pub turn_type: TurnType,
    pub round: u32,
}

/// Role brief placed at the top of every context.
pub fn role_brief(role: ParticipantRole) -> &'static str {
    match role {
        ParticipantRole::Strategist => {
            "You are the Strategist. Lay out the realistic options, who gains and who loses, \
             and the second-order effects a decision-maker would miss."
        }
        ParticipantRole::Economist => {
            "You are the Economist. Explain the macro drivers, incentives and market \
             mechanics behind the numbers."
        }
        ParticipantRole::RiskAnalyst => {
            "You are the Risk Analyst. Identify downside scenarios, exposures and what \
             would have to go wrong for the thesis to fail."
        }
        ParticipantRole::Skeptic => {
            "You are the Skeptic. Challenge the weakest claims made so far and point out \
             where the evidence does not support the conclusion."
        }
        ParticipantRole::Quant => {
            "You are the Quant. Check magnitudes, growth rates and arithmetic. Say which \
             numbers matter most and why."
        }
        ParticipantRole::Synthesizer => {
            "You are the Synthesizer. Integrate the debate into a balanced, decision-ready \
             answer. Note disagreements that remain open."
        }
    }
}

fn task_line(turn_type: TurnType, round: u32) -> String {
    match turn_type {
        TurnType::Opening => "Give your opening position on the question.".to_string(),
        TurnType::Rebuttal => format!(
            "Round {}: respond to the strongest opposing point and add what is new. \
             Do not repeat yourself.",
            round
        ),
        TurnType::Closing => {
            "Give your closing statement: your final position and the single most \
             important piece of evidence."
                .to_string()
        }
    }
}

fn render_facts(out: &mut String, facts: &FactSet) {
    out.push_str("## Facts\n");
    if facts.is_empty() {
        out.push_str("(no facts available; make no numeric claims)\n");
    }
    for fact in facts.facts() {
        out.push_str(&format!(
            "- [src:{}] {}\n",
            fact.source_query_id,
            fact.describe()
        ));
    }
    if !facts.gaps().is_empty() {
        out.push_str("\n## Data gaps (do not estimate these)\n");
        for gap in facts.gaps() {
            out.push_str(&format!("- {}: {}\n", gap.query_id, gap.code));
        }
    }
    out.push('\n');
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= PRIOR_TURN_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(PRIOR_TURN_CHARS).collect();
    format!("{}…", cut)
}

fn render_rules(out: &mut String, facts: &FactSet) {
    out.push_str("## Rules\n");
    out.push_str("- Cite every number with its source marker, e.g. `4.1% [src:unemployment_rate]`.\n");
    out.push_str("- Use only the facts listed above. Never introduce outside numbers.\n");
    let ids = facts.query_ids();
    if !ids.is_empty() {
        out.push_str(&format!("- Citable sources: {}\n", ids.join(", ")));
    }
}

/// Render the context for a debate turn.
pub fn build_turn_context(role: ParticipantRole, ctx: &TurnContext<'_>) -> String {
    let mut out = String::new();
    out.push_str(role_brief(role));
    out.push_str("\n\n## Question\n");
    out.push_str(ctx.question.trim());
    out.push_str("\n\n");

    render_facts(&mut out, ctx.facts);

    if !ctx.prior_turns.is_empty() {
        out.push_str("## Debate so far\n");
        let skip = ctx.prior_turns.len().saturating_sub(MAX_PRIOR_TURNS);
        for turn in &ctx.prior_turns[skip..] {
            out.push_str(&format!(
                "[{} · {} · turn {}] {}\n",
                turn.participant_role,
                turn.turn_type,
                turn.turn_index,
                excerpt(&turn.message_text)
            ));
        }
        out.push('\n');
    }

    out.push_str("## Your task\n");
    out.push_str(&task_line(ctx.turn_type, ctx.round));
    out.push_str("\n\n");
    render_rules(&mut out, ctx.facts);
    out
}

/// Render the context for the synthesizer.
pub fn build_synthesis_context(question: &str, facts: &FactSet, turns: &[DebateTurn]) -> String {
    let mut out = String::new();
    out.push_str(role_brief(ParticipantRole::Synthesizer));
    out.push_str("\n\n## Question\n");
    out.push_str(question.trim());
    out.push_str("\n\n");
    render_facts(&mut out, facts);

    out.push_str("## Debate transcript\n");
    for turn in turns {
        out.push_str(&format!(
            "[{} · {}] {}\n",
            turn.participant_role, turn.turn_type, turn.message_text
        ));
    }
    out.push_str("\n## Your task\nWrite the final answer in at most four short paragraphs.\n\n");
    render_rules(&mut out, facts);
    out
}
