//! Question complexity classifier.
//!
//! Runs before fact prefetch. Deterministic and allocation-light: a fixed
//! table of weighted indicators is matched against the lowercased question.
//!
//! | Tier      | Trigger                                              |
//! |-----------|------------------------------------------------------|
//! | Critical  | any urgency marker (overrides everything)            |
//! | Complex   | strategic/financial marker weight ≥ 3                |
//! | Simple    | ≤ 12 words, factual interrogative, no markers        |
//! | Standard  | everything else, including empty input               |

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Marker weight at which a question is complex.
pub const COMPLEX_THRESHOLD: u32 = 3;
/// Longest question still eligible for the simple tier.
pub const SIMPLE_MAX_WORDS: usize = 12;

static URGENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(urgent|urgently|immediately|asap|emergency|crisis|right now|by end of day|within (24|48) hours|deadline (is )?today)\b",
    )
    .expect("URGENT_RE regex should compile")
});

static FACTUAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(what|when|where|who|which|how many|how much|is|are|was|were|does|did)\b")
        .expect("FACTUAL_RE regex should compile")
});

static MAGNITUDE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\$|€|£)\s?\d[\d,]*(\.\d+)?\s*(k|m|mm|bn|b|million|billion|trillion)?\b|\b\d[\d,]*(\.\d+)?\s*(million|billion|trillion)\b",
    )
    .expect("MAGNITUDE_RE regex should compile")
});

/// Weighted strategic indicators: (pattern, weight, label).
static STRATEGIC_MARKERS: LazyLock<Vec<(Regex, u32, &'static str)>> = LazyLock::new(|| {
    [
        (r"\b(acquire|acquisition|merger|m&a|takeover)\b", 2, "m_and_a"),
        (r"\bvaluation\b", 2, "valuation"),
        (r"\b(strategy|strategic)\b", 1, "strategy"),
        (r"\b(invest|investment|capex|divest)\w*\b", 1, "investment"),
        (r"\b(scenario|scenarios|what if)\b", 1, "scenario"),
        (r"\btrade-?offs?\b", 1, "tradeoff"),
        (r"\b(long-term|long term|five-year|ten-year|decade)\b", 1, "horizon"),
        (r"\b(market entry|expand|expansion|enter the)\b", 1, "expansion"),
        (r"\b(compare|comparison|versus|vs\.?)\b", 1, "comparison"),
        (r"\b(forecast|projection|outlook)\b", 1, "forecast"),
        (r"\b(regulation|regulatory|policy)\b", 1, "regulatory"),
        (r"\b(competitor|competitive|market share)\b", 1, "competition"),
        (r"\b(risk|risks|exposure|hedge)\b", 1, "risk"),
        (r"\b(portfolio|allocation)\b", 1, "portfolio"),
    ]
    .into_iter()
    .map(|(pattern, weight, label)| {
        (
            Regex::new(pattern).expect("STRATEGIC_MARKERS regex should compile"),
            weight,
            label,
        )
    })
    .collect()
});

/// Debate shape bound to a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebateConfig {
    /// Hard ceiling on turns. Always > 0.
    pub max_turns: u32,
    pub participant_count: usize,
    /// Run a convergence check every this many turns.
    pub convergence_check_interval: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Simple,
    Standard,
    Complex,
    Critical,
}

impl ComplexityTier {
    pub fn all() -> &'static [ComplexityTier] {
        &[Self::Simple, Self::Standard, Self::Complex, Self::Critical]
    }

    pub fn debate_config(&self) -> DebateConfig {
        let (max_turns, participant_count, convergence_check_interval) = match self {
            Self::Simple => (4, 2, 2),
            Self::Standard => (9, 3, 3),
            Self::Complex => (16, 4, 4),
            Self::Critical => (20, 5, 5),
        };
        DebateConfig {
            max_turns,
            participant_count,
            convergence_check_interval,
        }
    }

    /// Most queries prefetched for this tier.
    pub fn max_sources(&self) -> usize {
        match self {
            Self::Simple => 3,
            Self::Standard => 6,
            Self::Complex => 10,
            Self::Critical => 12,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Standard => "standard",
            Self::Complex => "complex",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ComplexityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown tier '{}'", s))
    }
}

/// Full classifier output, for logs and the `classify` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub tier: ComplexityTier,
    /// Summed marker weight.
    pub score: u32,
    pub markers: Vec<String>,
    pub urgent: bool,
    pub rationale: String,
}

impl Classification {
    pub fn summary(&self) -> String {
        format!(
            "tier={} score={} markers={} ({})",
            self.tier,
            self.score,
            self.markers.len(),
            self.rationale
        )
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QuestionClassifier;

impl QuestionClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, question: &str) -> Classification {
        let q = question.trim().to_lowercase();
        if q.is_empty() {
            return Classification {
                tier: ComplexityTier::Standard,
                score: 0,
                markers: Vec::new(),
                urgent: false,
                rationale: "default".to_string(),
            };
        }

        let mut markers = Vec::new();
        let mut score = 0;
        for (re, weight, label) in STRATEGIC_MARKERS.iter() {
            if re.is_match(&q) {
                score += weight;
                markers.push((*label).to_string());
            }
        }
        if MAGNITUDE_RE.is_match(&q) {
            score += 2;
            markers.push("financial_magnitude".to_string());
        }

        let urgent = URGENT_RE.is_match(&q);
        let word_count = q.split_whitespace().count();
        let factual = FACTUAL_RE.is_match(&q);

        let (tier, rationale) = if urgent {
            (ComplexityTier::Critical, "urgency marker".to_string())
        } else if score >= COMPLEX_THRESHOLD {
            (
                ComplexityTier::Complex,
                format!("marker weight {} ≥ {}", score, COMPLEX_THRESHOLD),
            )
        } else if score == 0 && factual && word_count <= SIMPLE_MAX_WORDS {
            (
                ComplexityTier::Simple,
                format!("short factual question ({} words)", word_count),
            )
        } else {
            (ComplexityTier::Standard, "default".to_string())
        };

        Classification {
            tier,
            score,
            markers,
            urgent,
            rationale,
        }
    }
}

/// Classify a question. Never fails; unclassifiable input is `Standard`.
pub fn classify(question: &str) -> ComplexityTier {
    QuestionClassifier::new().analyze(question).tier
}
