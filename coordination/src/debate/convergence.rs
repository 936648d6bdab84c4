//! Novelty scoring and convergence detection.
//!
//! Novelty of a turn is `1 − similarity` against the same participant's
//! previous turn; a participant's first turn scores 1. Only rebuttal scores
//! feed convergence: the session has converged when every active participant
//! has at least one rebuttal score and the mean of its last `window` scores is
//! below `threshold`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::state::TurnType;
use crate::participants::ParticipantRole;

/// Similarity between two texts, in `[0, 1]`.
pub trait SimilarityFn: Send + Sync {
    fn similarity(&self, a: &str, b: &str) -> f64;
}

/// Jaccard similarity over lowercase word tokens.
#[derive(Debug, Clone, Copy)]
pub struct JaccardSimilarity {
    /// Ignore tokens shorter than this.
    pub min_token_len: usize,
}

impl JaccardSimilarity {
    pub fn new() -> Self {
        Self { min_token_len: 3 }
    }

    fn tokens(&self, text: &str) -> BTreeSet<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() >= self.min_token_len)
            .map(str::to_lowercase)
            .collect()
    }
}

impl Default for JaccardSimilarity {
    fn default() -> Self {
        Self::new()
    }
}

impl SimilarityFn for JaccardSimilarity {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let ta = self.tokens(a);
        let tb = self.tokens(b);
        if ta.is_empty() && tb.is_empty() {
            return 1.0;
        }
        let inter = ta.intersection(&tb).count() as f64;
        let union = ta.union(&tb).count() as f64;
        inter / union
    }
}

/// Novelty of `current` given the participant's previous text.
pub fn novelty(similarity: &dyn SimilarityFn, previous: Option<&str>, current: &str) -> f64 {
    match previous {
        None => 1.0,
        Some(prev) => (1.0 - similarity.similarity(prev, current)).clamp(0.0, 1.0),
    }
}

/// Result of one convergence check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceCheck {
    pub converged: bool,
    /// Moving average per participant; absent when it has no rebuttal yet.
    pub averages: BTreeMap<ParticipantRole, f64>,
    pub at_turn: u32,
}

/// Convergence bookkeeping carried by a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceState {
    pub threshold: f64,
    pub window: u32,
    rebuttal_novelty: BTreeMap<ParticipantRole, Vec<f64>>,
    last_check: Option<ConvergenceCheck>,
    checks_run: u32,
    converged: bool,
}

impl ConvergenceState {
    pub fn new(threshold: f64, window: u32) -> Self {
        Self {
            threshold,
            window: window.max(1),
            rebuttal_novelty: BTreeMap::new(),
            last_check: None,
            checks_run: 0,
            converged: false,
        }
    }

    /// Record a turn's novelty. Opening and closing turns are ignored.
    pub fn record(&mut self, role: ParticipantRole, turn_type: TurnType, novelty: f64) {
        if turn_type == TurnType::Rebuttal {
            self.rebuttal_novelty.entry(role).or_default().push(novelty);
        }
    }

    /// Mean of the last `window` rebuttal scores for `role`.
    pub fn moving_average(&self, role: ParticipantRole) -> Option<f64> {
        let scores = self.rebuttal_novelty.get(&role)?;
        if scores.is_empty() {
            return None;
        }
        let take = (self.window as usize).min(scores.len());
        let recent = &scores[scores.len() - take..];
        Some(recent.iter().sum::<f64>() / take as f64)
    }

    /// Evaluate convergence over `active` participants.
    pub fn check(&mut self, active: &[ParticipantRole], at_turn: u32) -> &ConvergenceCheck {
        let averages: BTreeMap<ParticipantRole, f64> = active
            .iter()
            .filter_map(|r| self.moving_average(*r).map(|avg| (*r, avg)))
            .collect();
        let converged = !active.is_empty()
            && averages.len() == active.len()
            && averages.values().all(|avg| *avg < self.threshold);

        self.checks_run += 1;
        self.converged = self.converged || converged;
        self.last_check.insert(ConvergenceCheck {
            converged,
            averages,
            at_turn,
        })
    }

    pub fn is_converged(&self) -> bool {
        self.converged
    }

    pub fn checks_run(&self) -> u32 {
        self.checks_run
    }

    pub fn last_check(&self) -> Option<&ConvergenceCheck> {
        self.last_check.as_ref()
    }
}
