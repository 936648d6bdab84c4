//! Claim verification against cited evidence.
//!
//! The verifier itself is an external capability. Calls are bounded by a
//! timeout and a failed or slow call degrades to [`Verdict::Unverifiable`];
//! verification never blocks synthesis.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::{scan_markers, scan_numbers, split_sentences, CitationTolerance};
use crate::facts::{Fact, FactSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Supported,
    Contradicted,
    Unverifiable,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Supported => write!(f, "supported"),
            Self::Contradicted => write!(f, "contradicted"),
            Self::Unverifiable => write!(f, "unverifiable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verdict: Verdict,
    /// Verifier confidence in `[0, 1]`.
    pub score: f64,
}

impl VerificationResult {
    pub fn unverifiable() -> Self {
        Self {
            verdict: Verdict::Unverifiable,
            score: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VerificationError {
    #[error("Verification timed out after {0:?}")]
    Timeout(Duration),

    #[error("Verifier failed: {0}")]
    Failed(String),
}

/// External claim-checking capability.
#[async_trait]
pub trait ClaimVerifier: Send + Sync {
    async fn verify(
        &self,
        claim: &str,
        evidence: &[Fact],
    ) -> Result<VerificationResult, VerificationError>;
}

/// A cited sentence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub text: String,
    pub query_ids: Vec<String>,
}

impl Claim {
    /// Facts from every query the claim cites.
    pub fn evidence(&self, facts: &FactSet) -> Vec<Fact> {
        facts
            .facts()
            .iter()
            .filter(|f| self.query_ids.contains(&f.source_query_id))
            .cloned()
            .collect()
    }
}

/// Sentences carrying at least one `[src:..]` marker.
pub fn extract_claims(text: &str) -> Vec<Claim> {
    split_sentences(text)
        .into_iter()
        .filter_map(|sentence| {
            let mut ids: Vec<String> = scan_markers(sentence)
                .into_iter()
                .flat_map(|m| m.query_ids)
                .collect();
            if ids.is_empty() {
                return None;
            }
            ids.sort();
            ids.dedup();
            Some(Claim {
                text: sentence.to_string(),
                query_ids: ids,
            })
        })
        .collect()
}

/// Verify one claim. Errors and timeouts become `Unverifiable`.
pub async fn verify_claim(
    verifier: &dyn ClaimVerifier,
    claim: &str,
    evidence: &[Fact],
    timeout: Duration,
) -> VerificationResult {
    match tokio::time::timeout(timeout, verifier.verify(claim, evidence)).await {
        Ok(Ok(result)) => VerificationResult {
            verdict: result.verdict,
            score: result.score.clamp(0.0, 1.0),
        },
        Ok(Err(e)) => {
            warn!(error = %e, "Claim verification failed");
            VerificationResult::unverifiable()
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "Claim verification timed out");
            VerificationResult::unverifiable()
        }
    }
}

/// Verify up to `max_claims` claims, `concurrency` at a time, in order.
pub async fn verify_claims(
    verifier: &dyn ClaimVerifier,
    claims: &[Claim],
    facts: &FactSet,
    timeout: Duration,
    max_claims: usize,
    concurrency: usize,
) -> Vec<(Claim, VerificationResult)> {
    let results: Vec<(Claim, VerificationResult)> =
        stream::iter(claims.iter().take(max_claims).cloned())
            .map(|claim: Claim| {
                async move {
                    let evidence = claim.evidence(facts);
                    let result = verify_claim(verifier, &claim.text, &evidence, timeout).await;
                    (claim, result)
                }
                .boxed()
            })
            .buffered(concurrency.max(1))
            .collect()
            .await;
    debug!(checked = results.len(), "Claims verified");
    results
}

/// Deterministic verifier: compares the numbers in a claim with the cited
/// facts.
///
/// Every number matched gives `Supported`. A number that matches nothing while
/// the claim names one of the evidence metrics gives `Contradicted`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FactConsistencyVerifier {
    pub tolerance: CitationTolerance,
}

impl FactConsistencyVerifier {
    pub fn new(tolerance: CitationTolerance) -> Self {
        Self { tolerance }
    }

    fn names_metric(claim: &str, fact: &Fact) -> bool {
        let lower = claim.to_lowercase();
        let spaced = fact.metric.replace('_', " ").to_lowercase();
        lower.contains(&spaced) || lower.contains(&fact.metric.to_lowercase())
    }

    /// Synchronous check, used by the async trait impl.
    pub fn check(&self, claim: &str, evidence: &[Fact]) -> VerificationResult {
        let numbers = scan_numbers(claim);
        if numbers.is_empty() || evidence.is_empty() {
            return VerificationResult::unverifiable();
        }

        let matched = numbers
            .iter()
            .filter(|n| {
                n.candidates()
                    .iter()
                    .any(|c| evidence.iter().any(|f| self.tolerance.matches(*c, f.value)))
            })
            .count();
        let score = matched as f64 / numbers.len() as f64;

        let verdict = if matched == numbers.len() {
            Verdict::Supported
        } else if evidence.iter().any(|f| Self::names_metric(claim, f)) {
            Verdict::Contradicted
        } else {
            Verdict::Unverifiable
        };
        VerificationResult { verdict, score }
    }
}

#[async_trait]
impl ClaimVerifier for FactConsistencyVerifier {
    async fn verify(
        &self,
        claim: &str,
        evidence: &[Fact],
    ) -> Result<VerificationResult, VerificationError> {
        Ok(self.check(claim, evidence))
    }
}
