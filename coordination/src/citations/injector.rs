//! Citation injection: attach `[src:<query_id>]` to numbers that match a fact.
//!
//! Unmatched numbers are never altered or dropped. They are reported in
//! [`InjectionResult::uncited_numbers`] as fabrication risk.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{scan_markers, scan_numbers, Marker, NumberToken};
use crate::facts::FactSet;

/// Numeric match tolerance: `|a − b| ≤ absolute + relative · max(|a|, |b|)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CitationTolerance {
    pub relative: f64,
    pub absolute: f64,
}

impl Default for CitationTolerance {
    fn default() -> Self {
        Self {
            relative: 0.01,
            absolute: 1e-9,
        }
    }
}

impl CitationTolerance {
    pub fn matches(&self, a: f64, b: f64) -> bool {
        (a - b).abs() <= self.absolute + self.relative * a.abs().max(b.abs())
    }

    fn distance(a: f64, b: f64) -> f64 {
        let scale = a.abs().max(b.abs());
        if scale == 0.0 {
            0.0
        } else {
            (a - b).abs() / scale
        }
    }
}

/// A number linked to one or more sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationMatch {
    pub raw: String,
    pub value: f64,
    /// Sorted; more than one id means the match was ambiguous.
    pub query_ids: Vec<String>,
    pub metric: String,
}

/// Output of [`inject_citations`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InjectionResult {
    pub text: String,
    /// Every known query id cited in `text`, including pre-existing markers.
    pub citations: BTreeSet<String>,
    pub matches: Vec<CitationMatch>,
    pub uncited_numbers: Vec<String>,
    /// Matches where equally close facts came from different queries.
    pub ambiguous: Vec<CitationMatch>,
    /// Ids in pre-existing markers that name no fetched query.
    pub unknown_markers: Vec<String>,
}

impl InjectionResult {
    /// Share of numeric claims that carry a citation.
    pub fn coverage(&self) -> f64 {
        let total = self.matches.len() + self.uncited_numbers.len();
        if total == 0 {
            1.0
        } else {
            self.matches.len() as f64 / total as f64
        }
    }
}

/// Closest fact match for a token, with every tied query id.
fn best_match(token: &NumberToken, facts: &FactSet, tol: CitationTolerance) -> Option<CitationMatch> {
    let mut best: Option<(f64, BTreeSet<String>, String)> = None;
    for fact in facts.facts() {
        for candidate in token.candidates() {
            if !tol.matches(candidate, fact.value) {
                continue;
            }
            let distance = CitationTolerance::distance(candidate, fact.value);
            let closer = match &mut best {
                Some((d, ids, _)) if (distance - *d).abs() <= f64::EPSILON => {
                    ids.insert(fact.source_query_id.clone());
                    false
                }
                Some((d, _, _)) => distance < *d,
                None => true,
            };
            if closer {
                best = Some((
                    distance,
                    BTreeSet::from([fact.source_query_id.clone()]),
                    fact.metric.clone(),
                ));
            }
        }
    }
    best.map(|(_, ids, metric)| CitationMatch {
        raw: token.raw.clone(),
        value: token.value,
        query_ids: ids.into_iter().collect(),
        metric,
    })
}

/// The marker that directly follows `end`, if any.
fn marker_after<'m>(text: &str, end: usize, markers: &'m [Marker]) -> Option<&'m Marker> {
    let gap = text[end..].len() - text[end..].trim_start().len();
    markers.iter().find(|m| m.span.start == end + gap)
}

/// Attach citation markers to every number in `text` that matches a fact.
pub fn inject_citations(text: &str, facts: &FactSet, tol: CitationTolerance) -> InjectionResult {
    let known: BTreeSet<String> = facts.query_ids().into_iter().collect();
    let markers = scan_markers(text);
    let mut result = InjectionResult::default();

    for marker in &markers {
        for id in &marker.query_ids {
            if known.contains(id) {
                result.citations.insert(id.clone());
            } else if !result.unknown_markers.contains(id) {
                result.unknown_markers.push(id.clone());
            }
        }
    }

    let mut out = String::with_capacity(text.len() + 32);
    let mut cursor = 0;
    for token in scan_numbers(text) {
        if let Some(existing) = marker_after(text, token.span.end, &markers) {
            if !existing.query_ids.is_empty() && existing.query_ids.iter().all(|id| known.contains(id)) {
                result.matches.push(CitationMatch {
                    raw: token.raw.clone(),
                    value: token.value,
                    query_ids: existing.query_ids.clone(),
                    metric: String::new(),
                });
            } else {
                result.uncited_numbers.push(token.raw.clone());
            }
            continue;
        }

        let Some(found) = best_match(&token, facts, tol) else {
            result.uncited_numbers.push(token.raw.clone());
            continue;
        };

        out.push_str(&text[cursor..token.span.end]);
        out.push_str(&format!(" [src:{}]", found.query_ids.join(",")));
        cursor = token.span.end;

        result.citations.extend(found.query_ids.iter().cloned());
        if found.query_ids.len() > 1 {
            result.ambiguous.push(found.clone());
        }
        result.matches.push(found);
    }
    out.push_str(&text[cursor..]);
    result.text = out;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::Fact;
    use std::collections::BTreeMap;

    fn fact(metric: &str, value: f64, query_id: &str) -> Fact {
        Fact {
            metric: metric.into(),
            value,
            unit: None,
            year: None,
            source_query_id: query_id.into(),
            dimensions: BTreeMap::new(),
        }
    }

    #[test]
    fn test_percent_matches_fraction() {
        let facts = FactSet::from_facts(vec![fact("unemployment_rate", 0.10, "q1")]);
        let result = inject_citations("unemployment stands at 10%", &facts, CitationTolerance::default());
        assert_eq!(result.text, "unemployment stands at 10% [src:q1]");
        assert!(result.citations.contains("q1"));
        assert!(result.uncited_numbers.is_empty());
    }

    #[test]
    fn test_unmatched_number_is_flagged_not_cited() {
        let facts = FactSet::from_facts(vec![fact("unemployment_rate", 0.10, "q1")]);
        let text = "unemployment stands at 10% and wages rose 7.3%";
        let result = inject_citations(text, &facts, CitationTolerance::default());
        assert_eq!(
            result.text,
            "unemployment stands at 10% [src:q1] and wages rose 7.3%"
        );
        assert_eq!(result.uncited_numbers, vec!["7.3%"]);
        assert_eq!(result.citations.len(), 1);
        assert!((result.coverage() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_magnitude_and_tolerance() {
        let facts = FactSet::from_facts(vec![fact("gdp_usd", 27.36e12, "gdp")]);
        let tol = CitationTolerance::default();
        let result = inject_citations("GDP is about 27.4 trillion dollars", &facts, tol);
        assert!(result.text.contains("27.4 trillion [src:gdp]"));

        let far = inject_citations("GDP is about 30 trillion dollars", &facts, tol);
        assert_eq!(far.uncited_numbers, vec!["30 trillion"]);
    }

    #[test]
    fn test_tie_lists_every_source() {
        let facts = FactSet::from_facts(vec![
            fact("cpi_yoy", 3.2, "cpi_us"),
            fact("core_cpi_yoy", 3.2, "cpi_core"),
        ]);
        let result = inject_citations("inflation at 3.2", &facts, CitationTolerance::default());
        assert_eq!(result.text, "inflation at 3.2 [src:cpi_core,cpi_us]");
        assert_eq!(result.ambiguous.len(), 1);
        assert_eq!(result.citations.len(), 2);
    }

    #[test]
    fn test_existing_markers_respected() {
        let facts = FactSet::from_facts(vec![fact("rate", 4.1, "q1")]);
        let text = "rate is 4.1 [src:q1] but 9.9 [src:made_up]";
        let result = inject_citations(text, &facts, CitationTolerance::default());
        assert_eq!(result.text, text);
        assert!(result.citations.contains("q1"));
        assert_eq!(result.unknown_markers, vec!["made_up"]);
        assert_eq!(result.uncited_numbers, vec!["9.9"]);
    }

    #[test]
    fn test_closest_fact_wins() {
        let facts = FactSet::from_facts(vec![fact("a", 100.0, "qa"), fact("b", 100.5, "qb")]);
        let result = inject_citations("value 100.4", &facts, CitationTolerance::default());
        assert_eq!(result.matches[0].query_ids, vec!["qb"]);
        assert!(result.ambiguous.is_empty());
    }

    #[test]
    fn test_years_untouched() {
        let facts = FactSet::from_facts(vec![fact("count", 2024.0, "q1")]);
        let result = inject_citations("Since 2024 things changed", &facts, CitationTolerance::default());
        assert_eq!(result.text, "Since 2024 things changed");
        assert!(result.matches.is_empty());
    }
}
