//! Citation injection and claim verification.
//!
//! Both halves share one number scanner. A *claim* is a numeric token that is
//! not a calendar year, not part of an identifier (`Q3`, `x86`, `v1.2`) and
//! not inside an existing `[src:..]` marker.

pub mod injector;
pub mod verifier;

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

pub use injector::{inject_citations, CitationMatch, CitationTolerance, InjectionResult};
pub use verifier::{
    extract_claims, verify_claim, verify_claims, Claim, ClaimVerifier, FactConsistencyVerifier,
    Verdict, VerificationError, VerificationResult,
};

static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?)(\s?%|\s*(?:percent|per cent|pct)\b)?(?:\s*(thousand|million|billion|trillion)\b)?",
    )
    .expect("NUMBER_RE regex should compile")
});

static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[src:([^\]]*)\]").expect("MARKER_RE regex should compile"));

/// A numeric claim found in text.
#[derive(Debug, Clone, PartialEq)]
pub struct NumberToken {
    /// Byte span of the token, including unit and magnitude words.
    pub span: Range<usize>,
    pub raw: String,
    /// Value as written, magnitude applied.
    pub value: f64,
    pub percent: bool,
}

impl NumberToken {
    /// Values a fact may hold for this token. Percents match both as written
    /// and divided by 100.
    pub fn candidates(&self) -> Vec<f64> {
        if self.percent {
            vec![self.value, self.value / 100.0]
        } else {
            vec![self.value]
        }
    }
}

/// An existing `[src:..]` marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub span: Range<usize>,
    pub query_ids: Vec<String>,
}

/// All `[src:..]` markers in `text`.
pub fn scan_markers(text: &str) -> Vec<Marker> {
    MARKER_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let ids = caps
                .get(1)
                .map(|m| {
                    m.as_str()
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            Some(Marker {
                span: whole.range(),
                query_ids: ids,
            })
        })
        .collect()
}

fn magnitude(word: &str) -> f64 {
    match word.to_ascii_lowercase().as_str() {
        "thousand" => 1e3,
        "million" => 1e6,
        "billion" => 1e9,
        "trillion" => 1e12,
        _ => 1.0,
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Digits glued to letters, or dotted version strings.
fn inside_identifier(text: &str, span: &Range<usize>) -> bool {
    let before = text[..span.start].chars().rev().take(2).collect::<Vec<_>>();
    match before.as_slice() {
        [c, ..] if is_ident_char(*c) => return true,
        ['.', d, ..] if d.is_ascii_digit() => return true,
        _ => {}
    }
    let mut after = text[span.end..].chars();
    match (after.next(), after.next()) {
        (Some(c), _) if is_ident_char(c) => true,
        (Some('.'), Some(d)) if d.is_ascii_digit() => true,
        _ => false,
    }
}

/// Numeric claims in `text`, in order of appearance.
pub fn scan_numbers(text: &str) -> Vec<NumberToken> {
    let markers = scan_markers(text);
    let in_marker = |pos: usize| markers.iter().any(|m| m.span.contains(&pos));

    NUMBER_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let digits = caps.get(1)?;
            let span = whole.range();
            if in_marker(span.start) || inside_identifier(text, &span) {
                return None;
            }

            let mut value: f64 = digits.as_str().replace(',', "").parse().ok()?;
            let percent = caps.get(2).is_some();
            let scale = caps.get(3).map(|m| magnitude(m.as_str()));

            let plain_integer = !digits.as_str().contains(['.', ',']);
            if plain_integer && !percent && scale.is_none() && (1900.0..=2100.0).contains(&value) {
                return None;
            }

            if let Some(scale) = scale {
                value *= scale;
            }
            Some(NumberToken {
                span,
                raw: whole.as_str().trim_end().to_string(),
                value,
                percent,
            })
        })
        .collect()
}

/// Split text into sentences. Decimal points do not end a sentence.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let boundary = match c {
            '\n' => true,
            '.' | '!' | '?' => chars.peek().is_none_or(|(_, next)| next.is_whitespace()),
            _ => false,
        };
        if boundary {
            let end = i + c.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(text: &str) -> Vec<f64> {
        scan_numbers(text).into_iter().map(|t| t.value).collect()
    }

    #[test]
    fn test_scan_percent_and_magnitude() {
        let tokens = scan_numbers("Rates hit 5.25% while GDP reached 27.4 trillion and 3,100 firms");
        assert_eq!(tokens.len(), 3);
        assert!(tokens[0].percent);
        assert_eq!(tokens[0].candidates(), vec![5.25, 0.0525]);
        assert_eq!(tokens[1].value, 27.4e12);
        assert_eq!(tokens[1].raw, "27.4 trillion");
        assert_eq!(tokens[2].value, 3100.0);
    }

    #[test]
    fn test_years_and_identifiers_are_not_claims() {
        assert_eq!(values("In 2024 the Q3 print on x86 v1.2 was 4.1"), vec![4.1]);
        assert_eq!(values("a 2024 percent share"), vec![2024.0]);
        assert_eq!(values("unemployment stands at 10%"), vec![10.0]);
    }

    #[test]
    fn test_markers_are_skipped() {
        let text = "Growth of 2.5% [src:gdp_2024] beat 1.9";
        assert_eq!(values(text), vec![2.5, 1.9]);
        let markers = scan_markers("x [src:a, b] y [src:c]");
        assert_eq!(markers[0].query_ids, vec!["a", "b"]);
        assert_eq!(markers[1].query_ids, vec!["c"]);
    }

    #[test]
    fn test_sentence_split_keeps_decimals() {
        let parts = split_sentences("Inflation is 3.2% now. Wages lag!\nNext line");
        assert_eq!(parts, vec!["Inflation is 3.2% now.", "Wages lag!", "Next line"]);
    }
}
