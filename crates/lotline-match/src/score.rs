//! Bounded string-similarity scoring with per-kind boosts.
//!
//! The base primitive is the classic sequence-similarity ratio
//! `2 * LCS(a, b) / (|a| + |b|)` computed by dynamic programming. It is
//! symmetric, 1.0 only for identical non-empty strings, and O(|a| * |b|) in
//! time, so callers must narrow candidate pools through the bucketed index
//! before invoking it in a loop.

use std::collections::HashSet;

/// Sequence-similarity ratio in [0, 1] over the characters of two strings.
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    // Rolling single-row LCS table.
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for &ca in &a {
        for (j, &cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    let lcs = prev[b.len()];
    (2 * lcs) as f64 / (a.len() + b.len()) as f64
}

fn leading_digit_run(s: &str) -> &str {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    &s[..end]
}

/// Splits "123 main st" into ("123", "main st") when the string starts with
/// a street number followed by more text.
pub(crate) fn split_street_number(s: &str) -> Option<(&str, &str)> {
    let digits = leading_digit_run(s);
    if digits.is_empty() {
        return None;
    }
    let rest = s[digits.len()..].trim_start();
    if rest.is_empty() {
        return None;
    }
    Some((digits, rest))
}

/// Company similarity over normalized names. Token-set overlap can only
/// raise the base ratio, and identical 6+ digit leading runs (numbered/shelf
/// companies) force a certain match.
pub fn company_score(a: &str, b: &str) -> f64 {
    let mut score = sequence_ratio(a, b);

    let tokens_a: HashSet<&str> = a.split_whitespace().collect();
    let tokens_b: HashSet<&str> = b.split_whitespace().collect();
    if !tokens_a.is_empty() && !tokens_b.is_empty() {
        let shared = tokens_a.intersection(&tokens_b).count();
        let overlap = shared as f64 / tokens_a.len().max(tokens_b.len()) as f64;
        score = score.max(overlap);
    }

    let digits_a = leading_digit_run(a);
    let digits_b = leading_digit_run(b);
    if digits_a.len() >= 6 && digits_a == digits_b {
        score = 1.0;
    }

    score
}

/// Address similarity over normalized addresses. When both sides share the
/// same leading street number, the remainder-after-number ratio (scaled by
/// 0.95) may raise the score; suite text diluting the raw ratio then no
/// longer sinks a genuine same-street match.
pub fn address_score(a: &str, b: &str) -> f64 {
    let mut score = sequence_ratio(a, b);

    if let (Some((num_a, rest_a)), Some((num_b, rest_b))) =
        (split_street_number(a), split_street_number(b))
    {
        if num_a == num_b {
            score = score.max(sequence_ratio(rest_a, rest_b) * 0.95);
        }
    }

    score
}

/// Person similarity over normalized (token-sorted) names. Equality after
/// sorting is a certain match.
pub fn person_score(a: &str, b: &str) -> f64 {
    if !a.is_empty() && a == b {
        return 1.0;
    }
    sequence_ratio(a, b)
}
