//! Tiered matching: exact -> normalized -> fuzzy, over caller-owned indexes.
//!
//! A [`CandidateIndex`] is built once per candidate pool per batch run (build
//! cost O(pool); each query is then an O(1) map lookup until the fuzzy tier,
//! which only ever scores a small bucket). Indexes are plain values with no
//! hidden process-wide caching; their lifetime is scoped by the caller.

use std::cmp::Ordering;
use std::collections::HashMap;

use lotline_core::{EntityKind, MatchCandidate, MatchTier};
use tracing::warn;
use uuid::Uuid;

use crate::normalize::{
    normalize_address, normalize_address_aggressive, normalize_company, normalize_person,
};
use crate::score::{address_score, company_score, person_score, split_street_number};

/// A fuzzy bucket with more surviving candidates than this is too ambiguous
/// to answer; the query is left unmatched rather than guessed at.
pub const FUZZY_CANDIDATE_CAP: usize = 5;

/// Per-tier confidence floors. Centralized so call sites share one table and
/// tests can assert on it directly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub exact: f64,
    pub normalized: f64,
    pub fuzzy: f64,
}

impl Thresholds {
    pub const COMPANY: Self = Self { exact: 1.0, normalized: 0.85, fuzzy: 0.80 };
    pub const PERSON: Self = Self { exact: 1.0, normalized: 0.85, fuzzy: 0.85 };
    pub const ADDRESS: Self = Self { exact: 1.0, normalized: 0.85, fuzzy: 0.75 };
    /// Looser profile for linking assessment rows to known parcels.
    pub const ASSESSMENT_ADDRESS: Self = Self { exact: 1.0, normalized: 0.85, fuzzy: 0.60 };

    pub fn for_kind(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Company => Self::COMPANY,
            EntityKind::Person => Self::PERSON,
            EntityKind::Address => Self::ADDRESS,
        }
    }
}

/// One entry of a caller-supplied candidate pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: Uuid,
    pub text: String,
}

impl Candidate {
    pub fn new(id: Uuid, text: impl Into<String>) -> Self {
        Self { id, text: text.into() }
    }
}

pub(crate) fn normalize_for(kind: EntityKind, input: &str) -> String {
    match kind {
        EntityKind::Company => normalize_company(input),
        EntityKind::Person => normalize_person(input),
        EntityKind::Address => normalize_address(input),
    }
}

pub(crate) fn score_for(kind: EntityKind, a: &str, b: &str) -> f64 {
    match kind {
        EntityKind::Company => company_score(a, b),
        EntityKind::Person => person_score(a, b),
        EntityKind::Address => address_score(a, b),
    }
}

/// Cheap bucketing key plus the discriminator used for the prefix gate.
///
/// Addresses bucket by street number alone so the O(n*m) scorer never runs
/// against the whole pool; the first word of the street name is the in-bucket
/// discriminator, letting near-miss spellings through the gate. Other kinds
/// bucket by their first token, where the gate is trivially satisfied.
fn fuzzy_key(kind: EntityKind, normalized: &str) -> (String, String) {
    if kind == EntityKind::Address {
        if let Some((number, rest)) = split_street_number(normalized) {
            let first_word = rest.split_whitespace().next().unwrap_or(rest);
            return (number.to_string(), first_word.to_string());
        }
    }
    let first = normalized.split_whitespace().next().unwrap_or(normalized);
    (first.to_string(), first.to_string())
}

fn prefix_overlap(a: &str, b: &str) -> bool {
    let pa: String = a.chars().take(3).collect();
    let pb: String = b.chars().take(3).collect();
    pa.starts_with(&pb) || pb.starts_with(&pa)
}

#[derive(Debug, Clone)]
struct IndexedCandidate {
    id: Uuid,
    raw: String,
    normalized: String,
    discriminator: String,
}

/// Exact, aggressive-normalized, and fuzzy-bucket lookup maps over one
/// candidate pool.
#[derive(Debug, Clone)]
pub struct CandidateIndex {
    kind: EntityKind,
    thresholds: Thresholds,
    fuzzy_cap: usize,
    entries: Vec<IndexedCandidate>,
    exact: HashMap<String, Vec<usize>>,
    aggressive: HashMap<String, Vec<usize>>,
    fuzzy: HashMap<String, Vec<usize>>,
}

impl CandidateIndex {
    pub fn build(kind: EntityKind, thresholds: Thresholds, pool: &[Candidate]) -> Self {
        let mut entries = Vec::with_capacity(pool.len());
        let mut exact: HashMap<String, Vec<usize>> = HashMap::new();
        let mut aggressive: HashMap<String, Vec<usize>> = HashMap::new();
        let mut fuzzy: HashMap<String, Vec<usize>> = HashMap::new();

        for candidate in pool {
            let normalized = normalize_for(kind, &candidate.text);
            if normalized.is_empty() {
                continue;
            }
            let (bucket_key, discriminator) = fuzzy_key(kind, &normalized);
            let idx = entries.len();
            exact.entry(normalized.clone()).or_default().push(idx);
            if kind == EntityKind::Address {
                let lossy = normalize_address_aggressive(&candidate.text);
                if !lossy.is_empty() {
                    aggressive.entry(lossy).or_default().push(idx);
                }
            }
            fuzzy.entry(bucket_key).or_default().push(idx);
            entries.push(IndexedCandidate {
                id: candidate.id,
                raw: candidate.text.clone(),
                normalized,
                discriminator,
            });
        }

        Self {
            kind,
            thresholds,
            fuzzy_cap: FUZZY_CANDIDATE_CAP,
            entries,
            exact,
            aggressive,
            fuzzy,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn candidate_at(&self, idx: usize, query: &str, score: f64, tier: MatchTier) -> MatchCandidate {
        let entry = &self.entries[idx];
        MatchCandidate {
            candidate_id: entry.id,
            score,
            tier,
            query: query.to_string(),
            matched: entry.raw.clone(),
        }
    }

    /// Match a raw query against the pool, escalating through tiers and
    /// stopping at the first tier that produces at least one result.
    pub fn find(&self, query: &str) -> Vec<MatchCandidate> {
        let normalized = normalize_for(self.kind, query);
        if normalized.is_empty() {
            return Vec::new();
        }

        if let Some(hits) = self.exact.get(&normalized) {
            return hits
                .iter()
                .map(|&idx| self.candidate_at(idx, query, 1.0, MatchTier::Exact))
                .collect();
        }

        if self.kind == EntityKind::Address {
            let lossy = normalize_address_aggressive(query);
            if !lossy.is_empty() {
                if let Some(hits) = self.aggressive.get(&lossy) {
                    return hits
                        .iter()
                        .map(|&idx| {
                            self.candidate_at(
                                idx,
                                query,
                                self.thresholds.normalized,
                                MatchTier::Normalized,
                            )
                        })
                        .collect();
                }
            }
        }

        let (bucket_key, discriminator) = fuzzy_key(self.kind, &normalized);
        let Some(bucket) = self.fuzzy.get(&bucket_key) else {
            return Vec::new();
        };

        let mut accepted = Vec::new();
        for &idx in bucket {
            let entry = &self.entries[idx];
            if !prefix_overlap(&discriminator, &entry.discriminator) {
                continue;
            }
            let score = score_for(self.kind, &normalized, &entry.normalized);
            if score >= self.thresholds.fuzzy {
                accepted.push(self.candidate_at(idx, query, score, MatchTier::Fuzzy));
            }
        }

        if accepted.len() > self.fuzzy_cap {
            warn!(
                kind = ?self.kind,
                query,
                survivors = accepted.len(),
                cap = self.fuzzy_cap,
                "fuzzy bucket too ambiguous, leaving query unmatched"
            );
            return Vec::new();
        }

        sort_descending(&mut accepted);
        accepted
    }
}

fn sort_descending(matches: &mut [MatchCandidate]) {
    matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
}

fn scan(
    kind: EntityKind,
    query: &str,
    pool: &[Candidate],
    threshold: f64,
) -> Vec<MatchCandidate> {
    let normalized = normalize_for(kind, query);
    if normalized.is_empty() {
        return Vec::new();
    }

    let mut matches = Vec::new();
    for candidate in pool {
        let candidate_norm = normalize_for(kind, &candidate.text);
        if candidate_norm.is_empty() {
            continue;
        }
        let score = score_for(kind, &normalized, &candidate_norm);
        if score >= threshold {
            let tier = if candidate_norm == normalized {
                MatchTier::Exact
            } else {
                MatchTier::Fuzzy
            };
            matches.push(MatchCandidate {
                candidate_id: candidate.id,
                score,
                tier,
                query: query.to_string(),
                matched: candidate.text.clone(),
            });
        }
    }
    sort_descending(&mut matches);
    matches
}

/// Direct pool scan for company names, for small candidate lists where
/// building an index is not worth it.
pub fn match_company(name: &str, pool: &[Candidate], threshold: f64) -> Vec<MatchCandidate> {
    scan(EntityKind::Company, name, pool, threshold)
}

/// Direct pool scan for person names.
pub fn match_person(name: &str, pool: &[Candidate], threshold: f64) -> Vec<MatchCandidate> {
    scan(EntityKind::Person, name, pool, threshold)
}

/// Direct pool scan for civic addresses. Reused verbatim by permit-to-parcel
/// linking.
pub fn match_address(address: &str, pool: &[Candidate], threshold: f64) -> Vec<MatchCandidate> {
    scan(EntityKind::Address, address, pool, threshold)
}
