//! Core domain model for Lotline: source observations, canonical records,
//! match results, and the change-history audit types shared by every crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lotline-core";

/// Closed set of entity families the matcher understands. Candidates of one
/// kind are never compared against another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Company,
    Person,
    Address,
}

/// What kind of observation a source listing is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Lease,
    Sale,
    Assessment,
    Permit,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Lease => "lease",
            RecordKind::Sale => "sale",
            RecordKind::Assessment => "assessment",
            RecordKind::Permit => "permit",
        }
    }
}

/// Lifecycle state of a source listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Active,
    Inactive,
    Dismissed,
}

/// Identity key deciding whether two observations are the same listing.
///
/// A source URL, when present, is the observation stream's identity. Without
/// one the listing is keyed by its normalized address within the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum IdentityKey {
    Url {
        source: String,
        url: String,
    },
    Address {
        source: String,
        normalized_address: String,
        record_kind: RecordKind,
    },
}

impl IdentityKey {
    pub fn source(&self) -> &str {
        match self {
            IdentityKey::Url { source, .. } => source,
            IdentityKey::Address { source, .. } => source,
        }
    }

    /// Deterministic listing id derived from the key, so re-ingesting the
    /// same observation stream always lands on the same row id.
    pub fn listing_id(&self) -> Uuid {
        let material = match self {
            IdentityKey::Url { source, url } => format!("{source}|url|{url}"),
            IdentityKey::Address {
                source,
                normalized_address,
                record_kind,
            } => format!("{source}|addr|{normalized_address}|{}", record_kind.as_str()),
        };
        Uuid::new_v5(&Uuid::NAMESPACE_URL, material.as_bytes())
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityKey::Url { source, url } => write!(f, "{source}:{url}"),
            IdentityKey::Address {
                source,
                normalized_address,
                record_kind,
            } => write!(f, "{source}:{normalized_address}:{}", record_kind.as_str()),
        }
    }
}

/// Handoff contract from the fetch/parse layer into the ingestion pipeline:
/// one observation of one listing, as the source presented it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub source: String,
    #[serde(default)]
    pub source_url: Option<String>,
    pub address: String,
    pub record_kind: RecordKind,
    #[serde(default)]
    pub asking_rent: Option<f64>,
    #[serde(default)]
    pub occupancy_cost: Option<f64>,
    #[serde(default)]
    pub size_sf: Option<f64>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub broker: Option<String>,
    /// Full raw payload as parsed from the source, kept verbatim for audit.
    /// Never a substitute for the structured fields above.
    #[serde(default)]
    pub raw_payload: serde_json::Value,
}

/// Pointer naming which canonical table/record a listing was promoted into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReleaseTarget {
    pub table: String,
    pub record_id: Uuid,
}

/// A stored observation stream: one external source's view of one listing
/// over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceListing {
    pub id: Uuid,
    pub key: IdentityKey,
    pub address: String,
    pub normalized_address: String,
    pub record_kind: RecordKind,
    pub asking_rent: Option<f64>,
    pub occupancy_cost: Option<f64>,
    pub size_sf: Option<f64>,
    pub price: Option<f64>,
    pub description: Option<String>,
    pub broker: Option<String>,
    pub raw_payload: serde_json::Value,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: ListingStatus,
    pub released_to: Option<ReleaseTarget>,
    pub dismissed: bool,
}

/// Long-lived authoritative entity other data links against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: Uuid,
    pub kind: EntityKind,
    /// Display name for companies/people, civic address for properties.
    pub label: String,
    pub normalized_label: String,
    pub asking_rent: Option<f64>,
    pub occupancy_cost: Option<f64>,
    pub size_sf: Option<f64>,
    pub last_seen: DateTime<Utc>,
}

/// Which comparison tier produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Exact,
    Normalized,
    Fuzzy,
}

/// One matching attempt's result. Transient, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub candidate_id: Uuid,
    pub score: f64,
    pub tier: MatchTier,
    pub query: String,
    pub matched: String,
}

/// An address a reviewer has opted out of further automatic surfacing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutedAddress {
    pub raw: String,
    pub normalized: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    RateChange,
    SfChange,
    CostChange,
    PossiblyLeased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Auto-applied field-level fact; no human gate.
    Reviewed,
    /// Judgment call awaiting a human decision.
    PendingReview,
}

/// Audit row for one detected field delta or lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub id: Uuid,
    pub target_table: String,
    pub target_id: Uuid,
    pub listing_id: Uuid,
    pub kind: ChangeKind,
    /// None for lifecycle events such as `PossiblyLeased`.
    pub field: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub status: ReviewStatus,
    pub created_at: DateTime<Utc>,
}

impl ChangeEntry {
    pub fn field_delta(
        target: &ReleaseTarget,
        listing_id: Uuid,
        kind: ChangeKind,
        field: &str,
        old_value: Option<String>,
        new_value: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_table: target.table.clone(),
            target_id: target.record_id,
            listing_id,
            kind,
            field: Some(field.to_string()),
            old_value,
            new_value,
            status: ReviewStatus::Reviewed,
            created_at: at,
        }
    }

    pub fn lifecycle_flag(
        target: &ReleaseTarget,
        listing_id: Uuid,
        kind: ChangeKind,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_table: target.table.clone(),
            target_id: target.record_id,
            listing_id,
            kind,
            field: None,
            old_value: None,
            new_value: None,
            status: ReviewStatus::PendingReview,
            created_at: at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_key_id_is_stable_across_reingestion() {
        let a = IdentityKey::Url {
            source: "broker-site".into(),
            url: "https://example.com/listing/42".into(),
        };
        let b = a.clone();
        assert_eq!(a.listing_id(), b.listing_id());
    }

    #[test]
    fn address_key_discriminates_on_record_kind() {
        let lease = IdentityKey::Address {
            source: "assessment-roll".into(),
            normalized_address: "500 2nd ave".into(),
            record_kind: RecordKind::Lease,
        };
        let sale = IdentityKey::Address {
            source: "assessment-roll".into(),
            normalized_address: "500 2nd ave".into(),
            record_kind: RecordKind::Sale,
        };
        assert_ne!(lease.listing_id(), sale.listing_id());
    }
}
