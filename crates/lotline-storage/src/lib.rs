//! Storage seam for the reconciliation engine: the [`ListingStore`] trait the
//! pipeline and tracker run against, a reference in-memory implementation
//! with relational-store semantics (unique identity keys, row-level updates),
//! and the raw-payload snapshot archive.

pub mod snapshot;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotline_core::{
    CanonicalRecord, ChangeEntry, ChangeKind, IdentityKey, ListingStatus, MutedAddress,
    ReleaseTarget, ReviewStatus, SourceListing,
};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

pub use snapshot::{SnapshotArchive, StoredSnapshot};

pub const CRATE_NAME: &str = "lotline-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique-constraint violation on the identity key: another writer
    /// inserted this key first. Callers fall back to the update path.
    #[error("identity key already present: {0}")]
    DuplicateKey(IdentityKey),
    #[error("listing not found: {0}")]
    ListingNotFound(Uuid),
    #[error("canonical record not found: {table}/{id}")]
    CanonicalNotFound { table: String, id: Uuid },
    #[error("change entry not found: {0}")]
    ChangeNotFound(Uuid),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Reviewer decision on a pending change entry. Defined by the presentation
/// layer; the store only has to support its effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeResolution {
    Accept,
    Reject,
}

/// Row-level create/update plus the simple equality/range queries the engine
/// needs. No joins, no exotic query capability.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn get_by_key(&self, key: &IdentityKey) -> Result<Option<SourceListing>, StoreError>;
    async fn insert_listing(&self, listing: SourceListing) -> Result<(), StoreError>;
    async fn update_listing(&self, listing: SourceListing) -> Result<(), StoreError>;
    async fn list_by_source(&self, source: &str) -> Result<Vec<SourceListing>, StoreError>;
    /// Listings previously promoted into a canonical table.
    async fn list_released(&self) -> Result<Vec<SourceListing>, StoreError>;
    async fn list_active_not_seen_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SourceListing>, StoreError>;

    async fn muted_addresses(&self) -> Result<Vec<MutedAddress>, StoreError>;
    async fn add_muted_address(&self, muted: MutedAddress) -> Result<(), StoreError>;

    async fn canonical_by_target(
        &self,
        target: &ReleaseTarget,
    ) -> Result<Option<CanonicalRecord>, StoreError>;
    async fn upsert_canonical(
        &self,
        target: &ReleaseTarget,
        record: CanonicalRecord,
    ) -> Result<(), StoreError>;

    async fn append_change(&self, entry: ChangeEntry) -> Result<(), StoreError>;
    async fn has_pending_change(
        &self,
        listing_id: Uuid,
        kind: ChangeKind,
    ) -> Result<bool, StoreError>;
    async fn pending_changes(&self) -> Result<Vec<ChangeEntry>, StoreError>;
    async fn changes_for_listing(&self, listing_id: Uuid) -> Result<Vec<ChangeEntry>, StoreError>;
    /// Clear a pending entry per the reviewer's decision; accepting a
    /// `PossiblyLeased` flag also retires the source listing.
    async fn resolve_change(
        &self,
        change_id: Uuid,
        resolution: ChangeResolution,
    ) -> Result<(), StoreError>;
    /// Take a listing out of all further automatic surfacing, per a
    /// reviewer's dismissal.
    async fn dismiss_listing(&self, listing_id: Uuid) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    listings: HashMap<Uuid, SourceListing>,
    key_index: HashMap<IdentityKey, Uuid>,
    muted: Vec<MutedAddress>,
    canonicals: HashMap<(String, Uuid), CanonicalRecord>,
    changes: Vec<ChangeEntry>,
}

/// Reference store used by tests and fixture runs. Enforces the same
/// identity-key uniqueness a relational unique constraint would.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn get_by_key(&self, key: &IdentityKey) -> Result<Option<SourceListing>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .key_index
            .get(key)
            .and_then(|id| inner.listings.get(id))
            .cloned())
    }

    async fn insert_listing(&self, listing: SourceListing) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.key_index.contains_key(&listing.key) {
            return Err(StoreError::DuplicateKey(listing.key));
        }
        inner.key_index.insert(listing.key.clone(), listing.id);
        inner.listings.insert(listing.id, listing);
        Ok(())
    }

    async fn update_listing(&self, listing: SourceListing) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.listings.contains_key(&listing.id) {
            return Err(StoreError::ListingNotFound(listing.id));
        }
        inner.listings.insert(listing.id, listing);
        Ok(())
    }

    async fn list_by_source(&self, source: &str) -> Result<Vec<SourceListing>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .listings
            .values()
            .filter(|l| l.key.source() == source)
            .cloned()
            .collect())
    }

    async fn list_released(&self) -> Result<Vec<SourceListing>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .listings
            .values()
            .filter(|l| l.released_to.is_some())
            .cloned()
            .collect())
    }

    async fn list_active_not_seen_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SourceListing>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .listings
            .values()
            .filter(|l| l.status == ListingStatus::Active && l.last_seen < cutoff)
            .cloned()
            .collect())
    }

    async fn muted_addresses(&self) -> Result<Vec<MutedAddress>, StoreError> {
        Ok(self.inner.read().await.muted.clone())
    }

    async fn add_muted_address(&self, muted: MutedAddress) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.muted.iter().any(|m| m.normalized == muted.normalized) {
            inner.muted.push(muted);
        }
        Ok(())
    }

    async fn canonical_by_target(
        &self,
        target: &ReleaseTarget,
    ) -> Result<Option<CanonicalRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .canonicals
            .get(&(target.table.clone(), target.record_id))
            .cloned())
    }

    async fn upsert_canonical(
        &self,
        target: &ReleaseTarget,
        record: CanonicalRecord,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .canonicals
            .insert((target.table.clone(), target.record_id), record);
        Ok(())
    }

    async fn append_change(&self, entry: ChangeEntry) -> Result<(), StoreError> {
        self.inner.write().await.changes.push(entry);
        Ok(())
    }

    async fn has_pending_change(
        &self,
        listing_id: Uuid,
        kind: ChangeKind,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.changes.iter().any(|c| {
            c.listing_id == listing_id
                && c.kind == kind
                && c.status == ReviewStatus::PendingReview
        }))
    }

    async fn pending_changes(&self) -> Result<Vec<ChangeEntry>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .changes
            .iter()
            .filter(|c| c.status == ReviewStatus::PendingReview)
            .cloned()
            .collect())
    }

    async fn changes_for_listing(&self, listing_id: Uuid) -> Result<Vec<ChangeEntry>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .changes
            .iter()
            .filter(|c| c.listing_id == listing_id)
            .cloned()
            .collect())
    }

    async fn resolve_change(
        &self,
        change_id: Uuid,
        resolution: ChangeResolution,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .changes
            .iter_mut()
            .find(|c| c.id == change_id)
            .ok_or(StoreError::ChangeNotFound(change_id))?;
        entry.status = ReviewStatus::Reviewed;
        let listing_id = entry.listing_id;
        let retire = resolution == ChangeResolution::Accept && entry.kind == ChangeKind::PossiblyLeased;
        if retire {
            if let Some(listing) = inner.listings.get_mut(&listing_id) {
                listing.status = ListingStatus::Inactive;
            }
        }
        Ok(())
    }

    async fn dismiss_listing(&self, listing_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let listing = inner
            .listings
            .get_mut(&listing_id)
            .ok_or(StoreError::ListingNotFound(listing_id))?;
        listing.status = ListingStatus::Dismissed;
        listing.dismissed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lotline_core::RecordKind;

    fn sample_listing(url: &str, last_seen: DateTime<Utc>) -> SourceListing {
        let key = IdentityKey::Url {
            source: "brokerage-a".into(),
            url: url.into(),
        };
        SourceListing {
            id: key.listing_id(),
            key,
            address: "500 2nd Ave, Saskatoon, SK".into(),
            normalized_address: "500 2nd ave".into(),
            record_kind: RecordKind::Lease,
            asking_rent: Some(18.5),
            occupancy_cost: None,
            size_sf: Some(2400.0),
            price: None,
            description: None,
            broker: None,
            raw_payload: serde_json::json!({"url": url}),
            first_seen: last_seen,
            last_seen,
            status: ListingStatus::Active,
            released_to: None,
            dismissed: false,
        }
    }

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, day, 12, 0, 0).single().expect("ts")
    }

    #[tokio::test]
    async fn duplicate_key_insert_is_rejected() {
        let store = MemoryStore::new();
        let listing = sample_listing("https://a.example/1", ts(1));
        store.insert_listing(listing.clone()).await.expect("first insert");
        let err = store.insert_listing(listing).await.expect_err("second insert");
        assert!(matches!(err, StoreError::DuplicateKey(_)));
    }

    #[tokio::test]
    async fn stale_query_filters_on_status_and_cutoff() {
        let store = MemoryStore::new();
        let fresh = sample_listing("https://a.example/fresh", ts(20));
        let stale = sample_listing("https://a.example/stale", ts(1));
        let mut retired = sample_listing("https://a.example/retired", ts(1));
        retired.status = ListingStatus::Inactive;

        store.insert_listing(fresh).await.expect("insert");
        store.insert_listing(stale.clone()).await.expect("insert");
        store.insert_listing(retired).await.expect("insert");

        let hits = store.list_active_not_seen_since(ts(10)).await.expect("query");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, stale.id);
    }

    #[tokio::test]
    async fn dismissing_a_listing_removes_it_from_staleness_surfacing() {
        let store = MemoryStore::new();
        let listing = sample_listing("https://a.example/1", ts(1));
        store.insert_listing(listing.clone()).await.expect("insert");

        store.dismiss_listing(listing.id).await.expect("dismiss");

        let stored = store
            .get_by_key(&listing.key)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, ListingStatus::Dismissed);
        assert!(stored.dismissed);
        let stale = store.list_active_not_seen_since(ts(10)).await.expect("query");
        assert!(stale.is_empty());
    }

    #[tokio::test]
    async fn accepting_possibly_leased_retires_the_listing() {
        let store = MemoryStore::new();
        let listing = sample_listing("https://a.example/1", ts(1));
        let target = ReleaseTarget {
            table: "lease_space".into(),
            record_id: Uuid::new_v4(),
        };
        store.insert_listing(listing.clone()).await.expect("insert");
        let entry = ChangeEntry::lifecycle_flag(&target, listing.id, ChangeKind::PossiblyLeased, ts(2));
        store.append_change(entry.clone()).await.expect("append");
        assert!(store
            .has_pending_change(listing.id, ChangeKind::PossiblyLeased)
            .await
            .expect("pending check"));

        store
            .resolve_change(entry.id, ChangeResolution::Accept)
            .await
            .expect("resolve");

        assert!(!store
            .has_pending_change(listing.id, ChangeKind::PossiblyLeased)
            .await
            .expect("pending check"));
        let stored = store
            .get_by_key(&listing.key)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, ListingStatus::Inactive);
    }
}
