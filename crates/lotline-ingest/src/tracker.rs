//! Temporal reconciliation: propagate field changes from released listings
//! to their canonical records and flag streams that have gone quiet.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use lotline_core::{
    CanonicalRecord, ChangeEntry, ChangeKind, ListingStatus, ReleaseTarget, SourceListing,
};
use lotline_storage::ListingStore;
use serde::Serialize;
use tracing::{info, warn};

/// Days without a re-observation before an active released listing is
/// flagged for human review.
pub const STALENESS_DAYS: i64 = 14;

#[derive(Debug, Clone, Serialize)]
pub struct TrackerSummary {
    pub released_checked: usize,
    pub fields_updated: usize,
    pub stale_flagged: usize,
    pub errors: Vec<String>,
}

pub struct ChangeTracker {
    store: Arc<dyn ListingStore>,
    staleness: Duration,
}

impl ChangeTracker {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self::with_staleness(store, Duration::days(STALENESS_DAYS))
    }

    pub fn with_staleness(store: Arc<dyn ListingStore>, staleness: Duration) -> Self {
        Self { store, staleness }
    }

    /// Run once per ingestion batch over every released listing. The link to
    /// the canonical record is the stored release pointer; fuzzy matching is
    /// never re-run here.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<TrackerSummary> {
        let released = self
            .store
            .list_released()
            .await
            .context("listing released source records")?;

        let mut summary = TrackerSummary {
            released_checked: released.len(),
            fields_updated: 0,
            stale_flagged: 0,
            errors: Vec::new(),
        };

        for listing in released {
            if let Err(err) = self.track_listing(&listing, now, &mut summary).await {
                warn!(listing = %listing.key, error = %format!("{err:#}"), "change tracking failed for listing");
                summary.errors.push(format!("{}: {err:#}", listing.key));
            }
        }

        info!(
            checked = summary.released_checked,
            fields_updated = summary.fields_updated,
            stale_flagged = summary.stale_flagged,
            errors = summary.errors.len(),
            "change tracking pass complete"
        );
        Ok(summary)
    }

    async fn track_listing(
        &self,
        listing: &SourceListing,
        now: DateTime<Utc>,
        summary: &mut TrackerSummary,
    ) -> Result<()> {
        let Some(target) = &listing.released_to else {
            return Ok(());
        };

        match self
            .store
            .canonical_by_target(target)
            .await
            .context("resolving canonical record")?
        {
            Some(canonical) => {
                summary.fields_updated += self
                    .propagate_fields(listing, target, canonical, now)
                    .await?;
            }
            None => {
                warn!(listing = %listing.key, table = %target.table, "release pointer has no canonical record");
                summary
                    .errors
                    .push(format!("{}: dangling release pointer", listing.key));
            }
        }

        if self.is_stale(listing, now)
            && !self
                .store
                .has_pending_change(listing.id, ChangeKind::PossiblyLeased)
                .await
                .context("checking for existing possibly-leased flag")?
        {
            self.store
                .append_change(ChangeEntry::lifecycle_flag(
                    target,
                    listing.id,
                    ChangeKind::PossiblyLeased,
                    now,
                ))
                .await
                .context("appending possibly-leased flag")?;
            summary.stale_flagged += 1;
        }

        Ok(())
    }

    fn is_stale(&self, listing: &SourceListing, now: DateTime<Utc>) -> bool {
        listing.status == ListingStatus::Active && now - listing.last_seen > self.staleness
    }

    /// Null-safe write-through of the volatile fields. A source value of
    /// `None` never overwrites the canonical value; applied deltas are
    /// field-level facts and land as `Reviewed` audit rows.
    async fn propagate_fields(
        &self,
        listing: &SourceListing,
        target: &ReleaseTarget,
        mut canonical: CanonicalRecord,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut updated = 0usize;
        let mut dirty = false;

        let deltas = [
            (
                listing.asking_rent,
                canonical.asking_rent,
                ChangeKind::RateChange,
                "asking_rent",
            ),
            (
                listing.occupancy_cost,
                canonical.occupancy_cost,
                ChangeKind::CostChange,
                "occupancy_cost",
            ),
            (
                listing.size_sf,
                canonical.size_sf,
                ChangeKind::SfChange,
                "size_sf",
            ),
        ];

        for (source_value, canonical_value, kind, field) in deltas {
            let Some(new_value) = source_value else {
                continue;
            };
            if canonical_value.is_some_and(|old| old == new_value) {
                continue;
            }
            self.store
                .append_change(ChangeEntry::field_delta(
                    target,
                    listing.id,
                    kind,
                    field,
                    canonical_value.map(|v| v.to_string()),
                    Some(new_value.to_string()),
                    now,
                ))
                .await
                .with_context(|| format!("appending {field} change"))?;
            match field {
                "asking_rent" => canonical.asking_rent = Some(new_value),
                "occupancy_cost" => canonical.occupancy_cost = Some(new_value),
                _ => canonical.size_sf = Some(new_value),
            }
            updated += 1;
            dirty = true;
        }

        if listing.status == ListingStatus::Active && listing.last_seen > canonical.last_seen {
            canonical.last_seen = listing.last_seen;
            dirty = true;
        }

        if dirty {
            self.store
                .upsert_canonical(target, canonical)
                .await
                .context("writing canonical record")?;
        }

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lotline_core::{EntityKind, IdentityKey, RecordKind, ReviewStatus};
    use lotline_storage::MemoryStore;
    use uuid::Uuid;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, day, 9, 0, 0).single().expect("ts")
    }

    fn released_listing(last_seen: DateTime<Utc>, rent: Option<f64>, target: &ReleaseTarget) -> SourceListing {
        let key = IdentityKey::Url {
            source: "brokerage-a".into(),
            url: "u1".into(),
        };
        SourceListing {
            id: key.listing_id(),
            key,
            address: "500 2nd Ave, Saskatoon, SK".into(),
            normalized_address: "500 2nd ave".into(),
            record_kind: RecordKind::Lease,
            asking_rent: rent,
            occupancy_cost: None,
            size_sf: None,
            price: None,
            description: None,
            broker: None,
            raw_payload: serde_json::Value::Null,
            first_seen: ts(1),
            last_seen,
            status: ListingStatus::Active,
            released_to: Some(target.clone()),
            dismissed: false,
        }
    }

    fn canonical(target: &ReleaseTarget, rent: Option<f64>, last_seen: DateTime<Utc>) -> CanonicalRecord {
        CanonicalRecord {
            id: target.record_id,
            kind: EntityKind::Address,
            label: "500 2nd Ave".into(),
            normalized_label: "500 2nd ave".into(),
            asking_rent: rent,
            occupancy_cost: Some(6.25),
            size_sf: Some(2400.0),
            last_seen,
        }
    }

    fn target() -> ReleaseTarget {
        ReleaseTarget {
            table: "lease_space".into(),
            record_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn rent_delta_is_applied_and_audited_as_reviewed() {
        let store = Arc::new(MemoryStore::new());
        let target = target();
        let listing = released_listing(ts(6), Some(19.0), &target);
        store.insert_listing(listing.clone()).await.expect("insert");
        store
            .upsert_canonical(&target, canonical(&target, Some(18.5), ts(1)))
            .await
            .expect("seed canonical");

        let tracker = ChangeTracker::new(Arc::clone(&store) as Arc<dyn ListingStore>);
        let summary = tracker.run(ts(6)).await.expect("run");
        assert_eq!(summary.fields_updated, 1);
        assert_eq!(summary.stale_flagged, 0);

        let updated = store
            .canonical_by_target(&target)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(updated.asking_rent, Some(19.0));
        assert_eq!(updated.last_seen, ts(6));

        let changes = store.changes_for_listing(listing.id).await.expect("changes");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::RateChange);
        assert_eq!(changes[0].field.as_deref(), Some("asking_rent"));
        assert_eq!(changes[0].old_value.as_deref(), Some("18.5"));
        assert_eq!(changes[0].new_value.as_deref(), Some("19"));
        assert_eq!(changes[0].status, ReviewStatus::Reviewed);
    }

    #[tokio::test]
    async fn null_source_value_never_overwrites_canonical() {
        let store = Arc::new(MemoryStore::new());
        let target = target();
        store
            .insert_listing(released_listing(ts(6), None, &target))
            .await
            .expect("insert");
        store
            .upsert_canonical(&target, canonical(&target, Some(18.5), ts(1)))
            .await
            .expect("seed canonical");

        let tracker = ChangeTracker::new(Arc::clone(&store) as Arc<dyn ListingStore>);
        let summary = tracker.run(ts(6)).await.expect("run");
        assert_eq!(summary.fields_updated, 0);

        let unchanged = store
            .canonical_by_target(&target)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(unchanged.asking_rent, Some(18.5));
    }

    #[tokio::test]
    async fn staleness_flag_fires_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let target = target();
        let listing = released_listing(ts(1), Some(18.5), &target);
        store.insert_listing(listing.clone()).await.expect("insert");
        store
            .upsert_canonical(&target, canonical(&target, Some(18.5), ts(1)))
            .await
            .expect("seed canonical");

        let tracker = ChangeTracker::new(Arc::clone(&store) as Arc<dyn ListingStore>);
        // last_seen is 20 days old on both passes.
        let first = tracker.run(ts(21)).await.expect("first run");
        let second = tracker.run(ts(21)).await.expect("second run");
        assert_eq!(first.stale_flagged, 1);
        assert_eq!(second.stale_flagged, 0);

        let pending = store.pending_changes().await.expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, ChangeKind::PossiblyLeased);
        assert_eq!(pending[0].field, None);
        assert_eq!(pending[0].status, ReviewStatus::PendingReview);
    }

    #[tokio::test]
    async fn fresh_or_inactive_listings_are_not_flagged() {
        let store = Arc::new(MemoryStore::new());
        let target = target();
        store
            .insert_listing(released_listing(ts(20), Some(18.5), &target))
            .await
            .expect("insert");
        store
            .upsert_canonical(&target, canonical(&target, Some(18.5), ts(1)))
            .await
            .expect("seed canonical");

        let tracker = ChangeTracker::new(Arc::clone(&store) as Arc<dyn ListingStore>);
        let summary = tracker.run(ts(21)).await.expect("run");
        assert_eq!(summary.stale_flagged, 0);
    }

    #[tokio::test]
    async fn dangling_release_pointer_is_reported_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        let target = target();
        store
            .insert_listing(released_listing(ts(6), Some(19.0), &target))
            .await
            .expect("insert");

        let tracker = ChangeTracker::new(Arc::clone(&store) as Arc<dyn ListingStore>);
        let summary = tracker.run(ts(6)).await.expect("run");
        assert_eq!(summary.released_checked, 1);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].contains("dangling release pointer"));
    }
}
