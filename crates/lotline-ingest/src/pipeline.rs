//! Listing ingestion and dedup: resolve each observed draft against storage
//! by its identity key and insert-or-update, never duplicating a key.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use lotline_core::{IdentityKey, ListingDraft, ListingStatus, SourceListing};
use lotline_match::normalize::normalize_address;
use lotline_storage::{ListingStore, SnapshotArchive, StoreError};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

/// One record's failure, keyed so an operator can find the offending row.
#[derive(Debug, Clone, Serialize)]
pub struct IngestError {
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub received: usize,
    pub inserted: usize,
    pub updated: usize,
    pub dismissed: usize,
    pub errors: Vec<IngestError>,
    /// Set when the whole batch could not be obtained; no rows were touched.
    pub batch_error: Option<String>,
}

impl IngestSummary {
    pub fn batch_failure(run_id: Uuid, source: &str, at: DateTime<Utc>, message: String) -> Self {
        Self {
            run_id,
            source: source.to_string(),
            started_at: at,
            finished_at: at,
            received: 0,
            inserted: 0,
            updated: 0,
            dismissed: 0,
            errors: Vec::new(),
            batch_error: Some(message),
        }
    }
}

enum DraftOutcome {
    Inserted { dismissed: bool },
    Updated,
}

pub struct IngestPipeline {
    store: Arc<dyn ListingStore>,
    archive: SnapshotArchive,
    workers: usize,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn ListingStore>, archive: SnapshotArchive, workers: usize) -> Self {
        Self {
            store,
            archive,
            workers: workers.max(1),
        }
    }

    /// Ingest one source's batch. Records are independent and run on a
    /// bounded worker pool; a single record's failure is logged, counted,
    /// and skipped without aborting the batch.
    pub async fn run_batch(
        self: &Arc<Self>,
        run_id: Uuid,
        source: &str,
        drafts: Vec<ListingDraft>,
        now: DateTime<Utc>,
    ) -> Result<IngestSummary> {
        let started_at = Utc::now();
        let received = drafts.len();

        let muted: Arc<HashSet<String>> = Arc::new(
            self.store
                .muted_addresses()
                .await
                .context("loading muted addresses")?
                .into_iter()
                .map(|m| m.normalized)
                .collect(),
        );

        let limit = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let pipeline = Arc::clone(self);
            let muted = Arc::clone(&muted);
            let limit = Arc::clone(&limit);
            handles.push(tokio::spawn(async move {
                let key_label = draft_key_label(&draft);
                let _permit = match limit.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return Err(IngestError {
                            key: key_label,
                            message: "worker pool closed".to_string(),
                        })
                    }
                };
                pipeline
                    .process_draft(draft, &muted, now)
                    .await
                    .map_err(|err| IngestError {
                        key: key_label,
                        message: format!("{err:#}"),
                    })
            }));
        }

        let mut inserted = 0usize;
        let mut updated = 0usize;
        let mut dismissed = 0usize;
        let mut errors = Vec::new();
        for handle in handles {
            match handle.await.context("joining ingest worker")? {
                Ok(DraftOutcome::Inserted { dismissed: was_dismissed }) => {
                    inserted += 1;
                    if was_dismissed {
                        dismissed += 1;
                    }
                }
                Ok(DraftOutcome::Updated) => updated += 1,
                Err(err) => {
                    warn!(run_id = %run_id, source, key = %err.key, error = %err.message, "skipping record");
                    errors.push(err);
                }
            }
        }

        let summary = IngestSummary {
            run_id,
            source: source.to_string(),
            started_at,
            finished_at: Utc::now(),
            received,
            inserted,
            updated,
            dismissed,
            errors,
            batch_error: None,
        };
        info!(
            run_id = %run_id,
            source,
            received = summary.received,
            inserted = summary.inserted,
            updated = summary.updated,
            dismissed = summary.dismissed,
            errors = summary.errors.len(),
            "batch ingested"
        );
        Ok(summary)
    }

    async fn process_draft(
        &self,
        draft: ListingDraft,
        muted: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<DraftOutcome> {
        let normalized_address = normalize_address(&draft.address);
        let key = identity_key_for(&draft, &normalized_address)?;

        let outcome = match self
            .store
            .get_by_key(&key)
            .await
            .with_context(|| format!("looking up {key}"))?
        {
            Some(existing) => {
                let refreshed = apply_observation(existing, &draft, now);
                self.store
                    .update_listing(refreshed)
                    .await
                    .with_context(|| format!("updating {key}"))?;
                DraftOutcome::Updated
            }
            None => {
                let dismissed = muted.contains(&normalized_address);
                let listing = new_listing(&key, &draft, &normalized_address, dismissed, now);
                match self.store.insert_listing(listing).await {
                    Ok(()) => DraftOutcome::Inserted { dismissed },
                    // Another worker inserted this key first; fall back to
                    // updating the row it created.
                    Err(StoreError::DuplicateKey(_)) => {
                        warn!(key = %key, "insert lost identity-key race, retrying as update");
                        let existing = self
                            .store
                            .get_by_key(&key)
                            .await
                            .with_context(|| format!("re-reading {key} after duplicate key"))?
                            .with_context(|| format!("{key} vanished after duplicate-key insert"))?;
                        let refreshed = apply_observation(existing, &draft, now);
                        self.store
                            .update_listing(refreshed)
                            .await
                            .with_context(|| format!("updating {key}"))?;
                        DraftOutcome::Updated
                    }
                    Err(err) => return Err(err).with_context(|| format!("inserting {key}")),
                }
            }
        };

        self.archive
            .store_payload(now, key.source(), &draft.raw_payload)
            .await
            .with_context(|| format!("archiving raw payload for {key}"))?;

        Ok(outcome)
    }
}

fn draft_key_label(draft: &ListingDraft) -> String {
    match &draft.source_url {
        Some(url) if !url.trim().is_empty() => format!("{}:{}", draft.source, url),
        _ => format!("{}:{}", draft.source, draft.address),
    }
}

fn identity_key_for(draft: &ListingDraft, normalized_address: &str) -> Result<IdentityKey> {
    if let Some(url) = &draft.source_url {
        let url = url.trim();
        if !url.is_empty() {
            return Ok(IdentityKey::Url {
                source: draft.source.clone(),
                url: url.to_string(),
            });
        }
    }
    if normalized_address.is_empty() {
        bail!("draft carries neither a source URL nor a usable address");
    }
    Ok(IdentityKey::Address {
        source: draft.source.clone(),
        normalized_address: normalized_address.to_string(),
        record_kind: draft.record_kind,
    })
}

fn new_listing(
    key: &IdentityKey,
    draft: &ListingDraft,
    normalized_address: &str,
    dismissed: bool,
    now: DateTime<Utc>,
) -> SourceListing {
    SourceListing {
        id: key.listing_id(),
        key: key.clone(),
        address: draft.address.clone(),
        normalized_address: normalized_address.to_string(),
        record_kind: draft.record_kind,
        asking_rent: draft.asking_rent,
        occupancy_cost: draft.occupancy_cost,
        size_sf: draft.size_sf,
        price: draft.price,
        description: draft.description.clone(),
        broker: draft.broker.clone(),
        raw_payload: draft.raw_payload.clone(),
        first_seen: now,
        last_seen: now,
        status: ListingStatus::Active,
        released_to: None,
        dismissed,
    }
}

/// Fold a re-observation into the stored row. `first_seen`, the identity
/// key, and the `dismissed` flag are never touched here; a missing source
/// value never erases a stored one.
fn apply_observation(mut existing: SourceListing, draft: &ListingDraft, now: DateTime<Utc>) -> SourceListing {
    if let Some(v) = draft.asking_rent {
        existing.asking_rent = Some(v);
    }
    if let Some(v) = draft.occupancy_cost {
        existing.occupancy_cost = Some(v);
    }
    if let Some(v) = draft.size_sf {
        existing.size_sf = Some(v);
    }
    if let Some(v) = draft.price {
        existing.price = Some(v);
    }
    if let Some(v) = &draft.description {
        existing.description = Some(v.clone());
    }
    if let Some(v) = &draft.broker {
        existing.broker = Some(v.clone());
    }
    if !draft.raw_payload.is_null() {
        existing.raw_payload = draft.raw_payload.clone();
    }
    if now > existing.last_seen {
        existing.last_seen = now;
    }
    existing
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lotline_core::{MutedAddress, RecordKind};
    use lotline_match::normalize::normalize_address;
    use lotline_storage::MemoryStore;
    use tempfile::tempdir;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, day, 9, 0, 0).single().expect("ts")
    }

    fn draft(url: Option<&str>, address: &str, rent: Option<f64>) -> ListingDraft {
        ListingDraft {
            source: "brokerage-a".into(),
            source_url: url.map(str::to_string),
            address: address.into(),
            record_kind: RecordKind::Lease,
            asking_rent: rent,
            occupancy_cost: None,
            size_sf: None,
            price: None,
            description: None,
            broker: None,
            raw_payload: serde_json::json!({"address": address, "askingRent": rent}),
        }
    }

    fn pipeline(store: Arc<MemoryStore>, dir: &std::path::Path) -> Arc<IngestPipeline> {
        Arc::new(IngestPipeline::new(
            store,
            SnapshotArchive::new(dir.join("snapshots")),
            4,
        ))
    }

    #[tokio::test]
    async fn reingesting_same_url_key_updates_in_place() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(Arc::clone(&store), dir.path());
        let run = Uuid::new_v4();

        let first = pipeline
            .run_batch(run, "brokerage-a", vec![draft(Some("u1"), "500 2nd Ave, Saskatoon, SK", Some(18.5))], ts(1))
            .await
            .expect("first batch");
        assert_eq!((first.inserted, first.updated), (1, 0));

        let second = pipeline
            .run_batch(run, "brokerage-a", vec![draft(Some("u1"), "500 2nd Ave, Saskatoon, SK", Some(19.0))], ts(6))
            .await
            .expect("second batch");
        assert_eq!((second.inserted, second.updated), (0, 1));

        let key = IdentityKey::Url {
            source: "brokerage-a".into(),
            url: "u1".into(),
        };
        let rows = store.list_by_source("brokerage-a").await.expect("list");
        assert_eq!(rows.len(), 1);
        let row = store.get_by_key(&key).await.expect("get").expect("present");
        assert_eq!(row.first_seen, ts(1));
        assert_eq!(row.last_seen, ts(6));
        assert_eq!(row.asking_rent, Some(19.0));
    }

    #[tokio::test]
    async fn last_seen_advances_even_without_field_changes() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(Arc::clone(&store), dir.path());
        let run = Uuid::new_v4();

        let d = draft(Some("u1"), "500 2nd Ave", Some(18.5));
        pipeline
            .run_batch(run, "brokerage-a", vec![d.clone()], ts(1))
            .await
            .expect("batch");
        pipeline
            .run_batch(run, "brokerage-a", vec![d], ts(3))
            .await
            .expect("batch");

        let rows = store.list_by_source("brokerage-a").await.expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].first_seen, ts(1));
        assert_eq!(rows[0].last_seen, ts(3));
    }

    #[tokio::test]
    async fn muted_address_is_dismissed_on_first_sight() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        store
            .add_muted_address(MutedAddress {
                raw: "306 Ontario Avenue, Saskatoon".into(),
                normalized: normalize_address("306 Ontario Avenue, Saskatoon"),
            })
            .await
            .expect("mute");
        let pipeline = pipeline(Arc::clone(&store), dir.path());

        let summary = pipeline
            .run_batch(
                Uuid::new_v4(),
                "brokerage-a",
                vec![draft(None, "306 Ontario Ave, Saskatoon, SK", Some(22.0))],
                ts(1),
            )
            .await
            .expect("batch");
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.dismissed, 1);

        let rows = store.list_by_source("brokerage-a").await.expect("list");
        assert!(rows[0].dismissed);
        assert_eq!(rows[0].status, ListingStatus::Active);
    }

    #[tokio::test]
    async fn unusable_draft_is_skipped_without_aborting_the_batch() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(Arc::clone(&store), dir.path());

        let summary = pipeline
            .run_batch(
                Uuid::new_v4(),
                "brokerage-a",
                vec![
                    draft(None, "Saskatoon, SK", None), // normalizes to empty
                    draft(Some("u2"), "500 2nd Ave", Some(18.5)),
                ],
                ts(1),
            )
            .await
            .expect("batch");

        assert_eq!(summary.received, 2);
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].message.contains("usable address"));
    }

    #[tokio::test]
    async fn same_key_twice_in_one_batch_yields_one_row() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(Arc::clone(&store), dir.path());

        let summary = pipeline
            .run_batch(
                Uuid::new_v4(),
                "brokerage-a",
                vec![
                    draft(Some("u1"), "500 2nd Ave", Some(18.5)),
                    draft(Some("u1"), "500 2nd Ave", Some(19.0)),
                ],
                ts(1),
            )
            .await
            .expect("batch");

        assert_eq!(summary.inserted + summary.updated, 2);
        let rows = store.list_by_source("brokerage-a").await.expect("list");
        assert_eq!(rows.len(), 1);
    }
}
