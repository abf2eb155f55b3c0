//! Hash-addressed archive of raw source payloads.
//!
//! Every ingested observation's raw payload is kept verbatim for audit and
//! debugging; the structured listing fields remain the only operational
//! representation. Writes are atomic (temp file + rename) and identical
//! payloads deduplicate onto the same hash path.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct SnapshotArchive {
    root: PathBuf,
}

impl SnapshotArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn snapshot_relative_path(
        observed_at: DateTime<Utc>,
        source: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = observed_at.format("%Y%m%d").to_string();
        PathBuf::from(stamp)
            .join(source)
            .join(format!("{content_hash}.json"))
    }

    /// Persist one raw payload under its content hash.
    pub async fn store_payload(
        &self,
        observed_at: DateTime<Utc>,
        source: &str,
        payload: &serde_json::Value,
    ) -> anyhow::Result<StoredSnapshot> {
        let bytes = serde_json::to_vec_pretty(payload).context("serializing raw payload")?;
        let content_hash = Self::sha256_hex(&bytes);
        let relative_path = Self::snapshot_relative_path(observed_at, source, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating snapshot directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            return Ok(StoredSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.tmp", Uuid::new_v4());
        let temp_path = match absolute_path.parent() {
            Some(parent) => parent.join(temp_name),
            None => PathBuf::from(temp_name),
        };

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredSnapshot {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp snapshot {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn observed_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-08-27T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn identical_payloads_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let archive = SnapshotArchive::new(dir.path());
        let payload = serde_json::json!({"address": "500 2nd Ave", "askingRent": 18.5});

        let first = archive
            .store_payload(observed_at(), "brokerage-a", &payload)
            .await
            .expect("first store");
        let second = archive
            .store_payload(observed_at(), "brokerage-a", &payload)
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn different_payloads_get_distinct_paths() {
        let dir = tempdir().expect("tempdir");
        let archive = SnapshotArchive::new(dir.path());

        let a = archive
            .store_payload(observed_at(), "brokerage-a", &serde_json::json!({"rent": 18.5}))
            .await
            .expect("store a");
        let b = archive
            .store_payload(observed_at(), "brokerage-a", &serde_json::json!({"rent": 19.0}))
            .await
            .expect("store b");

        assert_ne!(a.content_hash, b.content_hash);
        assert_ne!(a.relative_path, b.relative_path);
    }
}
