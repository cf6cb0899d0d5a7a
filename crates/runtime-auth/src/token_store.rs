//! Token Store (C5).
//!
//! Persistent key/value for a single OAuth credential set, written with the
//! same temp-file-then-rename discipline the teacher's journal module uses
//! for SQLite checkpoints: write to a sibling `.tmp` path, `fsync` it, then
//! atomically rename over the real path so a crash mid-write never leaves a
//! torn record on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// A persisted OAuth credential set (§3 Token Record).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    /// Absent for grants that never issued one (or after the provider denies
    /// a refresh attempt permanently) — surfaces as `ExpiredNoRefresh` once
    /// the access token itself also expires.
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scopes: BTreeSet<String>,
    pub subject: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenStoreError {
    #[error("token store io error: {0}")]
    Io(#[from] io::Error),
    #[error("token store file is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// File-backed store for a single `TokenRecord`. Cheap to clone; every
/// operation re-opens the file so the store itself holds no file handle.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read the persisted record, or `None` if the store has never been written.
    pub async fn load(&self) -> Result<Option<TokenRecord>, TokenStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || load_sync(&path))
            .await
            .expect("token store load task panicked")
    }

    /// Atomically replace the persisted record.
    pub async fn save(&self, record: &TokenRecord) -> Result<(), TokenStoreError> {
        let path = self.path.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || save_sync(&path, &record))
            .await
            .expect("token store save task panicked")
    }

    /// Remove the persisted record (explicit revocation). A no-op if absent.
    pub async fn clear(&self) -> Result<(), TokenStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || clear_sync(&path))
            .await
            .expect("token store clear task panicked")
    }
}

fn load_sync(path: &Path) -> Result<Option<TokenRecord>, TokenStoreError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn save_sync(path: &Path, record: &TokenRecord) -> Result<(), TokenStoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(record)?;
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn clear_sync(path: &Path) -> Result<(), TokenStoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample() -> TokenRecord {
        TokenRecord {
            access_token: "access".into(),
            refresh_token: Some("refresh".into()),
            expires_at: Utc::now() + Duration::hours(4),
            scopes: BTreeSet::from(["channel:read:subscriptions".to_owned()]),
            subject: Some("12345".into()),
        }
    }

    #[tokio::test]
    async fn load_on_unwritten_store_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("nested").join("tokens.json"));
        let record = sample();
        store.save(&record).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn save_overwrites_previous_record_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));
        store.save(&sample()).await.unwrap();
        let mut second = sample();
        second.access_token = "rotated".into();
        store.save(&second).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "rotated");
    }

    #[tokio::test]
    async fn clear_removes_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));
        store.save(&sample()).await.unwrap();
        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        // Clearing an already-absent store is not an error.
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_file_surfaces_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, b"not json").unwrap();
        let store = TokenStore::new(path);
        assert!(matches!(store.load().await, Err(TokenStoreError::Malformed(_))));
    }
}
