//! Replay protection stores
//!
//! A `(signer, nonce)` pair may be accepted once for the lifetime of the
//! expiry window. Inserts are atomic: of two concurrent verifications of the
//! same pair exactly one observes `true`.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::AttestationError;
use crate::types::Address;

/// Durable set of consumed `(signer, nonce)` pairs
#[async_trait]
pub trait ReplayStore: Send + Sync {
    /// Record the pair. Returns `true` if it was new, `false` on a replay.
    async fn insert_if_absent(&self, signer: &Address, nonce: &str)
        -> Result<bool, AttestationError>;
}

/// Process-local replay store
#[derive(Debug, Default)]
pub struct InMemoryReplayStore {
    seen: RwLock<HashMap<(Address, String), i64>>,
}

impl InMemoryReplayStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seen.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget pairs recorded before `cutoff` (unix seconds). Only safe once
    /// the corresponding envelopes are past the expiry window.
    pub fn prune_before(&self, cutoff: i64) -> usize {
        let mut seen = self.seen.write();
        let before = seen.len();
        seen.retain(|_, recorded_at| *recorded_at >= cutoff);
        before - seen.len()
    }
}

#[async_trait]
impl ReplayStore for InMemoryReplayStore {
    async fn insert_if_absent(
        &self,
        signer: &Address,
        nonce: &str,
    ) -> Result<bool, AttestationError> {
        let mut seen = self.seen.write();
        let key = (signer.clone(), nonce.to_string());
        if seen.contains_key(&key) {
            return Ok(false);
        }
        seen.insert(key, chrono::Utc::now().timestamp());
        Ok(true)
    }
}

/// SQLite-backed replay store, unique-constrained on `(signer, nonce)`
#[derive(Clone)]
pub struct SqliteReplayStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteReplayStore {
    /// Open (or create) the database in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AttestationError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AttestationError::ReplayStore(format!(
                        "creating directory '{}': {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::from_connection(conn)
    }

    /// Non-persistent database, mostly for tests.
    pub fn in_memory() -> Result<Self, AttestationError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, AttestationError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS attestation_nonces (
                signer       TEXT NOT NULL,
                nonce        TEXT NOT NULL,
                recorded_at  INTEGER NOT NULL,
                PRIMARY KEY (signer, nonce)
            );

            CREATE INDEX IF NOT EXISTS idx_nonces_recorded_at
                ON attestation_nonces(recorded_at);
            ",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Delete pairs recorded before `cutoff` (unix seconds).
    pub fn prune_before(&self, cutoff: i64) -> Result<usize, AttestationError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM attestation_nonces WHERE recorded_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    pub fn count(&self) -> Result<i64, AttestationError> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM attestation_nonces", [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }
}

impl std::fmt::Debug for SqliteReplayStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteReplayStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl ReplayStore for SqliteReplayStore {
    async fn insert_if_absent(
        &self,
        signer: &Address,
        nonce: &str,
    ) -> Result<bool, AttestationError> {
        let conn = self.conn.clone();
        let signer = signer.to_string();
        let nonce = nonce.to_string();
        let recorded_at = chrono::Utc::now().timestamp();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO attestation_nonces (signer, nonce, recorded_at)
                 VALUES (?1, ?2, ?3)",
                params![signer, nonce, recorded_at],
            )?;
            Ok(inserted == 1)
        })
        .await
        .map_err(|e| AttestationError::ReplayStore(format!("replay insert task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> Address {
        Address::from_bytes([9u8; 20])
    }

    #[tokio::test]
    async fn test_in_memory_rejects_duplicates() {
        let store = InMemoryReplayStore::new();
        assert!(store.insert_if_absent(&signer(), "n1").await.unwrap());
        assert!(!store.insert_if_absent(&signer(), "n1").await.unwrap());
        assert!(store.insert_if_absent(&signer(), "n2").await.unwrap());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_prune() {
        let store = InMemoryReplayStore::new();
        store.insert_if_absent(&signer(), "n1").await.unwrap();
        assert_eq!(store.prune_before(i64::MAX), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_rejects_duplicates() {
        let store = SqliteReplayStore::in_memory().unwrap();
        assert!(store.insert_if_absent(&signer(), "n1").await.unwrap());
        assert!(!store.insert_if_absent(&signer(), "n1").await.unwrap());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.db");

        {
            let store = SqliteReplayStore::open(&path).unwrap();
            assert!(store.insert_if_absent(&signer(), "n1").await.unwrap());
        }

        let reopened = SqliteReplayStore::open(&path).unwrap();
        assert!(!reopened.insert_if_absent(&signer(), "n1").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_inserts_admit_one() {
        let store = Arc::new(SqliteReplayStore::in_memory().unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.insert_if_absent(&signer(), "shared").await.unwrap()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }
}
