//! State store: last-accepted snapshot per (target, kind), atomic per key.
//!
//! Two implementations: an in-memory map for tests and dry runs, and a SQLite
//! store (one row per key, JSON snapshot column) for real deployments.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::info;

use crate::types::{PairKey, Snapshot};

/// Per-key atomic store. A reader never observes a half-written snapshot;
/// no cross-key transactionality is promised.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, pair: &PairKey) -> Result<Option<Snapshot>>;
    async fn put(&self, pair: &PairKey, snapshot: &Snapshot) -> Result<()>;
}

/// In-memory store. Per-key atomicity falls out of the map lock.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: RwLock<HashMap<PairKey, Snapshot>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, pair: &PairKey) -> Result<Option<Snapshot>> {
        Ok(self.entries.read().await.get(pair).cloned())
    }

    async fn put(&self, pair: &PairKey, snapshot: &Snapshot) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(pair.clone(), snapshot.clone());
        Ok(())
    }
}

/// Durable store on SQLite. The upsert makes each put atomic per key.
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .with_context(|| format!("invalid sqlite path: {path}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("failed to open state database")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS snapshots (
                username   TEXT NOT NULL,
                kind       TEXT NOT NULL,
                snapshot   TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (username, kind)
            )",
        )
        .execute(&pool)
        .await
        .context("failed to create snapshots table")?;

        info!(path, "state store opened");
        Ok(Self { pool })
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, pair: &PairKey) -> Result<Option<Snapshot>> {
        let row: Option<String> = sqlx::query_scalar(
            "SELECT snapshot FROM snapshots WHERE username = ?1 AND kind = ?2",
        )
        .bind(&pair.username)
        .bind(pair.kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("failed to read snapshot")?;

        match row {
            Some(json) => {
                let snapshot = serde_json::from_str(&json)
                    .with_context(|| format!("corrupt snapshot for {pair}"))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, pair: &PairKey, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot).context("failed to serialize snapshot")?;
        sqlx::query(
            "INSERT INTO snapshots (username, kind, snapshot, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(username, kind) DO UPDATE SET
                snapshot = excluded.snapshot,
                updated_at = excluded.updated_at",
        )
        .bind(&pair.username)
        .bind(pair.kind.as_str())
        .bind(json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to write snapshot")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MonitorKind, ProfileSnapshot};

    fn profile(bio: &str) -> Snapshot {
        Snapshot::Profile(ProfileSnapshot {
            user_id: "1".into(),
            display_name: "Alice".into(),
            bio: bio.into(),
            avatar_url: String::new(),
            location: String::new(),
        })
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStateStore::new();
        let pair = PairKey::new("alice", MonitorKind::Profile);

        assert!(store.get(&pair).await.unwrap().is_none());
        store.put(&pair, &profile("hi")).await.unwrap();
        assert_eq!(store.get(&pair).await.unwrap(), Some(profile("hi")));

        // Put replaces; one entry per key.
        store.put(&pair, &profile("bye")).await.unwrap();
        assert_eq!(store.get(&pair).await.unwrap(), Some(profile("bye")));
    }

    #[tokio::test]
    async fn test_memory_store_keys_are_independent() {
        let store = MemoryStateStore::new();
        let profile_key = PairKey::new("alice", MonitorKind::Profile);
        let tweets_key = PairKey::new("alice", MonitorKind::Tweets);

        store.put(&profile_key, &profile("hi")).await.unwrap();
        assert!(store.get(&tweets_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let store = SqliteStateStore::open(path.to_str().unwrap()).await.unwrap();
        let pair = PairKey::new("alice", MonitorKind::Profile);

        assert!(store.get(&pair).await.unwrap().is_none());
        store.put(&pair, &profile("hi")).await.unwrap();
        store.put(&pair, &profile("bye")).await.unwrap();
        assert_eq!(store.get(&pair).await.unwrap(), Some(profile("bye")));
    }

    #[tokio::test]
    async fn test_sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let pair = PairKey::new("alice", MonitorKind::Profile);

        {
            let store = SqliteStateStore::open(path.to_str().unwrap()).await.unwrap();
            store.put(&pair, &profile("persisted")).await.unwrap();
        }
        let store = SqliteStateStore::open(path.to_str().unwrap()).await.unwrap();
        assert_eq!(store.get(&pair).await.unwrap(), Some(profile("persisted")));
    }
}
