use anyhow::{bail, Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::mastodon::StatusId;

/// The newest status handled for an account, and the Telegram message it
/// became (absent when the status was filtered or given up on).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRecord {
    pub status_id: StatusId,
    pub message_id: Option<i32>,
}

/// SQLite-backed persistence for relay records.
#[derive(Clone)]
pub struct SqliteRelayStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRelayStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Self::run_migrations(&conn)?;

        info!("Relay store opened at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS relay_records (
                account TEXT PRIMARY KEY,
                status_id TEXT NOT NULL,
                message_id INTEGER,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Status to message mapping, used to thread self-replies
            CREATE TABLE IF NOT EXISTS relayed_messages (
                account TEXT NOT NULL,
                status_id TEXT NOT NULL,
                message_id INTEGER NOT NULL,
                PRIMARY KEY (account, status_id)
            );
            ",
        )
        .context("Failed to create relay tables")?;
        Ok(())
    }

    pub async fn load(&self, account: &str) -> Result<Option<RelayRecord>> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                "SELECT status_id, message_id FROM relay_records WHERE account = ?1",
                rusqlite::params![account],
                |row| {
                    Ok(RelayRecord {
                        status_id: StatusId::new(row.get::<_, String>(0)?),
                        message_id: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("Failed to load relay record")?;
        Ok(record)
    }

    /// Move the record forward to `status_id`. Moving it backwards is an
    /// error; re-recording the same id is allowed.
    pub async fn advance(
        &self,
        account: &str,
        status_id: &StatusId,
        message_id: Option<i32>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status_id FROM relay_records WHERE account = ?1",
                rusqlite::params![account],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(current) = current.map(StatusId::new) {
            if *status_id < current {
                bail!(
                    "Refusing to move relay record for {} back from {} to {}",
                    account,
                    current,
                    status_id
                );
            }
        }

        tx.execute(
            "INSERT INTO relay_records (account, status_id, message_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(account) DO UPDATE SET
                status_id = excluded.status_id,
                message_id = excluded.message_id,
                updated_at = datetime('now')",
            rusqlite::params![account, status_id.as_str(), message_id],
        )
        .context("Failed to store relay record")?;

        if let Some(message_id) = message_id {
            tx.execute(
                "INSERT OR REPLACE INTO relayed_messages (account, status_id, message_id)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![account, status_id.as_str(), message_id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Telegram message a status was relayed as, if any.
    pub async fn message_for(&self, account: &str, status_id: &StatusId) -> Result<Option<i32>> {
        let conn = self.conn.lock().await;
        let message_id = conn
            .query_row(
                "SELECT message_id FROM relayed_messages WHERE account = ?1 AND status_id = ?2",
                rusqlite::params![account, status_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_store_has_no_record() {
        let store = SqliteRelayStore::open_in_memory().unwrap();
        assert_eq!(store.load("alice").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_advance_and_load() {
        let store = SqliteRelayStore::open_in_memory().unwrap();
        store
            .advance("alice", &StatusId::from("101"), Some(5))
            .await
            .unwrap();
        store
            .advance("alice", &StatusId::from("102"), None)
            .await
            .unwrap();

        assert_eq!(
            store.load("alice").await.unwrap(),
            Some(RelayRecord {
                status_id: StatusId::from("102"),
                message_id: None,
            })
        );
        assert_eq!(
            store.message_for("alice", &StatusId::from("101")).await.unwrap(),
            Some(5)
        );
        assert_eq!(
            store.message_for("alice", &StatusId::from("102")).await.unwrap(),
            None
        );
        assert_eq!(store.load("bob").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_advance_rejects_regression() {
        let store = SqliteRelayStore::open_in_memory().unwrap();
        store
            .advance("alice", &StatusId::from("1000"), Some(1))
            .await
            .unwrap();

        // "999" is older even though it sorts after "1000" as a string.
        let err = store
            .advance("alice", &StatusId::from("999"), Some(2))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("back from 1000 to 999"));

        store
            .advance("alice", &StatusId::from("1000"), Some(1))
            .await
            .unwrap();
        assert_eq!(
            store.load("alice").await.unwrap().unwrap().status_id,
            StatusId::from("1000")
        );
    }

    #[tokio::test]
    async fn test_record_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.db");

        {
            let store = SqliteRelayStore::open(&path).unwrap();
            store
                .advance("alice", &StatusId::from("103"), Some(9))
                .await
                .unwrap();
        }

        let store = SqliteRelayStore::open(&path).unwrap();
        assert_eq!(
            store.load("alice").await.unwrap(),
            Some(RelayRecord {
                status_id: StatusId::from("103"),
                message_id: Some(9),
            })
        );
    }
}
