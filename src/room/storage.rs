//! Per-room key-value persistence (§4.4 "Storage layout").
//!
//! Rooms share one SQLite pool, partitioned by `room_id`, rather than one
//! file per room — this keeps hydration cheap and lets a single connection
//! pool serve every room actor.

use std::path::Path;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};

use crate::error::StudioResult;

/// The WAL key for an individual update, zero-padded so lexicographic and
/// numeric ordering agree.
pub fn update_key(seq: u64) -> String {
    format!("update:{seq:08}")
}

pub const SNAPSHOT_KEY: &str = "doc:snapshot";
pub const SEQ_KEY: &str = "update:seq";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn connect(database_path: impl AsRef<Path>) -> StudioResult<Self> {
        let url = format!("sqlite:{}?mode=rwc", database_path.as_ref().display());
        if let Some(parent) = database_path.as_ref().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let pool = SqlitePoolOptions::new().max_connections(5).connect(&url).await?;
        let storage = Storage { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    pub async fn connect_in_memory() -> StudioResult<Self> {
        let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await?;
        let storage = Storage { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> StudioResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS room_kv (
                room_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (room_id, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, room_id: &str, key: &str) -> StudioResult<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM room_kv WHERE room_id = ?1 AND key = ?2")
            .bind(room_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    pub async fn put(&self, room_id: &str, key: &str, value: &[u8]) -> StudioResult<()> {
        sqlx::query(
            "INSERT INTO room_kv (room_id, key, value) VALUES (?1, ?2, ?3) \
             ON CONFLICT(room_id, key) DO UPDATE SET value = excluded.value",
        )
        .bind(room_id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_prefix(&self, room_id: &str, prefix: &str) -> StudioResult<()> {
        let pattern = format!("{prefix}%");
        sqlx::query("DELETE FROM room_kv WHERE room_id = ?1 AND key LIKE ?2")
            .bind(room_id)
            .bind(pattern)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Entries under `prefix`, ordered by key ascending (so zero-padded WAL
    /// keys replay in sequence order).
    pub async fn list_prefix(&self, room_id: &str, prefix: &str) -> StudioResult<Vec<(String, Vec<u8>)>> {
        let pattern = format!("{prefix}%");
        let rows = sqlx::query("SELECT key, value FROM room_kv WHERE room_id = ?1 AND key LIKE ?2 ORDER BY key ASC")
            .bind(room_id)
            .bind(pattern)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| (r.get("key"), r.get("value"))).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let storage = Storage::connect_in_memory().await.unwrap();
        storage.put("room-a", SNAPSHOT_KEY, b"hello").await.unwrap();
        assert_eq!(storage.get("room-a", SNAPSHOT_KEY).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(storage.get("room-b", SNAPSHOT_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_overwrites_existing_key() {
        let storage = Storage::connect_in_memory().await.unwrap();
        storage.put("room-a", SEQ_KEY, b"1").await.unwrap();
        storage.put("room-a", SEQ_KEY, b"2").await.unwrap();
        assert_eq!(storage.get("room-a", SEQ_KEY).await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn list_prefix_is_ordered_and_scoped_per_room() {
        let storage = Storage::connect_in_memory().await.unwrap();
        storage.put("room-a", &update_key(2), b"two").await.unwrap();
        storage.put("room-a", &update_key(1), b"one").await.unwrap();
        storage.put("room-b", &update_key(1), b"other-room").await.unwrap();

        let entries = storage.list_prefix("room-a", "update:").await.unwrap();
        assert_eq!(entries, vec![(update_key(1), b"one".to_vec()), (update_key(2), b"two".to_vec())]);
    }

    #[tokio::test]
    async fn delete_prefix_clears_only_matching_keys() {
        let storage = Storage::connect_in_memory().await.unwrap();
        storage.put("room-a", &update_key(1), b"one").await.unwrap();
        storage.put("room-a", SNAPSHOT_KEY, b"snap").await.unwrap();
        storage.delete_prefix("room-a", "update:").await.unwrap();
        assert!(storage.list_prefix("room-a", "update:").await.unwrap().is_empty());
        assert_eq!(storage.get("room-a", SNAPSHOT_KEY).await.unwrap(), Some(b"snap".to_vec()));
    }
}
