//! SQLite-backed record table.
//!
//! Items are stored one row per `(table_name, id)` with their attributes as a
//! JSON object, so several logical tables can share one database file.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{RecordItem, RecordTable, StoreError};

/// SQLite record table.
pub struct SqliteTable {
    conn: Mutex<Connection>,
    table_name: String,
}

impl SqliteTable {
    /// Open or create a table in the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P, table_name: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::with_connection(conn, table_name)
    }

    /// Open an in-memory table (for testing).
    pub fn open_in_memory(table_name: &str) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, table_name)
    }

    fn with_connection(conn: Connection, table_name: &str) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            table_name: table_name.to_string(),
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("record store lock poisoned".to_string()))
    }

    fn get_blocking(&self, id: &str) -> Result<Option<RecordItem>, StoreError> {
        let conn = self.lock()?;
        read_item(&conn, &self.table_name, id)
    }

    fn update_blocking(&self, item: RecordItem) -> Result<RecordItem, StoreError> {
        let id = item
            .id()
            .ok_or(StoreError::Malformed {
                attribute: "id",
                detail: "missing".to_string(),
            })?
            .to_string();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut stored = read_item(&tx, &self.table_name, &id)?.unwrap_or_default();
        stored.merge(item);

        tx.execute(
            r#"
            INSERT INTO records (table_name, id, attributes, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(table_name, id) DO UPDATE SET
                attributes = excluded.attributes,
                updated_at = excluded.updated_at
            "#,
            params![
                self.table_name,
                id,
                serde_json::to_string(&stored)?,
                chrono::Utc::now().timestamp(),
            ],
        )?;
        tx.commit()?;

        Ok(stored)
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            table_name TEXT NOT NULL,
            id TEXT NOT NULL,
            attributes TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (table_name, id)
        );
        "#,
    )?;

    debug!("Record store schema initialized");
    Ok(())
}

fn read_item(
    conn: &Connection,
    table_name: &str,
    id: &str,
) -> Result<Option<RecordItem>, StoreError> {
    let attributes: Option<String> = conn
        .query_row(
            "SELECT attributes FROM records WHERE table_name = ?1 AND id = ?2",
            params![table_name, id],
            |row| row.get(0),
        )
        .optional()?;

    attributes
        .map(|json| serde_json::from_str::<RecordItem>(&json))
        .transpose()
        .map_err(Into::into)
}

#[async_trait]
impl RecordTable for SqliteTable {
    async fn get(&self, id: &str) -> Result<Option<RecordItem>, StoreError> {
        self.get_blocking(id)
    }

    async fn update(&self, item: RecordItem) -> Result<RecordItem, StoreError> {
        self.update_blocking(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(volume_id: &str, snapshot_id: Option<&str>) -> RecordItem {
        let mut item = RecordItem::new();
        item.set("id", "0");
        item.set("volumeId", volume_id);
        item.set("device", "/dev/xvdf");
        if let Some(snapshot_id) = snapshot_id {
            item.set("snapshotId", snapshot_id);
        }
        item
    }

    #[tokio::test]
    async fn test_get_missing_item() {
        let table = SqliteTable::open_in_memory("master-volume").unwrap();
        assert!(table.get("0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_merges_attributes() {
        let table = SqliteTable::open_in_memory("master-volume").unwrap();

        table
            .update(item("vol-049df61146c4d7901", Some("snap-066877671789bd71b")))
            .await
            .unwrap();
        let stored = table
            .update(item("vol-0bbbbbbbbbbbbbbbb", None))
            .await
            .unwrap();

        assert_eq!(stored.get("volumeId"), Some("vol-0bbbbbbbbbbbbbbbb"));
        assert_eq!(stored.get("snapshotId"), Some("snap-066877671789bd71b"));
        assert_eq!(table.get("0").await.unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn test_tables_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");

        let first = SqliteTable::open(&path, "fleet-a").unwrap();
        first
            .update(item("vol-049df61146c4d7901", None))
            .await
            .unwrap();

        let second = SqliteTable::open(&path, "fleet-b").unwrap();
        assert!(second.get("0").await.unwrap().is_none());
        assert_eq!(second.table_name(), "fleet-b");
    }

    #[tokio::test]
    async fn test_item_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");

        {
            let table = SqliteTable::open(&path, "master-volume").unwrap();
            table
                .update(item("vol-049df61146c4d7901", None))
                .await
                .unwrap();
        }

        let table = SqliteTable::open(&path, "master-volume").unwrap();
        let stored = table.get("0").await.unwrap().unwrap();
        assert_eq!(stored.get("volumeId"), Some("vol-049df61146c4d7901"));
    }

    #[tokio::test]
    async fn test_update_without_id_is_rejected() {
        let table = SqliteTable::open_in_memory("master-volume").unwrap();
        let err = table.update(RecordItem::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::Malformed { attribute: "id", .. }));
    }
}
