use crate::error::{CacheError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// On-disk layout version stored in `PRAGMA user_version`.
pub const FORMAT_VERSION: i64 = 1;

/// One SQLite connection to the cache database.
pub struct SystemDb {
    conn: Connection,
}

impl SystemDb {
    /// Open the read-write connection, creating tables on first use.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            log::warn!("Cache database at {} is not in WAL mode ({mode})", path.display());
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let db = SystemDb { conn };
        db.check_version()?;
        db.initialize_tables()?;
        Ok(db)
    }

    /// Open a read-only connection to a database created by [`SystemDb::open`].
    pub fn open_reader(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(SystemDb { conn })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = SystemDb { conn };
        db.initialize_tables()?;
        Ok(db)
    }

    fn check_version(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > FORMAT_VERSION {
            return Err(CacheError::Storage(format!(
                "cache database is locked by an incompatible version (format {version}, expected {FORMAT_VERSION})"
            )));
        }
        Ok(())
    }

    fn initialize_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                partition TEXT NOT NULL,
                id TEXT NOT NULL,
                data_json TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );

            CREATE INDEX IF NOT EXISTS idx_documents_partition ON documents(collection, partition);

            CREATE TABLE IF NOT EXISTS collection_meta (
                collection TEXT NOT NULL,
                partition TEXT NOT NULL,
                last_refreshed TEXT NOT NULL,
                document_count INTEGER NOT NULL,
                invalidated INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (collection, partition)
            );
            ",
        )?;
        self.conn
            .pragma_update(None, "user_version", FORMAT_VERSION)?;
        Ok(())
    }

    // ── Documents ────────────────────────────────────────────────────

    /// Insert one document row. Fails if the id already exists in the collection.
    pub fn insert_document(
        &self,
        collection: &str,
        partition: &str,
        id: &str,
        data: &serde_json::Value,
    ) -> Result<()> {
        let data_json = serde_json::to_string(data)?;
        self.conn.execute(
            "INSERT INTO documents (collection, partition, id, data_json) VALUES (?1, ?2, ?3, ?4)",
            params![collection, partition, id, data_json],
        )?;
        Ok(())
    }

    /// Get a document by collection and id.
    pub fn get_document(&self, collection: &str, id: &str) -> Result<Option<DocumentRecord>> {
        let result = self
            .conn
            .query_row(
                "SELECT collection, partition, id, data_json FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                DocumentRecord::from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// All documents of a collection in insertion order, in one statement.
    pub fn list_documents(&self, collection: &str) -> Result<Vec<DocumentRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT collection, partition, id, data_json FROM documents WHERE collection = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![collection], DocumentRecord::from_row)?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(row?);
        }
        Ok(docs)
    }

    /// Delete every document of one partition.
    pub fn delete_partition(&self, collection: &str, partition: &str) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM documents WHERE collection = ?1 AND partition = ?2",
            params![collection, partition],
        )?;
        Ok(removed)
    }

    // ── Metadata ─────────────────────────────────────────────────────

    pub fn set_partition_meta(
        &self,
        collection: &str,
        partition: &str,
        last_refreshed: DateTime<Utc>,
        document_count: usize,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO collection_meta (collection, partition, last_refreshed, document_count, invalidated)
             VALUES (?1, ?2, ?3, ?4, 0)
             ON CONFLICT(collection, partition) DO UPDATE SET
                last_refreshed = excluded.last_refreshed,
                document_count = excluded.document_count,
                invalidated = 0",
            params![
                collection,
                partition,
                last_refreshed.to_rfc3339_opts(SecondsFormat::Micros, true),
                document_count as i64
            ],
        )?;
        Ok(())
    }

    pub fn get_partition_meta(
        &self,
        collection: &str,
        partition: &str,
    ) -> Result<Option<PartitionMeta>> {
        let raw = self
            .conn
            .query_row(
                "SELECT collection, partition, last_refreshed, document_count, invalidated FROM collection_meta
                 WHERE collection = ?1 AND partition = ?2",
                params![collection, partition],
                RawMeta::from_row,
            )
            .optional()?;
        raw.map(RawMeta::parse).transpose()
    }

    /// Metadata rows, for one collection or for all of them.
    pub fn list_partition_meta(&self, collection: Option<&str>) -> Result<Vec<PartitionMeta>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT collection, partition, last_refreshed, document_count, invalidated FROM collection_meta
             WHERE ?1 IS NULL OR collection = ?1
             ORDER BY collection, partition",
        )?;
        let rows = stmt.query_map(params![collection], RawMeta::from_row)?;

        let mut metas = Vec::new();
        for row in rows {
            metas.push(row?.parse()?);
        }
        Ok(metas)
    }

    /// Flag partitions as needing a refresh; `None` flags every partition of
    /// the collection. Content and timestamps are kept.
    pub fn mark_invalidated(&self, collection: &str, partition: Option<&str>) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE collection_meta SET invalidated = 1
             WHERE collection = ?1 AND (?2 IS NULL OR partition = ?2)",
            params![collection, partition],
        )?;
        Ok(changed)
    }

    // ── Transaction Support ──────────────────────────────────────────

    pub fn begin_transaction(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE TRANSACTION")?;
        Ok(())
    }

    pub fn commit_transaction(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback_transaction(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Run `f` inside a transaction, rolling back if it fails.
    pub fn in_transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.begin_transaction()?;
        match f(self) {
            Ok(value) => {
                if let Err(e) = self.commit_transaction() {
                    let _ = self.rollback_transaction();
                    return Err(e);
                }
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.rollback_transaction() {
                    log::warn!("Rollback failed after error '{e}': {rollback}");
                }
                Err(e)
            }
        }
    }

    /// Fold the write-ahead log back into the main database file.
    pub fn checkpoint(&self) -> Result<()> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| CacheError::Sqlite(e))
    }
}

/// A row from the documents table.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub collection: String,
    pub partition: String,
    pub id: String,
    pub data_json: String,
}

impl DocumentRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(DocumentRecord {
            collection: row.get(0)?,
            partition: row.get(1)?,
            id: row.get(2)?,
            data_json: row.get(3)?,
        })
    }

    pub fn parse_data(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.data_json)?)
    }
}

/// Freshness record of one partition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionMeta {
    pub collection: String,
    pub partition: String,
    pub last_refreshed: DateTime<Utc>,
    pub document_count: usize,
    /// Set by an explicit invalidation, cleared by the next refresh.
    pub invalidated: bool,
}

struct RawMeta {
    collection: String,
    partition: String,
    last_refreshed: String,
    document_count: i64,
    invalidated: bool,
}

impl RawMeta {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawMeta {
            collection: row.get(0)?,
            partition: row.get(1)?,
            last_refreshed: row.get(2)?,
            document_count: row.get(3)?,
            invalidated: row.get(4)?,
        })
    }

    fn parse(self) -> Result<PartitionMeta> {
        let last_refreshed = DateTime::parse_from_rfc3339(&self.last_refreshed)
            .map_err(|e| {
                CacheError::Storage(format!(
                    "bad timestamp '{}' for {}: {e}",
                    self.last_refreshed, self.collection
                ))
            })?
            .with_timezone(&Utc);
        Ok(PartitionMeta {
            collection: self.collection,
            partition: self.partition,
            last_refreshed,
            document_count: self.document_count.max(0) as usize,
            invalidated: self.invalidated,
        })
    }
}
