use crate::document::primary_key;
use crate::error::{CacheError, Result};
use crate::query::{self, Filter, FindOptions};
use crate::system_db::{PartitionMeta, SystemDb};
use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// File name of the database inside the cache directory.
pub const DB_FILE: &str = "cache.db";

/// On-disk document store backing the cache.
///
/// Documents live in named collections, each split into partitions that are
/// replaced atomically as a whole. Writes go through one connection and
/// reads through another; with WAL journaling a reader always sees the last
/// committed snapshot, never a half-written partition.
pub struct DocumentStore {
    root: PathBuf,
    writer: Mutex<SystemDb>,
    reader: Mutex<SystemDb>,
}

impl DocumentStore {
    /// Open (or create) the store in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let root = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| {
            CacheError::Storage(format!(
                "cannot create cache directory {}: {e}",
                root.display()
            ))
        })?;

        let db_path = root.join(DB_FILE);
        let writer = SystemDb::open(&db_path).map_err(|e| match e {
            CacheError::Sqlite(inner) => CacheError::Storage(format!(
                "cannot open {}: {inner}",
                db_path.display()
            )),
            other => other,
        })?;
        let reader = SystemDb::open_reader(&db_path)?;
        log::debug!("Opened document store at {}", root.display());

        Ok(DocumentStore {
            root,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Replace the content of one partition of a collection.
    ///
    /// Everything happens in one transaction: the old rows are removed, the
    /// new documents are inserted in order and the partition metadata is
    /// stamped with the current time. On any failure nothing changes.
    pub fn replace_collection(
        &self,
        name: &str,
        partition: &str,
        documents: &[Value],
    ) -> Result<PartitionMeta> {
        let ids = document_ids(name, documents)?;
        // Stored with microsecond precision
        let refreshed = Utc::now().trunc_subsecs(6);

        let writer = self.writer.lock();
        writer.in_transaction(|db| {
            let removed = db.delete_partition(name, partition)?;
            for (id, doc) in ids.iter().zip(documents) {
                db.insert_document(name, partition, id, doc)
                    .map_err(|e| CacheError::Storage(format!(
                        "failed to store {name} document '{id}': {e}"
                    )))?;
            }
            db.set_partition_meta(name, partition, refreshed, documents.len())?;
            log::debug!(
                "Replaced {name}[{partition}]: {removed} removed, {} inserted",
                documents.len()
            );
            Ok(())
        })?;

        Ok(PartitionMeta {
            collection: name.to_string(),
            partition: partition.to_string(),
            last_refreshed: refreshed,
            document_count: documents.len(),
            invalidated: false,
        })
    }

    /// Mark one partition, or every partition of a collection, as needing a
    /// refresh. Returns how many partitions were flagged.
    pub fn invalidate(&self, name: &str, partition: Option<&str>) -> Result<usize> {
        self.writer.lock().mark_invalidated(name, partition)
    }

    /// Run a find against a collection. A collection that was never stored
    /// behaves as empty.
    pub fn query(&self, name: &str, options: &FindOptions) -> Result<Vec<Value>> {
        let docs = self.load_all(name)?;
        Ok(query::execute(docs, options))
    }

    /// Primary-key lookup.
    pub fn find_by_id(&self, name: &str, id: &str) -> Result<Option<Value>> {
        let record = self.reader.lock().get_document(name, id)?;
        record.map(|r| r.parse_data()).transpose()
    }

    pub fn count(&self, name: &str, filter: &Filter) -> Result<usize> {
        let docs = self.load_all(name)?;
        Ok(query::count(&docs, filter))
    }

    /// Whether the collection has been stored at least once (possibly empty).
    pub fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(!self.reader.lock().list_partition_meta(Some(name))?.is_empty())
    }

    /// Most recent refresh of any partition of the collection.
    pub fn last_modified(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        let metas = self.reader.lock().list_partition_meta(Some(name))?;
        Ok(metas.into_iter().map(|m| m.last_refreshed).max())
    }

    pub fn partitions(&self, name: &str) -> Result<Vec<PartitionMeta>> {
        self.reader.lock().list_partition_meta(Some(name))
    }

    pub fn partition_meta(&self, name: &str, partition: &str) -> Result<Option<PartitionMeta>> {
        self.reader.lock().get_partition_meta(name, partition)
    }

    /// Metadata of every stored partition.
    pub fn all_partitions(&self) -> Result<Vec<PartitionMeta>> {
        self.reader.lock().list_partition_meta(None)
    }

    /// Handle bound to one collection.
    pub fn collection(&self, name: &str) -> CollectionRef<'_> {
        CollectionRef {
            store: self,
            name: name.to_string(),
        }
    }

    /// Checkpoint the journal and close both connections.
    pub fn close(self) -> Result<()> {
        let writer = self.writer.into_inner();
        let reader = self.reader.into_inner();
        reader.close()?;
        writer.checkpoint()?;
        writer.close()?;
        log::debug!("Closed document store at {}", self.root.display());
        Ok(())
    }

    // Single SELECT, so the rows come from one committed snapshot.
    fn load_all(&self, name: &str) -> Result<Vec<Value>> {
        let records = self.reader.lock().list_documents(name)?;
        records.iter().map(|r| r.parse_data()).collect()
    }
}

fn document_ids(name: &str, documents: &[Value]) -> Result<Vec<String>> {
    let mut seen = HashSet::with_capacity(documents.len());
    let mut ids = Vec::with_capacity(documents.len());
    for (index, doc) in documents.iter().enumerate() {
        if !doc.is_object() {
            return Err(CacheError::Storage(format!(
                "{name} document #{index} is not an object"
            )));
        }
        let id = primary_key(doc).ok_or_else(|| {
            CacheError::Storage(format!("{name} document #{index} has no usable 'id'"))
        })?;
        if !seen.insert(id.clone()) {
            return Err(CacheError::Storage(format!(
                "duplicate id '{id}' in {name}"
            )));
        }
        ids.push(id);
    }
    Ok(ids)
}

/// A handle to a collection within a store.
pub struct CollectionRef<'a> {
    store: &'a DocumentStore,
    name: String,
}

impl<'a> CollectionRef<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn find(&self, options: &FindOptions) -> Result<Vec<Value>> {
        self.store.query(&self.name, options)
    }

    pub fn get(&self, id: &str) -> Result<Option<Value>> {
        self.store.find_by_id(&self.name, id)
    }

    pub fn count(&self, filter: &Filter) -> Result<usize> {
        self.store.count(&self.name, filter)
    }

    pub fn exists(&self) -> Result<bool> {
        self.store.collection_exists(&self.name)
    }

    pub fn last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        self.store.last_modified(&self.name)
    }

    pub fn replace(&self, partition: &str, documents: &[Value]) -> Result<PartitionMeta> {
        self.store.replace_collection(&self.name, partition, documents)
    }
}
