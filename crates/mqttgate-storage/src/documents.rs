//! Time-bucketed document collections using redb.
//!
//! Collections are addressed by `(database, collection)`. Documents are kept
//! in one table keyed by `(database, collection, timestamp_micros, seq)` so a
//! range scan over the key is a time-ordered scan over one collection.
//! A collection descriptor records that the collection was created; writes
//! do not require one.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::get_or_open_db;
use crate::{Error, Result};

// key = (database, collection), value = CollectionInfo (JSON)
const COLLECTIONS_TABLE: TableDefinition<(&str, &str), &str> = TableDefinition::new("collections");

// key = (database, collection, timestamp_micros, seq), value = StoredDocument (JSON)
const DOCUMENTS_TABLE: TableDefinition<(&str, &str, i64, u64), &str> =
    TableDefinition::new("documents");

// key = collection name, value = MetadataRecord (JSON)
const METADATA_TABLE: TableDefinition<&str, &str> = TableDefinition::new("collection_metadata");

/// Bucket granularity hint of a time-series collection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    Seconds,
    Minutes,
    Hours,
}

/// Descriptor written when a collection is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionInfo {
    pub time_field: String,
    pub meta_field: String,
    #[serde(default)]
    pub granularity: Granularity,
    pub created_at: DateTime<Utc>,
}

/// One stored document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredDocument {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl StoredDocument {
    pub fn new(timestamp: DateTime<Utc>, data: Map<String, Value>) -> Self {
        Self {
            timestamp,
            metadata: None,
            data,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Descriptive record for a destination collection, upserted by
/// collection name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataRecord {
    pub collection: String,
    pub database: String,
    /// Collection label of the sub-schema that routed the message.
    pub schema: String,
    /// `database` field of the schema that routed the message.
    #[serde(default)]
    pub schema_database: String,
    pub device: String,
    pub topic: String,
    pub updated_at: DateTime<Utc>,
}

/// Document store for ingested data.
#[derive(Clone)]
pub struct DocumentStore {
    db: Arc<Database>,
    seq: Arc<AtomicU64>,
}

impl DocumentStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_db(get_or_open_db(path)?)
    }

    pub fn with_db(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(COLLECTIONS_TABLE)?;
            let _ = write_txn.open_table(DOCUMENTS_TABLE)?;
            let _ = write_txn.open_table(METADATA_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self {
            db,
            seq: Arc::new(AtomicU64::new(0)),
        })
    }

    // ========== Collections ==========

    pub fn collection_exists(&self, database: &str, collection: &str) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(COLLECTIONS_TABLE)?;
        let exists = table.get((database, collection))?.is_some();
        Ok(exists)
    }

    pub fn collection_info(&self, database: &str, collection: &str) -> Result<Option<CollectionInfo>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(COLLECTIONS_TABLE)?;
        match table.get((database, collection))? {
            Some(raw) => Ok(Some(serde_json::from_str(raw.value())?)),
            None => Ok(None),
        }
    }

    /// Create a time-series collection unless it already exists.
    ///
    /// Returns `true` when this call created it.
    pub fn create_time_series_collection(
        &self,
        database: &str,
        collection: &str,
        time_field: &str,
        meta_field: &str,
        granularity: Granularity,
    ) -> Result<bool> {
        if database.is_empty() || collection.is_empty() {
            return Err(Error::InvalidInput(
                "database and collection names must not be empty".to_string(),
            ));
        }
        let info = CollectionInfo {
            time_field: time_field.to_string(),
            meta_field: meta_field.to_string(),
            granularity,
            created_at: Utc::now(),
        };
        let raw = serde_json::to_string(&info)?;

        let write_txn = self.db.begin_write()?;
        let created = {
            let mut table = write_txn.open_table(COLLECTIONS_TABLE)?;
            let exists = table.get((database, collection))?.is_some();
            if !exists {
                table.insert((database, collection), raw.as_str())?;
            }
            !exists
        };
        write_txn.commit()?;

        if created {
            tracing::info!(database = %database, collection = %collection, "Created time-series collection");
        } else {
            tracing::debug!(database = %database, collection = %collection, "Collection already exists, skipping creation");
        }
        Ok(created)
    }

    /// Databases that own at least one collection, sorted.
    pub fn list_databases(&self) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(COLLECTIONS_TABLE)?;
        let mut names = BTreeSet::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            let (database, _) = key.value();
            names.insert(database.to_string());
        }
        Ok(names.into_iter().collect())
    }

    /// Collections of `database`, sorted.
    pub fn list_collections(&self, database: &str) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(COLLECTIONS_TABLE)?;
        let mut names = Vec::new();
        for entry in table.range((database, "")..)? {
            let (key, _) = entry?;
            let (db, collection) = key.value();
            if db != database {
                break;
            }
            names.push(collection.to_string());
        }
        if names.is_empty() {
            return Err(Error::NotFound(format!("database '{}'", database)));
        }
        Ok(names)
    }

    // ========== Documents ==========

    pub fn insert(&self, database: &str, collection: &str, doc: &StoredDocument) -> Result<()> {
        let raw = serde_json::to_string(doc)?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let key = (database, collection, doc.timestamp.timestamp_micros(), seq);

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(DOCUMENTS_TABLE)?;
            table.insert(key, raw.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Documents with `start <= timestamp < end`, oldest first.
    pub fn range(
        &self,
        database: &str,
        collection: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredDocument>> {
        if start >= end {
            return Err(Error::InvalidInput(
                "start must be before end".to_string(),
            ));
        }
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DOCUMENTS_TABLE)?;

        let start_key = (database, collection, start.timestamp_micros(), 0u64);
        let end_key = (database, collection, end.timestamp_micros(), 0u64);

        let mut docs = Vec::new();
        for entry in table.range(start_key..end_key)? {
            let (_key, value) = entry?;
            docs.push(serde_json::from_str(value.value())?);
        }
        Ok(docs)
    }

    /// Every document of the collection, oldest first.
    pub fn all(&self, database: &str, collection: &str) -> Result<Vec<StoredDocument>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DOCUMENTS_TABLE)?;

        let start_key = (database, collection, i64::MIN, 0u64);
        let end_key = (database, collection, i64::MAX, u64::MAX);

        let mut docs = Vec::new();
        for entry in table.range(start_key..=end_key)? {
            let (_key, value) = entry?;
            docs.push(serde_json::from_str(value.value())?);
        }
        Ok(docs)
    }

    /// Most recent document of the collection.
    pub fn last(&self, database: &str, collection: &str) -> Result<Option<StoredDocument>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DOCUMENTS_TABLE)?;

        let start_key = (database, collection, i64::MIN, 0u64);
        let end_key = (database, collection, i64::MAX, u64::MAX);

        let latest = table
            .range(start_key..=end_key)?
            .next_back()
            .map(|entry| -> Result<StoredDocument> {
                let (_key, value) = entry?;
                Ok(serde_json::from_str(value.value())?)
            })
            .transpose()?;
        Ok(latest)
    }

    // ========== Metadata ==========

    /// Insert or replace the record for `record.collection`.
    pub fn upsert_metadata(&self, record: &MetadataRecord) -> Result<()> {
        let raw = serde_json::to_string(record)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(METADATA_TABLE)?;
            table.insert(record.collection.as_str(), raw.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn metadata(&self, collection: &str) -> Result<Option<MetadataRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(METADATA_TABLE)?;
        match table.get(collection)? {
            Some(raw) => Ok(Some(serde_json::from_str(raw.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_metadata(&self) -> Result<Vec<MetadataRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(METADATA_TABLE)?;
        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_key, value) = entry?;
            records.push(serde_json::from_str(value.value())?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path().join("data.redb")).unwrap();
        (dir, store)
    }

    fn doc(ts: DateTime<Utc>, w: i64) -> StoredDocument {
        StoredDocument::new(ts, json!({ "w": w }).as_object().cloned().unwrap())
    }

    #[test]
    fn test_create_collection_is_idempotent() {
        let (_dir, store) = store();
        assert!(!store.collection_exists("kitchen", "kitchen").unwrap());

        let first = store
            .create_time_series_collection("kitchen", "kitchen", "timestamp", "metadata", Granularity::Seconds)
            .unwrap();
        let second = store
            .create_time_series_collection("kitchen", "kitchen", "timestamp", "metadata", Granularity::Seconds)
            .unwrap();
        assert!(first);
        assert!(!second);
        assert_eq!(store.list_collections("kitchen").unwrap(), vec!["kitchen"]);
        assert_eq!(store.list_databases().unwrap(), vec!["kitchen"]);
    }

    #[test]
    fn test_list_collections_scoped_to_database() {
        let (_dir, store) = store();
        for (db, coll) in [("a", "x"), ("a", "y"), ("ab", "z"), ("b", "x")] {
            store
                .create_time_series_collection(db, coll, "timestamp", "metadata", Granularity::Seconds)
                .unwrap();
        }
        assert_eq!(store.list_collections("a").unwrap(), vec!["x", "y"]);
        assert_eq!(store.list_databases().unwrap(), vec!["a", "ab", "b"]);
        assert!(matches!(store.list_collections("zz"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_range_is_half_open() {
        let (_dir, store) = store();
        let t0 = Utc::now();
        for i in 0..5 {
            store.insert("d", "c", &doc(t0 + Duration::seconds(i), i)).unwrap();
        }
        store.insert("d", "other", &doc(t0, 99)).unwrap();

        let docs = store.range("d", "c", t0, t0 + Duration::seconds(3)).unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].data["w"], json!(0));

        assert_eq!(store.all("d", "c").unwrap().len(), 5);
        assert_eq!(store.last("d", "c").unwrap().unwrap().data["w"], json!(4));
        assert!(store.last("d", "none").unwrap().is_none());
        assert!(store.range("d", "c", t0, t0).is_err());
    }

    #[test]
    fn test_same_timestamp_documents_kept() {
        let (_dir, store) = store();
        let t0 = Utc::now();
        store.insert("d", "c", &doc(t0, 1)).unwrap();
        store.insert("d", "c", &doc(t0, 2)).unwrap();
        assert_eq!(store.all("d", "c").unwrap().len(), 2);
    }

    #[test]
    fn test_metadata_upsert() {
        let (_dir, store) = store();
        let mut record = MetadataRecord {
            collection: "kitchen".into(),
            database: "kitchen".into(),
            schema: "readings".into(),
            schema_database: "home".into(),
            device: "kitchen".into(),
            topic: "home/kitchen/power".into(),
            updated_at: Utc::now(),
        };
        store.upsert_metadata(&record).unwrap();
        record.topic = "home/kitchen/energy".into();
        store.upsert_metadata(&record).unwrap();

        assert_eq!(store.list_metadata().unwrap().len(), 1);
        assert_eq!(store.metadata("kitchen").unwrap().unwrap().topic, "home/kitchen/energy");
    }
}
