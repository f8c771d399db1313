//! Per-instance configuration documents.
//!
//! One JSON document per instance name with replace-whole-document
//! semantics. A missing document is initialised from the default template
//! on first read.

use std::path::Path;
use std::sync::Arc;

use mqttgate_core::InstanceConfig;
use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;

use crate::db::get_or_open_db;
use crate::Result;

// key = instance name, value = configuration document (JSON)
const INSTANCES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("instances");

/// Persistent store for instance configuration documents.
#[derive(Clone)]
pub struct InstanceConfigStore {
    db: Arc<Database>,
}

impl InstanceConfigStore {
    /// Open or create the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_db(get_or_open_db(path)?)
    }

    /// Use an already open database.
    pub fn with_db(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(INSTANCES_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Stored document, if any.
    pub fn load(&self, name: &str) -> Result<Option<Value>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(INSTANCES_TABLE)?;
        match table.get(name)? {
            Some(raw) => Ok(Some(serde_json::from_str(raw.value())?)),
            None => Ok(None),
        }
    }

    /// Stored document, or the default template persisted under `name`.
    pub fn load_or_init(&self, name: &str) -> Result<Value> {
        if let Some(doc) = self.load(name)? {
            return Ok(doc);
        }
        let template = InstanceConfig::template();
        self.save(name, &template)?;
        tracing::info!(instance = %name, "Created default instance configuration");
        Ok(template)
    }

    /// Replace the whole document.
    pub fn save(&self, name: &str, doc: &Value) -> Result<()> {
        let raw = serde_json::to_string(doc)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(INSTANCES_TABLE)?;
            table.insert(name, raw.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remove the document. Returns whether it existed.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(INSTANCES_TABLE)?;
            let removed = table.remove(name)?;
            removed.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// All stored instance names, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(INSTANCES_TABLE)?;
        let mut names = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            names.push(key.value().to_string());
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, InstanceConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceConfigStore::open(dir.path().join("config.redb")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_missing_document_gets_template() {
        let (_dir, store) = store();
        assert!(store.load("a").unwrap().is_none());

        let doc = store.load_or_init("a").unwrap();
        assert_eq!(doc["port"], json!(1883));
        assert_eq!(store.load("a").unwrap(), Some(doc));
        assert_eq!(store.list().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_save_replaces_document() {
        let (_dir, store) = store();
        store.save("a", &json!({ "broker_address": "one" })).unwrap();
        store.save("a", &json!({ "port": 1884 })).unwrap();
        assert_eq!(store.load("a").unwrap(), Some(json!({ "port": 1884 })));
    }

    #[test]
    fn test_delete() {
        let (_dir, store) = store();
        store.load_or_init("a").unwrap();
        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert!(store.list().unwrap().is_empty());
    }
}
