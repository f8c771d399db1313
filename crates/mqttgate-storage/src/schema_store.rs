//! Schema documents keyed by database name.

use std::path::Path;
use std::sync::Arc;

use mqttgate_core::Schema;
use redb::{Database, ReadableTable, TableDefinition};

use crate::db::get_or_open_db;
use crate::{Error, Result};

// key = database name, value = Schema (JSON)
const SCHEMAS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("schemas");

/// Persistent schema registry.
#[derive(Clone)]
pub struct SchemaStore {
    db: Arc<Database>,
}

impl SchemaStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_db(get_or_open_db(path)?)
    }

    pub fn with_db(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SCHEMAS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Insert a new schema. Fails if one exists for the same database.
    pub fn create(&self, schema: &Schema) -> Result<()> {
        if schema.database.is_empty() {
            return Err(Error::InvalidInput("schema database name is empty".to_string()));
        }
        let raw = serde_json::to_string(schema)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SCHEMAS_TABLE)?;
            if table.get(schema.database.as_str())?.is_some() {
                return Err(Error::AlreadyExists(format!(
                    "schema for database '{}'",
                    schema.database
                )));
            }
            table.insert(schema.database.as_str(), raw.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get(&self, database: &str) -> Result<Schema> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SCHEMAS_TABLE)?;
        match table.get(database)? {
            Some(raw) => Ok(serde_json::from_str(raw.value())?),
            None => Err(Error::NotFound(format!("schema for database '{}'", database))),
        }
    }

    /// Replace an existing schema.
    pub fn update(&self, schema: &Schema) -> Result<()> {
        let raw = serde_json::to_string(schema)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SCHEMAS_TABLE)?;
            if table.get(schema.database.as_str())?.is_none() {
                return Err(Error::NotFound(format!(
                    "schema for database '{}'",
                    schema.database
                )));
            }
            table.insert(schema.database.as_str(), raw.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn delete(&self, database: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(SCHEMAS_TABLE)?;
            let removed = table.remove(database)?;
            removed.is_some()
        };
        write_txn.commit()?;
        if existed {
            Ok(())
        } else {
            Err(Error::NotFound(format!("schema for database '{}'", database)))
        }
    }

    /// Snapshot of every schema, ordered by database name.
    ///
    /// Entries that no longer deserialize are logged and left out.
    pub fn list(&self) -> Result<Vec<Schema>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SCHEMAS_TABLE)?;
        let mut schemas = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            match serde_json::from_str::<Schema>(value.value()) {
                Ok(schema) => schemas.push(schema),
                Err(e) => tracing::warn!(database = %key.value(), "Skipping unreadable schema: {}", e),
            }
        }
        Ok(schemas)
    }
}
