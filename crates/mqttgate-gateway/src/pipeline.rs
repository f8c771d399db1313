//! Per-message ingestion: route, parse, extract, store.
//!
//! Every failure here is logged and the message is dropped. Nothing is
//! propagated back to the connection that received it.

use chrono::Utc;
use mqttgate_core::schema::{self, FieldSkip};
use mqttgate_core::Error;
use mqttgate_storage::{DocumentStore, Granularity, MetadataRecord, SchemaStore, StoredDocument};
use serde_json::{json, Value};

/// Name of the time field on created collections.
pub const TIME_FIELD: &str = "timestamp";
/// Name of the metadata field on created collections.
pub const META_FIELD: &str = "metadata";

/// What happened to one message.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// A document was written.
    Stored {
        database: String,
        collection: String,
        fields: usize,
    },
    /// No schema claims the topic.
    Unrouted,
    /// The message was dropped.
    Rejected(Error),
}

impl IngestOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, IngestOutcome::Stored { .. })
    }
}

/// Routes messages through the schema registry into the document store.
#[derive(Clone)]
pub struct IngestPipeline {
    schemas: SchemaStore,
    documents: DocumentStore,
}

impl IngestPipeline {
    pub fn new(schemas: SchemaStore, documents: DocumentStore) -> Self {
        Self { schemas, documents }
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    pub fn schemas(&self) -> &SchemaStore {
        &self.schemas
    }

    /// Process one message.
    ///
    /// The schema set is reloaded on every call so edits made through the
    /// registry apply to the next message.
    pub fn ingest(&self, topic: &str, payload: &str) -> IngestOutcome {
        let schemas = match self.schemas.list() {
            Ok(schemas) => schemas,
            Err(e) => {
                tracing::error!(topic = %topic, "Failed to load schemas: {}", e);
                return IngestOutcome::Rejected(e.into());
            }
        };

        let Some(route) = schema::route(&schemas, topic) else {
            tracing::debug!(topic = %topic, "No schema matches topic, discarding");
            return IngestOutcome::Unrouted;
        };

        let parsed: Value = match serde_json::from_str(payload) {
            Ok(value @ Value::Object(_)) => value,
            Ok(other) => {
                let err = Error::Parse(format!("expected a JSON object, got {}", type_name(&other)));
                tracing::warn!(topic = %topic, "Discarding message: {}", err);
                return IngestOutcome::Rejected(err);
            }
            Err(e) => {
                let err = Error::from(e);
                tracing::warn!(topic = %topic, "Discarding message: {}", err);
                return IngestOutcome::Rejected(err);
            }
        };

        let extraction = schema::extract(&route, topic, &parsed);
        for (field, reason) in &extraction.skipped {
            match reason {
                FieldSkip::NoMapping => {
                    tracing::info!(topic = %topic, field = %field, "No path mapping found")
                }
                other => tracing::warn!(topic = %topic, field = %field, "Field skipped: {}", other),
            }
        }

        let database = route.database().to_string();
        let collection = extraction.collection_or(&route.device).to_string();

        if let Err(e) = self.documents.create_time_series_collection(
            &database,
            &collection,
            TIME_FIELD,
            META_FIELD,
            Granularity::Seconds,
        ) {
            tracing::error!(database = %database, collection = %collection, "Failed to create collection: {}", e);
        }

        let fields = extraction.fields.len();
        let document = StoredDocument::new(Utc::now(), extraction.fields)
            .with_metadata(json!({ "device": route.device, "topic": topic }));
        if let Err(e) = self.documents.insert(&database, &collection, &document) {
            tracing::error!(database = %database, collection = %collection, "Failed to store document: {}", e);
            return IngestOutcome::Rejected(e.into());
        }

        let record = MetadataRecord {
            collection: collection.clone(),
            database: database.clone(),
            schema: route.sub_schema.collection.clone(),
            schema_database: route.schema.database.clone(),
            device: route.device.clone(),
            topic: topic.to_string(),
            updated_at: document.timestamp,
        };
        if let Err(e) = self.documents.upsert_metadata(&record) {
            tracing::error!(collection = %collection, "Failed to update collection metadata: {}", e);
        }

        tracing::debug!(database = %database, collection = %collection, fields, "Stored document");
        IngestOutcome::Stored {
            database,
            collection,
            fields,
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqttgate_core::{Schema, SubSchema};

    fn pipeline() -> (tempfile::TempDir, IngestPipeline) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.redb");
        let pipeline = IngestPipeline::new(
            SchemaStore::open(&path).unwrap(),
            DocumentStore::open(&path).unwrap(),
        );
        (dir, pipeline)
    }

    #[test]
    fn test_unrouted_topic_is_discarded() {
        let (_dir, pipeline) = pipeline();
        assert_eq!(pipeline.ingest("nowhere/at/all", "{}"), IngestOutcome::Unrouted);
        assert!(pipeline.documents().list_databases().unwrap().is_empty());
    }

    #[test]
    fn test_non_object_payload_rejected() {
        let (_dir, pipeline) = pipeline();
        pipeline
            .schemas()
            .create(&Schema {
                database: "home".to_string(),
                sub_schemas: vec![SubSchema {
                    collection: "power".to_string(),
                    devices: vec!["kitchen".to_string()],
                    topics: vec!["home/kitchen/power".to_string()],
                    data_mapping: [("w".to_string(), "watts".to_string())].into(),
                    ..SubSchema::default()
                }],
            })
            .unwrap();

        let outcome = pipeline.ingest("home/kitchen/power", "[1, 2]");
        assert!(matches!(outcome, IngestOutcome::Rejected(Error::Parse(_))));

        let outcome = pipeline.ingest("home/kitchen/power", "{\"watts\": 1}");
        assert!(outcome.is_stored());
        let doc = pipeline.documents().last("kitchen", "kitchen").unwrap().unwrap();
        assert_eq!(doc.data, json!({ "w": 1 }).as_object().cloned().unwrap());
        assert_eq!(
            doc.metadata,
            Some(json!({ "device": "kitchen", "topic": "home/kitchen/power" }))
        );
    }
}
