//! Stores sharing one database file.
//!
//! The schema and document stores live in the same redb file in production;
//! these tests open both through the shared handle cache.

use chrono::Utc;
use mqttgate_core::{Schema, SubSchema};
use mqttgate_storage::{DocumentStore, Error, Granularity, SchemaStore, StoredDocument};
use serde_json::json;

#[test]
fn test_schema_and_document_stores_share_file() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("data.redb");

    let schemas = SchemaStore::open(&path).expect("Failed to open schema store");
    let documents = DocumentStore::open(&path).expect("Failed to open document store");

    schemas
        .create(&Schema {
            database: "home".to_string(),
            sub_schemas: vec![SubSchema {
                collection: "power".to_string(),
                devices: vec!["kitchen".to_string()],
                topics: vec!["home/+/power".to_string()],
                ..SubSchema::default()
            }],
        })
        .expect("Failed to create schema");

    documents
        .create_time_series_collection("kitchen", "kitchen", "timestamp", "metadata", Granularity::Seconds)
        .expect("Failed to create collection");
    let doc = StoredDocument::new(Utc::now(), json!({ "w": 120 }).as_object().cloned().unwrap());
    documents.insert("kitchen", "kitchen", &doc).expect("Failed to insert");

    assert_eq!(schemas.list().expect("Failed to list").len(), 1);
    let last = documents.query_last("kitchen", "kitchen").expect("Failed to query");
    assert_eq!(last.data["w"], json!(120));
}

#[test]
fn test_reopen_sees_persisted_documents() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("data.redb");

    {
        let documents = DocumentStore::open(&path).expect("Failed to open");
        let doc = StoredDocument::new(Utc::now(), json!({ "v": 1 }).as_object().cloned().unwrap());
        documents.insert("db", "c", &doc).expect("Failed to insert");
    }
    mqttgate_storage::db::close_db(&path);

    let documents = DocumentStore::open(&path).expect("Failed to reopen");
    assert_eq!(documents.all("db", "c").expect("Failed to read").len(), 1);
}

#[test]
fn test_second_handle_reports_locked_file() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("data.redb");

    let _held = SchemaStore::open(&path).expect("Failed to open");
    // Forget the cached handle so the next open behaves like another process
    mqttgate_storage::db::close_db(&path);

    let err = SchemaStore::open(&path).err().expect("second open must fail");
    assert!(matches!(err, Error::Locked(_)));
    assert!(err.to_string().contains("gateway is running"));

    let core: mqttgate_core::Error = err.into();
    assert_eq!(core.kind(), "conflict");
}
