//! Persistence for the ingestion gateway, backed by redb.
//!
//! - [`InstanceConfigStore`]: per-instance configuration documents
//! - [`SchemaStore`]: schema registry documents
//! - [`DocumentStore`]: time-bucketed collections, metadata records and
//!   read-side queries

pub mod config_store;
pub mod db;
pub mod documents;
pub mod error;
pub mod query;
pub mod schema_store;

pub use config_store::InstanceConfigStore;
pub use documents::{CollectionInfo, DocumentStore, Granularity, MetadataRecord, StoredDocument};
pub use error::{Error, Result};
pub use query::DataPoint;
pub use schema_store::SchemaStore;
