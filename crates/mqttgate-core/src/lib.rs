//! Core domain types for the MQTT ingestion gateway.
//!
//! Everything here is pure: path expressions, topic filters, schema routing
//! and field extraction, and the instance configuration model. Storage and
//! networking live in `mqttgate-storage` and `mqttgate-gateway`.

pub mod error;
pub mod instance;
pub mod path;
pub mod schema;
pub mod settings;
pub mod topic;

pub use error::{Error, Result};
pub use instance::{ConnectionSettings, InstanceConfig, PeriodicPublish};
pub use path::{PathError, PathExpr, PathToken};
pub use schema::{Extraction, FieldRule, FieldSkip, NamingRule, Route, Schema, SubSchema};
pub use settings::GatewaySettings;
pub use topic::TopicMatch;
