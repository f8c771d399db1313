//! MQTT side of the gateway.
//!
//! Broker connections feed a single message queue; one worker drains it
//! through the ingestion pipeline into the document store.

pub mod connection;
pub mod control;
pub mod periodic;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod service;
pub mod tls;

pub use connection::{Connection, ConnectionState, RECENT_CAPACITY};
#[cfg(unix)]
pub use control::{ControlClient, ControlServer};
pub use control::{ControlHandler, ControlRequest, ControlResponse};
pub use pipeline::{IngestOutcome, IngestPipeline};
pub use queue::{message_queue, spawn_ingest_worker, InboundMessage, MessageQueue, MessageReceiver, QueueStats};
pub use registry::{InstanceRegistry, InstanceStatus};
pub use service::Gateway;
