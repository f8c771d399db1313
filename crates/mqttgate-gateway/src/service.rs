//! Wires stores, queue, worker, registry and the control socket into a
//! running gateway.

use std::sync::Arc;

use mqttgate_core::{GatewaySettings, Result};
use mqttgate_storage::{DocumentStore, InstanceConfigStore, SchemaStore};
use tokio::task::JoinHandle;

#[cfg(unix)]
use crate::control::{ControlHandler, ControlServer};
use crate::pipeline::IngestPipeline;
use crate::queue::{message_queue, spawn_ingest_worker};
use crate::registry::InstanceRegistry;

/// A running gateway.
pub struct Gateway {
    registry: Arc<InstanceRegistry>,
    pipeline: IngestPipeline,
    worker: JoinHandle<u64>,
    #[cfg(unix)]
    control: ControlServer,
}

impl Gateway {
    /// Open the stores, start the ingestion worker, restore persisted
    /// instances and open the control socket.
    pub async fn start(settings: &GatewaySettings) -> Result<Self> {
        let config_store = InstanceConfigStore::open(settings.config_db_path())?;
        let data_path = settings.data_db_path();
        let pipeline = IngestPipeline::new(
            SchemaStore::open(&data_path)?,
            DocumentStore::open(&data_path)?,
        );

        let (queue, receiver) = message_queue();
        let worker = spawn_ingest_worker(pipeline.clone(), receiver);
        let registry = Arc::new(InstanceRegistry::restore(config_store, queue).await?);

        #[cfg(unix)]
        let control = match ControlServer::bind(
            &settings.control_socket_path(),
            Arc::new(ControlHandler::live(registry.clone(), pipeline.clone())),
        ) {
            Ok(control) => control,
            Err(e) => {
                registry.stop_all().await;
                return Err(e);
            }
        };

        tracing::info!(data_dir = %settings.data_dir.display(), "Gateway started");
        Ok(Self {
            registry,
            pipeline,
            worker,
            #[cfg(unix)]
            control,
        })
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn pipeline(&self) -> &IngestPipeline {
        &self.pipeline
    }

    /// Close the control socket, stop every instance, then let the worker
    /// drain the queue.
    pub async fn shutdown(self) -> u64 {
        #[cfg(unix)]
        self.control.shutdown().await;
        self.registry.stop_all().await;
        let stats = self.registry.queue_stats();
        // The control handler held the other reference; dropping this one
        // closes the queue.
        drop(self.registry);
        let consumed = self.worker.await.unwrap_or(0);
        tracing::info!(consumed, enqueued = stats.enqueued, "Gateway stopped");
        consumed
    }
}
