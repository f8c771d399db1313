//! Named broker instances and their lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use mqttgate_core::{Error, InstanceConfig, Result};
use mqttgate_storage::InstanceConfigStore;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::connection::{Connection, ConnectionState};
use crate::queue::{MessageQueue, QueueStats};

/// Name and state of one registered instance.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InstanceStatus {
    pub name: String,
    pub state: ConnectionState,
}

#[derive(Default)]
struct Instances {
    by_name: HashMap<String, Arc<Connection>>,
    order: Vec<String>,
}

impl Instances {
    fn insert(&mut self, connection: Arc<Connection>) {
        self.order.push(connection.name().to_string());
        self.by_name.insert(connection.name().to_string(), connection);
    }

    fn remove(&mut self, name: &str) -> Option<Arc<Connection>> {
        self.order.retain(|n| n != name);
        self.by_name.remove(name)
    }
}

/// Registry of named instances.
///
/// Every instance shares the same configuration store and feeds the same
/// message queue.
pub struct InstanceRegistry {
    store: InstanceConfigStore,
    queue: MessageQueue,
    instances: RwLock<Instances>,
}

impl InstanceRegistry {
    /// Empty registry.
    pub fn new(store: InstanceConfigStore, queue: MessageQueue) -> Self {
        Self {
            store,
            queue,
            instances: RwLock::new(Instances::default()),
        }
    }

    /// Register every persisted instance without starting any of them.
    pub fn open(store: InstanceConfigStore, queue: MessageQueue) -> Result<Self> {
        let mut instances = Instances::default();
        for name in store.list()? {
            instances.insert(Arc::new(Connection::new(name, store.clone(), queue.clone())));
        }
        tracing::info!(count = instances.order.len(), "Loaded persisted instances");
        Ok(Self {
            store,
            queue,
            instances: RwLock::new(instances),
        })
    }

    /// Like [`open`](Self::open), then start every instance flagged
    /// `autostart`. Start failures are logged and leave the instance idle.
    pub async fn restore(store: InstanceConfigStore, queue: MessageQueue) -> Result<Self> {
        let registry = Self::open(store, queue)?;
        for connection in registry.connections().await {
            let autostart = match connection.config() {
                Ok(config) => config.autostart,
                Err(e) => {
                    tracing::warn!(instance = %connection.name(), "Unreadable configuration: {}", e);
                    continue;
                }
            };
            if autostart {
                if let Err(e) = connection.start().await {
                    tracing::warn!(instance = %connection.name(), "Autostart failed: {}", e);
                }
            }
        }
        Ok(registry)
    }

    async fn connections(&self) -> Vec<Arc<Connection>> {
        let instances = self.instances.read().await;
        instances
            .order
            .iter()
            .filter_map(|name| instances.by_name.get(name).cloned())
            .collect()
    }

    /// Register a new instance.
    ///
    /// With `config` the document is replaced by it, otherwise any stored
    /// document (or the template) is kept. The `autostart` flag is persisted
    /// and, when set, the instance is started right away. A failed start is
    /// returned but the instance stays registered.
    pub async fn create(
        &self,
        name: &str,
        config: Option<InstanceConfig>,
        autostart: bool,
    ) -> Result<Arc<Connection>> {
        if name.trim().is_empty() {
            return Err(Error::InvalidConfig("instance name is empty".to_string()));
        }

        let connection = {
            let mut instances = self.instances.write().await;
            if instances.by_name.contains_key(name) {
                return Err(Error::Conflict(format!("instance '{}' already exists", name)));
            }

            let mut doc = match config {
                Some(config) => config.to_document()?,
                None => self.store.load_or_init(name)?,
            };
            if let Some(obj) = doc.as_object_mut() {
                obj.insert("autostart".to_string(), Value::Bool(autostart));
            }
            InstanceConfig::from_document(&doc)?;
            self.store.save(name, &doc)?;

            let connection = Arc::new(Connection::new(name, self.store.clone(), self.queue.clone()));
            instances.insert(connection.clone());
            connection
        };
        tracing::info!(instance = %name, autostart, "Instance created");

        if autostart {
            connection.start().await?;
        }
        Ok(connection)
    }

    /// Unregister an instance and drop its persisted configuration.
    ///
    /// The instance must be stopped first; deleting one that is not idle, or
    /// that is in the middle of starting, is a `Conflict`. A start racing
    /// with a successful delete fails with `NotFound`.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let mut instances = self.instances.write().await;
        let connection = instances
            .by_name
            .get(name)
            .ok_or_else(|| not_found(name))?;
        connection.retire()?;
        instances.remove(name);
        self.store.delete(name)?;
        tracing::info!(instance = %name, "Instance deleted");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Arc<Connection>> {
        self.instances
            .read()
            .await
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))
    }

    /// Instance names in registration order.
    pub async fn list(&self) -> Vec<String> {
        self.instances.read().await.order.clone()
    }

    pub async fn status(&self) -> Vec<InstanceStatus> {
        self.connections()
            .await
            .into_iter()
            .map(|c| InstanceStatus {
                name: c.name().to_string(),
                state: c.state(),
            })
            .collect()
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.get(name).await?.start().await
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        self.get(name).await?.stop().await
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Stop every instance concurrently. Errors are logged.
    pub async fn stop_all(&self) {
        let connections = self.connections().await;
        let results = join_all(connections.iter().map(|c| c.stop())).await;
        for (connection, result) in connections.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(instance = %connection.name(), "Stop failed: {}", e);
            }
        }
    }

    pub async fn add_topic(&self, name: &str, filter: &str) -> Result<()> {
        self.get(name).await?.add_topic(filter).await
    }

    pub async fn delete_topic(&self, name: &str, filter: &str) -> Result<()> {
        self.get(name).await?.remove_topic(filter).await
    }

    pub async fn list_topics(&self, name: &str) -> Result<Vec<String>> {
        self.get(name).await?.topics()
    }

    pub async fn update_instance_config(&self, name: &str, path: &str, value: Value) -> Result<()> {
        self.get(name).await?.set_config_value(path, value).await
    }

    pub async fn get_config_value(&self, name: &str, path: &str) -> Result<Value> {
        self.get(name).await?.get_config_value(path)
    }
}

fn not_found(name: &str) -> Error {
    Error::NotFound(format!("instance '{}'", name))
}
