//! Local administration channel.
//!
//! `serve` listens on a Unix socket next to the databases. A client writes
//! one JSON request per line and reads one JSON response line back. Requests
//! run against the live registry and stores, so schema edits, topic changes
//! and periodic toggles reach the running gateway. Without a running
//! gateway the same requests are executed in-process by a
//! [`ControlHandler`] over freshly opened stores.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mqttgate_core::{Error, InstanceConfig, Result, Schema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pipeline::IngestPipeline;
use crate::registry::InstanceRegistry;

/// One administrative operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    InstanceCreate {
        name: String,
        #[serde(default)]
        config: Option<InstanceConfig>,
        #[serde(default)]
        autostart: bool,
    },
    InstanceDelete {
        name: String,
    },
    InstanceList,
    InstanceStatus,
    InstanceShow {
        name: String,
    },
    InstanceStart {
        name: String,
    },
    InstanceStop {
        name: String,
    },
    ConfigGet {
        name: String,
        path: String,
    },
    ConfigSet {
        name: String,
        path: String,
        value: Value,
    },
    TopicAdd {
        name: String,
        filter: String,
    },
    TopicRemove {
        name: String,
        filter: String,
    },
    TopicList {
        name: String,
    },
    RecentMessages {
        name: String,
    },
    Publish {
        name: String,
        topic: String,
        payload: String,
    },
    QueueStats,
    SchemaCreate {
        schema: Schema,
    },
    SchemaGet {
        database: String,
    },
    SchemaUpdate {
        schema: Schema,
    },
    SchemaDelete {
        database: String,
    },
    SchemaList,
    QueryRange {
        database: String,
        collection: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        #[serde(default)]
        period: Option<i64>,
    },
    QueryAll {
        database: String,
        collection: String,
    },
    QueryLast {
        database: String,
        collection: String,
    },
    QueryLastPeriod {
        database: String,
        collection: String,
        period: i64,
    },
    Databases,
    Collections {
        database: String,
    },
    Metadata {
        #[serde(default)]
        collection: Option<String>,
    },
}

/// Wire form of an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlError {
    pub kind: String,
    pub message: String,
}

/// Wire form of a result. Exactly one of `result` and `error` is meaningful.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlResponse {
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlError>,
}

impl ControlResponse {
    pub fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(result) => Self {
                result,
                error: None,
            },
            Err(e) => Self {
                result: Value::Null,
                error: Some(ControlError {
                    kind: e.kind().to_string(),
                    message: e.message().to_string(),
                }),
            },
        }
    }

    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(error) => Err(Error::from_kind(&error.kind, error.message)),
            None => Ok(self.result),
        }
    }
}

/// Executes [`ControlRequest`]s against a registry and the data stores.
pub struct ControlHandler {
    registry: Arc<InstanceRegistry>,
    pipeline: IngestPipeline,
    live: bool,
}

impl ControlHandler {
    /// Handler inside a running gateway. Instances can be started, stopped
    /// and published through.
    pub fn live(registry: Arc<InstanceRegistry>, pipeline: IngestPipeline) -> Self {
        Self {
            registry,
            pipeline,
            live: true,
        }
    }

    /// Handler over persisted state only. Operations that need a broker
    /// connection fail with `Transport`; `autostart` is recorded but not
    /// acted on.
    pub fn offline(registry: Arc<InstanceRegistry>, pipeline: IngestPipeline) -> Self {
        Self {
            registry,
            pipeline,
            live: false,
        }
    }

    fn require_live(&self) -> Result<()> {
        if self.live {
            Ok(())
        } else {
            Err(Error::Transport(
                "the gateway is not running; start it with `mqttgate serve`".to_string(),
            ))
        }
    }

    pub async fn handle(&self, request: ControlRequest) -> Result<Value> {
        let registry = &self.registry;
        let schemas = self.pipeline.schemas();
        let documents = self.pipeline.documents();

        match request {
            ControlRequest::InstanceCreate {
                name,
                config,
                autostart,
            } => {
                if let Some(config) = &config {
                    config.validate()?;
                }
                if self.live {
                    registry.create(&name, config, autostart).await?;
                } else {
                    registry.create(&name, config, false).await?;
                    if autostart {
                        registry
                            .update_instance_config(&name, "autostart", Value::Bool(true))
                            .await?;
                    }
                }
                Ok(Value::Null)
            }
            ControlRequest::InstanceDelete { name } => {
                registry.delete(&name).await?;
                Ok(Value::Null)
            }
            ControlRequest::InstanceList => to_value(registry.list().await),
            ControlRequest::InstanceStatus => to_value(registry.status().await),
            ControlRequest::InstanceShow { name } => registry.get(&name).await?.document(),
            ControlRequest::InstanceStart { name } => {
                self.require_live()?;
                registry.start(&name).await?;
                Ok(Value::Null)
            }
            ControlRequest::InstanceStop { name } => {
                self.require_live()?;
                registry.stop(&name).await?;
                Ok(Value::Null)
            }
            ControlRequest::ConfigGet { name, path } => registry.get_config_value(&name, &path).await,
            ControlRequest::ConfigSet { name, path, value } => {
                registry.update_instance_config(&name, &path, value).await?;
                Ok(Value::Null)
            }
            ControlRequest::TopicAdd { name, filter } => {
                registry.add_topic(&name, &filter).await?;
                Ok(Value::Null)
            }
            ControlRequest::TopicRemove { name, filter } => {
                registry.delete_topic(&name, &filter).await?;
                Ok(Value::Null)
            }
            ControlRequest::TopicList { name } => to_value(registry.list_topics(&name).await?),
            ControlRequest::RecentMessages { name } => {
                to_value(registry.get(&name).await?.recent_messages())
            }
            ControlRequest::Publish {
                name,
                topic,
                payload,
            } => {
                self.require_live()?;
                registry.get(&name).await?.publish(&topic, payload).await?;
                Ok(Value::Null)
            }
            ControlRequest::QueueStats => to_value(registry.queue_stats()),
            ControlRequest::SchemaCreate { schema } => {
                schemas.create(&schema)?;
                Ok(Value::Null)
            }
            ControlRequest::SchemaGet { database } => to_value(schemas.get(&database)?),
            ControlRequest::SchemaUpdate { schema } => {
                schemas.update(&schema)?;
                Ok(Value::Null)
            }
            ControlRequest::SchemaDelete { database } => {
                schemas.delete(&database)?;
                Ok(Value::Null)
            }
            ControlRequest::SchemaList => to_value(schemas.list()?),
            ControlRequest::QueryRange {
                database,
                collection,
                start,
                end,
                period,
            } => match period {
                Some(period) => to_value(documents.query_range_summed(&database, &collection, start, end, period)?),
                None => to_value(documents.query_range(&database, &collection, start, end)?),
            },
            ControlRequest::QueryAll {
                database,
                collection,
            } => to_value(documents.all(&database, &collection)?),
            ControlRequest::QueryLast {
                database,
                collection,
            } => to_value(documents.query_last(&database, &collection)?),
            ControlRequest::QueryLastPeriod {
                database,
                collection,
                period,
            } => to_value(documents.query_last_period_sum(&database, &collection, period)?),
            ControlRequest::Databases => to_value(documents.list_databases()?),
            ControlRequest::Collections { database } => to_value(documents.list_collections(&database)?),
            ControlRequest::Metadata { collection } => match collection {
                Some(collection) => {
                    let record = documents.metadata(&collection)?.ok_or_else(|| {
                        Error::NotFound(format!("metadata for collection '{}'", collection))
                    })?;
                    to_value(record)
                }
                None => to_value(documents.list_metadata()?),
            },
        }
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(unix)]
pub use socket::{ControlClient, ControlServer};

#[cfg(unix)]
mod socket {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    use mqttgate_core::{Error, Result};
    use serde_json::Value;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::{UnixListener, UnixStream};
    use tokio::task::{JoinHandle, JoinSet};

    use super::{ControlHandler, ControlRequest, ControlResponse};

    const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Accepts administration sessions on a Unix socket.
    pub struct ControlServer {
        path: PathBuf,
        accept_loop: JoinHandle<()>,
    }

    impl ControlServer {
        /// Bind `path`, replacing a stale socket file, and start accepting.
        pub fn bind(path: &Path, handler: Arc<ControlHandler>) -> Result<Self> {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed stale control socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::InvalidConfig(format!(
                        "control socket {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
            let listener = UnixListener::bind(path).map_err(|e| {
                Error::InvalidConfig(format!("control socket {}: {}", path.display(), e))
            })?;
            tracing::info!(path = %path.display(), "Control socket listening");

            Ok(Self {
                path: path.to_path_buf(),
                accept_loop: tokio::spawn(accept_loop(listener, handler)),
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Stop accepting, end every open session and remove the socket file.
        pub async fn shutdown(self) {
            self.accept_loop.abort();
            let _ = self.accept_loop.await;
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::debug!(path = %self.path.display(), "Control socket not removed: {}", e);
            }
        }
    }

    async fn accept_loop(listener: UnixListener, handler: Arc<ControlHandler>) {
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        sessions.spawn(session(stream, handler.clone()));
                    }
                    Err(e) => tracing::warn!("Control socket accept failed: {}", e),
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }
    }

    async fn session(stream: UnixStream, handler: Arc<ControlHandler>) {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("Control session read failed: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let result = match serde_json::from_str::<ControlRequest>(&line) {
                Ok(request) => {
                    tracing::debug!(request = ?request, "Control request");
                    handler.handle(request).await
                }
                Err(e) => Err(Error::Parse(format!("invalid control request: {}", e))),
            };
            if let Err(e) = write_line(&mut writer, &ControlResponse::from_result(result)).await {
                tracing::debug!("Control session write failed: {}", e);
                break;
            }
        }
    }

    async fn write_line<T: serde::Serialize>(writer: &mut OwnedWriteHalf, message: &T) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    /// Client side of the administration socket.
    pub struct ControlClient {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl ControlClient {
        /// Connect to a running gateway. `None` when nothing listens on
        /// `path`.
        pub async fn connect(path: &Path) -> Result<Option<Self>> {
            let stream = match tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(path)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    return Ok(None)
                }
                Ok(Err(e)) => {
                    return Err(Error::Transport(format!(
                        "control socket {}: {}",
                        path.display(),
                        e
                    )))
                }
                Err(_) => {
                    return Err(Error::Transport(format!(
                        "timed out connecting to {}",
                        path.display()
                    )))
                }
            };
            let (reader, writer) = stream.into_split();
            Ok(Some(Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }))
        }

        /// Send one request and wait for its response.
        pub async fn request(&mut self, request: &ControlRequest) -> Result<Value> {
            write_line(&mut self.writer, request).await?;
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| Error::Transport(e.to_string()))?
                .ok_or_else(|| Error::Transport("gateway closed the control session".to_string()))?;
            serde_json::from_str::<ControlResponse>(&line)?.into_result()
        }
    }
}
