//! One broker connection per instance.
//!
//! A connection moves `Idle -> Connecting -> Running -> Stopping -> Idle`.
//! While running, a spawned receive loop polls the rumqttc event loop and
//! forwards every publish into the shared message queue. The loop ends on
//! the first transport error and the connection falls back to `Idle`.
//! There is no automatic reconnect.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mqttgate_core::{topic, Error, InstanceConfig, PathExpr, PathToken, Result};
use mqttgate_storage::InstanceConfigStore;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::periodic::PeriodicPublisher;
use crate::queue::{InboundMessage, MessageQueue};
use crate::tls;

/// Messages kept for introspection.
pub const RECENT_CAPACITY: usize = 1000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 100;
const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Running,
    Stopping,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Running => "running",
            ConnectionState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

struct Session {
    client: AsyncClient,
    receive_loop: JoinHandle<()>,
    qos: QoS,
    retain: bool,
}

/// A named broker connection backed by a persisted configuration document.
pub struct Connection {
    name: String,
    store: InstanceConfigStore,
    queue: MessageQueue,
    state: Arc<Mutex<ConnectionState>>,
    recent: Arc<Mutex<VecDeque<InboundMessage>>>,
    // Held across start and stop
    session: tokio::sync::Mutex<Option<Session>>,
    publisher: tokio::sync::Mutex<Option<PeriodicPublisher>>,
    // Set under the session lock once the instance is deleted
    retired: AtomicBool,
}

impl Connection {
    pub fn new(name: impl Into<String>, store: InstanceConfigStore, queue: MessageQueue) -> Self {
        Self {
            name: name.into(),
            store,
            queue,
            state: Arc::new(Mutex::new(ConnectionState::Idle)),
            recent: Arc::new(Mutex::new(VecDeque::new())),
            session: tokio::sync::Mutex::new(None),
            publisher: tokio::sync::Mutex::new(None),
            retired: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ConnectionState::Running
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// The persisted document, created from the template if missing.
    pub fn document(&self) -> Result<Value> {
        Ok(self.store.load_or_init(&self.name)?)
    }

    /// Typed view of the persisted document.
    pub fn config(&self) -> Result<InstanceConfig> {
        InstanceConfig::from_document(&self.document()?)
    }

    /// Connect, subscribe and start receiving.
    ///
    /// A no-op unless the connection is `Idle`. On failure the connection is
    /// left `Idle` and the error is returned.
    pub async fn start(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if self.retired.load(Ordering::Acquire) {
            return Err(Error::NotFound(format!("instance '{}'", self.name)));
        }
        if self.state() != ConnectionState::Idle {
            tracing::debug!(instance = %self.name, state = %self.state(), "Start ignored");
            return Ok(());
        }
        if let Some(ended) = session.take() {
            let _ = ended.receive_loop.await;
        }

        self.set_state(ConnectionState::Connecting);
        match self.connect().await {
            Ok(active) => *session = Some(active),
            Err(e) => {
                self.set_state(ConnectionState::Idle);
                tracing::error!(instance = %self.name, "Failed to start: {}", e);
                return Err(e);
            }
        }
        drop(session);
        tracing::info!(instance = %self.name, "Instance running");

        if let Err(e) = self.refresh_periodic().await {
            tracing::warn!(instance = %self.name, "Periodic publishing not started: {}", e);
        }
        Ok(())
    }

    async fn connect(&self) -> Result<Session> {
        let config = self.config()?;
        config.validate()?;
        let qos = qos_from(config.settings.qos)?;
        let options = self.mqtt_options(&config)?;

        tracing::info!(instance = %self.name, broker = %config.full_broker_addr(), "Connecting to broker");
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        match tokio::time::timeout(CONNECT_TIMEOUT, wait_for_connack(&mut eventloop)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Transport(format!(
                    "timed out connecting to {}",
                    config.full_broker_addr()
                )))
            }
        }

        let receive_loop = tokio::spawn(receive_loop(
            self.name.clone(),
            eventloop,
            self.state.clone(),
            self.recent.clone(),
            self.queue.clone(),
        ));

        for filter in &config.topics {
            if let Err(e) = client.subscribe(filter.as_str(), qos).await {
                receive_loop.abort();
                return Err(Error::Transport(format!("subscribe to '{}' failed: {}", filter, e)));
            }
            tracing::debug!(instance = %self.name, topic = %filter, "Subscribed");
        }

        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Connecting {
                receive_loop.abort();
                return Err(Error::Transport(
                    "connection closed while subscribing".to_string(),
                ));
            }
            *state = ConnectionState::Running;
        }

        Ok(Session {
            client,
            receive_loop,
            qos,
            retain: config.settings.retain,
        })
    }

    fn mqtt_options(&self, config: &InstanceConfig) -> Result<MqttOptions> {
        let client_id = if config.client_id.is_empty() {
            let suffix = Uuid::new_v4().simple().to_string();
            format!("mqttgate-{}-{}", self.name, &suffix[..8])
        } else {
            config.client_id.clone()
        };

        let mut options = MqttOptions::new(client_id, config.broker_address.trim(), config.port);
        options.set_keep_alive(Duration::from_secs(config.settings.keep_alive));
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        if config.settings.auth {
            if let Some(username) = &config.settings.username {
                let password = config.settings.password.clone().unwrap_or_default();
                options.set_credentials(username, password);
            }
        }
        if let Some(transport) = tls::transport_for(&config.settings)? {
            options.set_transport(transport);
        }
        Ok(options)
    }

    /// Disconnect and wait for the receive loop to finish.
    ///
    /// A no-op when not running.
    pub async fn stop(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        self.stop_periodic().await;

        let Some(active) = session.take() else {
            return Ok(());
        };
        if self.state() != ConnectionState::Running {
            // Receive loop already ended on its own
            let _ = active.receive_loop.await;
            return Ok(());
        }

        self.set_state(ConnectionState::Stopping);
        if let Err(e) = active.client.disconnect().await {
            tracing::debug!(instance = %self.name, "Disconnect request failed: {}", e);
        }

        let mut handle = active.receive_loop;
        if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
            tracing::warn!(instance = %self.name, "Receive loop did not stop in time, aborting");
            handle.abort();
            let _ = handle.await;
        }

        self.set_state(ConnectionState::Idle);
        tracing::info!(instance = %self.name, "Instance stopped");
        Ok(())
    }

    /// Mark the connection as deleted so it can never start again.
    ///
    /// Fails with `Conflict` unless the connection is idle and no start or
    /// stop is in progress.
    pub(crate) fn retire(&self) -> Result<()> {
        let busy = || {
            Error::Conflict(format!(
                "instance '{}' is {}, stop it before deleting",
                self.name,
                self.state()
            ))
        };
        let session = self.session.try_lock().map_err(|_| busy())?;
        let live = session
            .as_ref()
            .is_some_and(|s| !s.receive_loop.is_finished());
        if live || self.state() != ConnectionState::Idle {
            return Err(busy());
        }
        self.retired.store(true, Ordering::Release);
        Ok(())
    }

    /// Publish through the live connection.
    pub async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        let Some((client, qos, retain)) = self.live_client().await else {
            return Err(Error::Transport(format!(
                "instance '{}' is not running",
                self.name
            )));
        };
        client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    /// Up to the last `RECENT_CAPACITY` received messages, oldest first.
    pub fn recent_messages(&self) -> Vec<InboundMessage> {
        self.recent.lock().iter().cloned().collect()
    }

    async fn live_client(&self) -> Option<(AsyncClient, QoS, bool)> {
        let session = self.session.lock().await;
        session
            .as_ref()
            .filter(|_| self.is_running())
            .map(|s| (s.client.clone(), s.qos, s.retain))
    }

    pub fn topics(&self) -> Result<Vec<String>> {
        Ok(self.config()?.topics)
    }

    /// Add a topic filter to the persisted set and subscribe if running.
    pub async fn add_topic(&self, filter: &str) -> Result<()> {
        topic::validate_filter(filter).map_err(Error::InvalidConfig)?;
        let mut topics = self.topics()?;
        if topics.iter().any(|t| t == filter) {
            return Err(Error::Conflict(format!(
                "instance '{}' already subscribes to '{}'",
                self.name, filter
            )));
        }
        topics.push(filter.to_string());
        self.write_topics(topics)?;

        if let Some((client, qos, _)) = self.live_client().await {
            client
                .subscribe(filter, qos)
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
            tracing::info!(instance = %self.name, topic = %filter, "Subscribed");
        }
        Ok(())
    }

    /// Remove a topic filter from the persisted set and unsubscribe if running.
    pub async fn remove_topic(&self, filter: &str) -> Result<()> {
        let mut topics = self.topics()?;
        let before = topics.len();
        topics.retain(|t| t != filter);
        if topics.len() == before {
            return Err(Error::NotFound(format!(
                "topic '{}' on instance '{}'",
                filter, self.name
            )));
        }
        self.write_topics(topics)?;

        if let Some((client, _, _)) = self.live_client().await {
            client
                .unsubscribe(filter)
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
            tracing::info!(instance = %self.name, topic = %filter, "Unsubscribed");
        }
        Ok(())
    }

    fn write_topics(&self, topics: Vec<String>) -> Result<()> {
        let mut doc = self.document()?;
        PathExpr::parse("topics")?.set(&mut doc, Value::from(topics))?;
        self.store.save(&self.name, &doc)?;
        Ok(())
    }

    /// Value at `path` in the persisted document.
    pub fn get_config_value(&self, path: &str) -> Result<Value> {
        let doc = self.document()?;
        Ok(PathExpr::parse(path)?.evaluate(&doc)?.clone())
    }

    /// Set `path` in the persisted document.
    ///
    /// The result must still read as an instance configuration with a
    /// well-formed topic set. Changes under `topics` and `periodic` take
    /// effect immediately on a running connection; everything else applies
    /// on the next start.
    pub async fn set_config_value(&self, path: &str, value: Value) -> Result<()> {
        let expr = PathExpr::parse(path)?;
        let mut doc = self.document()?;
        let previous_topics = InstanceConfig::from_document(&doc)
            .map(|c| c.topics)
            .unwrap_or_default();
        expr.set(&mut doc, value)?;
        let config = InstanceConfig::from_document(&doc)?;
        config.settings.validate()?;
        config.validate_topics()?;
        config.periodic.validate()?;
        self.store.save(&self.name, &doc)?;
        tracing::info!(instance = %self.name, path = %path, "Configuration updated");

        match expr.tokens().first() {
            Some(PathToken::Key(k)) if k == "periodic" => self.refresh_periodic().await?,
            Some(PathToken::Key(k)) if k == "topics" => {
                self.resubscribe(&previous_topics, &config.topics).await?
            }
            _ => {}
        }
        Ok(())
    }

    /// Apply a topic set change to the live connection, if any.
    async fn resubscribe(&self, old: &[String], new: &[String]) -> Result<()> {
        let Some((client, qos, _)) = self.live_client().await else {
            return Ok(());
        };
        for filter in old.iter().filter(|t| !new.contains(t)) {
            client
                .unsubscribe(filter.as_str())
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
            tracing::info!(instance = %self.name, topic = %filter, "Unsubscribed");
        }
        for filter in new.iter().filter(|t| !old.contains(t)) {
            client
                .subscribe(filter.as_str(), qos)
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
            tracing::info!(instance = %self.name, topic = %filter, "Subscribed");
        }
        Ok(())
    }

    /// Bring the periodic publisher in line with the persisted settings.
    ///
    /// Any running publisher is stopped first. A new one is started only
    /// when the descriptor is active and the connection is running.
    pub async fn refresh_periodic(&self) -> Result<()> {
        let config = self.config()?;
        let session = self.session.lock().await;
        let mut publisher = self.publisher.lock().await;

        if let Some(old) = publisher.take() {
            old.stop().await;
        }
        if !config.periodic.active {
            return Ok(());
        }
        config.periodic.validate()?;

        match session.as_ref().filter(|_| self.is_running()) {
            Some(active) => {
                *publisher = Some(PeriodicPublisher::spawn(
                    self.name.clone(),
                    active.client.clone(),
                    config.periodic,
                    active.qos,
                    active.retain,
                ));
            }
            None => {
                tracing::debug!(instance = %self.name, "Not running, periodic publishing starts with the connection")
            }
        }
        Ok(())
    }

    pub async fn is_publishing(&self) -> bool {
        self.publisher
            .lock()
            .await
            .as_ref()
            .is_some_and(|p| !p.is_finished())
    }

    async fn stop_periodic(&self) {
        if let Some(publisher) = self.publisher.lock().await.take() {
            publisher.stop().await;
        }
    }
}

fn qos_from(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(Error::InvalidConfig(format!("invalid qos {}", other))),
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(Error::Transport(format!(
                        "broker refused connection: {:?}",
                        code
                    ))),
                };
            }
            Ok(_) => {}
            Err(e) => return Err(Error::Transport(e.to_string())),
        }
    }
}

fn remember(recent: &Mutex<VecDeque<InboundMessage>>, message: &InboundMessage) {
    let mut recent = recent.lock();
    if recent.len() >= RECENT_CAPACITY {
        recent.pop_front();
    }
    recent.push_back(message.clone());
}

async fn receive_loop(
    instance: String,
    mut eventloop: EventLoop,
    state: Arc<Mutex<ConnectionState>>,
    recent: Arc<Mutex<VecDeque<InboundMessage>>>,
    queue: MessageQueue,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                let message = InboundMessage::new(publish.topic, payload);
                tracing::trace!(instance = %instance, topic = %message.topic, "Received message");
                remember(&recent, &message);
                if !queue.push(message) {
                    tracing::warn!(instance = %instance, "Message queue closed, dropping message");
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    tracing::warn!(instance = %instance, pkid = ack.pkid, "Broker rejected a subscription");
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!(instance = %instance, "Disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if *state.lock() == ConnectionState::Stopping {
                    tracing::debug!(instance = %instance, "Connection closed: {}", e);
                } else {
                    tracing::error!(instance = %instance, "Connection lost: {}", e);
                }
                break;
            }
        }
    }
    *state.lock() = ConnectionState::Idle;
}
