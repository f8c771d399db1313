//! Instance configuration model.
//!
//! The persisted form is a free JSON document so that generic nested
//! get/set keeps working for fields this model does not know about.
//! [`InstanceConfig`] is the typed view read at connect time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::topic;

fn default_port() -> u16 {
    1883
}
fn default_keep_alive() -> u64 {
    60
}
fn default_period() -> u64 {
    60
}

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSettings {
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,

    /// Quality of service: 0, 1 or 2
    #[serde(default)]
    pub qos: u8,

    #[serde(default)]
    pub retain: bool,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Enable TLS
    #[serde(default)]
    pub ssl: bool,

    /// CA bundle path (PEM)
    #[serde(default)]
    pub ca_certs: Option<String>,

    /// Client certificate path (PEM)
    #[serde(default)]
    pub certfile: Option<String>,

    /// Client private key path (PEM)
    #[serde(default)]
    pub keyfile: Option<String>,

    /// Skip server certificate verification
    #[serde(default)]
    pub insecure: bool,

    /// Send username/password
    #[serde(default)]
    pub auth: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            keep_alive: 60,
            qos: 0,
            retain: false,
            username: None,
            password: None,
            ssl: false,
            ca_certs: None,
            certfile: None,
            keyfile: None,
            insecure: false,
            auth: false,
        }
    }
}

/// Fixed topic/payload pair published on a timer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeriodicPublish {
    #[serde(default = "default_period")]
    pub period_secs: u64,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub active: bool,
}

impl Default for PeriodicPublish {
    fn default() -> Self {
        Self {
            period_secs: 60,
            topic: String::new(),
            message: String::new(),
            active: false,
        }
    }
}

/// Typed view of an instance configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceConfig {
    #[serde(default)]
    pub broker_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Empty means generate one at connect time
    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub topics: Vec<String>,

    #[serde(default)]
    pub settings: ConnectionSettings,

    #[serde(default)]
    pub autostart: bool,

    #[serde(default)]
    pub periodic: PeriodicPublish,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            broker_address: String::new(),
            port: 1883,
            client_id: String::new(),
            topics: Vec::new(),
            settings: ConnectionSettings::default(),
            autostart: false,
            periodic: PeriodicPublish::default(),
        }
    }
}

impl InstanceConfig {
    pub fn new(broker_address: impl Into<String>) -> Self {
        Self {
            broker_address: broker_address.into(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_topic(mut self, filter: impl Into<String>) -> Self {
        self.topics.push(filter.into());
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.settings.auth = true;
        self.settings.username = Some(username.into());
        self.settings.password = Some(password.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    pub fn with_periodic(mut self, periodic: PeriodicPublish) -> Self {
        self.periodic = periodic;
        self
    }

    /// The document applied when an instance has no stored configuration.
    pub fn template() -> Value {
        serde_json::to_value(Self::default()).unwrap_or(Value::Null)
    }

    /// Read the typed view out of a stored document.
    pub fn from_document(doc: &Value) -> Result<Self> {
        serde_json::from_value(doc.clone())
            .map_err(|e| Error::InvalidConfig(format!("instance configuration: {}", e)))
    }

    pub fn to_document(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    pub fn full_broker_addr(&self) -> String {
        format!("{}:{}", self.broker_address, self.port)
    }

    /// Checks performed before connecting.
    pub fn validate(&self) -> Result<()> {
        let addr = self.broker_address.trim();
        if addr.is_empty() {
            return Err(Error::InvalidConfig("broker address is empty".to_string()));
        }
        if addr.contains("://") || addr.chars().any(char::is_whitespace) {
            return Err(Error::InvalidConfig(format!(
                "malformed broker address '{}'",
                self.broker_address
            )));
        }
        if self.port == 0 {
            return Err(Error::InvalidConfig("port must be non-zero".to_string()));
        }
        self.settings.validate()?;
        self.validate_topics()?;
        self.periodic.validate()
    }

    /// Every filter is well formed and appears once.
    pub fn validate_topics(&self) -> Result<()> {
        for (i, filter) in self.topics.iter().enumerate() {
            topic::validate_filter(filter).map_err(Error::InvalidConfig)?;
            if self.topics[..i].contains(filter) {
                return Err(Error::InvalidConfig(format!(
                    "topic filter '{}' is listed twice",
                    filter
                )));
            }
        }
        Ok(())
    }
}

impl ConnectionSettings {
    pub fn validate(&self) -> Result<()> {
        if self.qos > 2 {
            return Err(Error::InvalidConfig(format!(
                "qos must be 0, 1 or 2, got {}",
                self.qos
            )));
        }
        // MQTT carries keep-alive as a 16-bit number of seconds
        if self.keep_alive > u64::from(u16::MAX) {
            return Err(Error::InvalidConfig(format!(
                "keep_alive must be at most {} seconds, got {}",
                u16::MAX,
                self.keep_alive
            )));
        }
        Ok(())
    }
}

impl PeriodicPublish {
    pub fn validate(&self) -> Result<()> {
        if self.active && self.period_secs == 0 {
            return Err(Error::InvalidConfig(
                "periodic publish period must be positive".to_string(),
            ));
        }
        if self.active && self.topic.is_empty() {
            return Err(Error::InvalidConfig(
                "periodic publish topic is empty".to_string(),
            ));
        }
        Ok(())
    }
}
