//! Settings file
//!
//! A JSON document with an `otgw` section (gateway transport and command
//! confirmation) and an `mqtt` section (broker and topic namespaces). Every
//! key is optional; missing keys take the defaults below.

use anyhow::{bail, Context, Result};
use otgw_bridge::{
    CommandConfig, ConnectionConfig, GatewayConfig, InterfaceConfig, DEFAULT_BAUD_RATE,
    DEFAULT_MAX_RETRIES, DEFAULT_READ_TIMEOUT, DEFAULT_TCP_PORT,
};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Gateway side
    pub otgw: OtgwSettings,
    /// Bus side
    pub mqtt: MqttSettings,
}

/// How the gateway is reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    #[default]
    Serial,
    Tcp,
}

/// `otgw` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtgwSettings {
    #[serde(rename = "type")]
    pub kind: GatewayKind,
    pub device: String,
    pub baudrate: u32,
    pub host: String,
    pub port: u16,
    /// Seconds without data before the link is reset
    pub data_timeout: u64,
    pub command_feedback_required: bool,
    pub command_max_retries: u32,
    /// Seconds
    pub command_timeout: u64,
    /// Seconds
    pub reconnect_pause: u64,
}

impl Default for OtgwSettings {
    fn default() -> Self {
        Self {
            kind: GatewayKind::Serial,
            device: "/dev/ttyUSB0".to_string(),
            baudrate: DEFAULT_BAUD_RATE,
            host: String::new(),
            port: DEFAULT_TCP_PORT,
            data_timeout: 20,
            command_feedback_required: true,
            command_max_retries: DEFAULT_MAX_RETRIES,
            command_timeout: 5,
            reconnect_pause: 10,
        }
    }
}

/// `mqtt` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    /// Seconds
    pub keepalive: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: u8,
    /// Prefix of every published topic, also the liveness topic
    pub pub_topic_namespace: String,
    /// Prefix of the command topics
    pub sub_topic_namespace: String,
    pub retain: bool,
    /// Only publish a value when it differs from the last one on its topic
    pub changed_messages_only: bool,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            client_id: "otgw".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1883,
            keepalive: 60,
            username: None,
            password: None,
            qos: 0,
            pub_topic_namespace: "value/otgw".to_string(),
            sub_topic_namespace: "set/otgw".to_string(),
            retain: false,
            changed_messages_only: false,
        }
    }
}

impl MqttSettings {
    /// Quality of service for subscriptions and publications
    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }
}

impl Settings {
    /// Read and validate a settings file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let settings = Self::from_json(&text)
            .with_context(|| format!("Invalid settings file {}", path.display()))?;
        Ok(settings)
    }

    /// Parse and validate settings from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        check_namespace("pub_topic_namespace", &self.mqtt.pub_topic_namespace)?;
        check_namespace("sub_topic_namespace", &self.mqtt.sub_topic_namespace)?;

        if self.mqtt.qos > 2 {
            bail!("mqtt qos must be 0, 1 or 2, got {}", self.mqtt.qos);
        }
        if self.otgw.kind == GatewayKind::Tcp && self.otgw.host.is_empty() {
            bail!("otgw host is required for a tcp gateway");
        }
        Ok(())
    }

    /// Engine configuration derived from the `otgw` section
    pub fn gateway_config(&self) -> GatewayConfig {
        let otgw = &self.otgw;
        let interface = match otgw.kind {
            GatewayKind::Serial => InterfaceConfig::Serial {
                device: otgw.device.clone(),
                baud_rate: otgw.baudrate,
            },
            GatewayKind::Tcp => InterfaceConfig::Tcp {
                host: otgw.host.clone(),
                port: otgw.port,
            },
        };

        GatewayConfig {
            interface,
            commands: CommandConfig {
                feedback_required: otgw.command_feedback_required,
                max_retries: otgw.command_max_retries,
                timeout: Duration::from_secs(otgw.command_timeout),
            },
            connection: ConnectionConfig {
                reconnect_pause: Duration::from_secs(otgw.reconnect_pause),
                read_timeout: DEFAULT_READ_TIMEOUT,
                data_timeout: Duration::from_secs(otgw.data_timeout),
            },
            command_namespace: self.mqtt.sub_topic_namespace.clone(),
        }
    }
}

fn check_namespace(key: &str, namespace: &str) -> Result<()> {
    match namespace.chars().last() {
        None => bail!("mqtt {} must not be empty", key),
        Some(c @ ('/' | '#' | '$')) => {
            bail!("mqtt {} must not end with '{}': {}", key, c, namespace)
        }
        Some(_) => Ok(()),
    }
}
