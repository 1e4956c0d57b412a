//! Configuration types for the gateway bridge
//!
//! This module provides configuration structures for the transport,
//! command confirmation and connection lifecycle. The bus-facing settings
//! (namespaces, retain policy) belong to the binary that embeds the bridge.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{OtgwError, Result};

/// Default baud rate for OTGW serial devices
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default TCP port of an OTGW behind a serial-to-network adapter
pub const DEFAULT_TCP_PORT: u16 = 6638;

/// Default number of resends before a pending command is dropped
pub const DEFAULT_MAX_RETRIES: u32 = 4;

/// Default time to wait for a command confirmation before resending
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default pause between reconnection attempts
pub const DEFAULT_RECONNECT_PAUSE: Duration = Duration::from_secs(10);

/// Default bound on a single transport read
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Default silence after which the link is considered dead
pub const DEFAULT_DATA_TIMEOUT: Duration = Duration::from_secs(20);

/// Main configuration for the gateway bridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Transport configuration (serial or TCP)
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Command confirmation settings
    #[serde(default)]
    pub commands: CommandConfig,

    /// Connection lifecycle settings
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Prefix stripped from inbound command topics before registry lookup
    #[serde(default)]
    pub command_namespace: String,
}

impl GatewayConfig {
    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        match &self.interface {
            InterfaceConfig::Serial { device, baud_rate } => {
                if device.is_empty() {
                    return Err(OtgwError::InvalidConfig(
                        "serial device path is empty".to_string(),
                    ));
                }
                if *baud_rate == 0 {
                    return Err(OtgwError::InvalidConfig(
                        "baud rate must be positive".to_string(),
                    ));
                }
            }
            InterfaceConfig::Tcp { host, port } => {
                if host.is_empty() {
                    return Err(OtgwError::InvalidConfig("tcp host is empty".to_string()));
                }
                if *port == 0 {
                    return Err(OtgwError::InvalidConfig("tcp port is 0".to_string()));
                }
            }
        }

        if self.connection.read_timeout.is_zero() {
            return Err(OtgwError::InvalidConfig(
                "read timeout must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Transport used to reach the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InterfaceConfig {
    /// Serial port connection (USB or TTL adapter)
    Serial {
        /// Path to serial port (e.g., /dev/ttyUSB0, COM3)
        device: String,
        /// Baud rate (default: 9600)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// TCP connection (serial-to-network adapter)
    Tcp {
        /// Host address
        host: String,
        /// Port number
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        InterfaceConfig::Serial {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Command confirmation behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Track sent commands until the gateway echoes them back
    #[serde(default = "default_feedback_required")]
    pub feedback_required: bool,

    /// Resends allowed before a pending command is dropped; a command is
    /// written at most `max_retries + 1` times
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Time to wait for a confirmation before resending
    #[serde(with = "humantime_serde", default = "default_command_timeout")]
    pub timeout: Duration,
}

fn default_feedback_required() -> bool {
    true
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_command_timeout() -> Duration {
    DEFAULT_COMMAND_TIMEOUT
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            feedback_required: true,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// Connection lifecycle behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Pause between reconnection attempts
    #[serde(with = "humantime_serde", default = "default_reconnect_pause")]
    pub reconnect_pause: Duration,

    /// Upper bound of a single transport read
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,

    /// Silence after which the watchdog forces a reconnect
    #[serde(with = "humantime_serde", default = "default_data_timeout")]
    pub data_timeout: Duration,
}

fn default_reconnect_pause() -> Duration {
    DEFAULT_RECONNECT_PAUSE
}

fn default_read_timeout() -> Duration {
    DEFAULT_READ_TIMEOUT
}

fn default_data_timeout() -> Duration {
    DEFAULT_DATA_TIMEOUT
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_pause: DEFAULT_RECONNECT_PAUSE,
            read_timeout: DEFAULT_READ_TIMEOUT,
            data_timeout: DEFAULT_DATA_TIMEOUT,
        }
    }
}

/// Builder for GatewayConfig
#[derive(Debug, Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set serial port path
    pub fn serial_port(mut self, device: impl Into<String>) -> Self {
        self.config.interface = InterfaceConfig::Serial {
            device: device.into(),
            baud_rate: DEFAULT_BAUD_RATE,
        };
        self
    }

    /// Set serial port with baud rate
    pub fn serial_port_with_baud(mut self, device: impl Into<String>, baud_rate: u32) -> Self {
        self.config.interface = InterfaceConfig::Serial {
            device: device.into(),
            baud_rate,
        };
        self
    }

    /// Set TCP endpoint
    pub fn tcp(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.interface = InterfaceConfig::Tcp {
            host: host.into(),
            port,
        };
        self
    }

    /// Enable or disable command confirmation tracking
    pub fn feedback_required(mut self, enabled: bool) -> Self {
        self.config.commands.feedback_required = enabled;
        self
    }

    /// Set the number of resends before a command is dropped
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.commands.max_retries = retries;
        self
    }

    /// Set the confirmation timeout
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.commands.timeout = timeout;
        self
    }

    /// Set the pause between reconnection attempts
    pub fn reconnect_pause(mut self, pause: Duration) -> Self {
        self.config.connection.reconnect_pause = pause;
        self
    }

    /// Set the bound of a single read
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.read_timeout = timeout;
        self
    }

    /// Set the watchdog silence threshold
    pub fn data_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.data_timeout = timeout;
        self
    }

    /// Set the prefix stripped from inbound command topics
    pub fn command_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.command_namespace = namespace.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
