//! Transports for reaching the gateway
//!
//! This module provides the transport contract the bridge worker drives and
//! the implementations for the supported media:
//!
//! - [`SerialInterface`] - USB/TTL serial port (requires `serial` feature)
//! - [`TcpInterface`] - serial-to-network adapter (requires `tcp` feature)
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   # Ubuntu/Debian
//!   apt install libudev-dev pkg-config
//!   ```

#[cfg(feature = "serial")]
mod serial;
#[cfg(feature = "serial")]
pub use serial::SerialInterface;

#[cfg(feature = "tcp")]
mod tcp;
#[cfg(feature = "tcp")]
pub use tcp::TcpInterface;

use crate::config::InterfaceConfig;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Bytes requested from the transport per read
pub(crate) const READ_CHUNK_SIZE: usize = 512;

/// Transport contract between the bridge worker and the gateway
///
/// Implementations only move bytes. Line splitting happens in the bridge.
#[async_trait]
pub trait GatewayInterface: Send {
    /// Open the transport, leaving it ready for an immediate read
    async fn open(&mut self) -> Result<()>;

    /// Close the transport. Best effort, errors are swallowed.
    async fn close(&mut self);

    /// Write one command line; the implementation adds its terminator
    async fn write(&mut self, line: &str) -> Result<()>;

    /// Read whatever arrives within `timeout`
    ///
    /// Returns empty bytes on timeout. A closed peer is an error, never an
    /// empty result.
    async fn read(&mut self, timeout: Duration) -> Result<Bytes>;

    /// Check if the transport is open
    fn is_connected(&self) -> bool;

    /// Get the interface name (for logging)
    fn name(&self) -> &str;
}

#[async_trait]
impl<T: GatewayInterface + ?Sized> GatewayInterface for Box<T> {
    async fn open(&mut self) -> Result<()> {
        (**self).open().await
    }

    async fn close(&mut self) {
        (**self).close().await
    }

    async fn write(&mut self, line: &str) -> Result<()> {
        (**self).write(line).await
    }

    async fn read(&mut self, timeout: Duration) -> Result<Bytes> {
        (**self).read(timeout).await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Build the transport selected by the configuration
pub fn create_interface(config: &InterfaceConfig) -> Result<Box<dyn GatewayInterface>> {
    match config {
        #[cfg(feature = "serial")]
        InterfaceConfig::Serial { device, baud_rate } => Ok(Box::new(
            SerialInterface::new(device).with_baud_rate(*baud_rate),
        )),
        #[cfg(not(feature = "serial"))]
        InterfaceConfig::Serial { .. } => Err(crate::error::OtgwError::UnsupportedInterface(
            "serial (build with the `serial` feature)".to_string(),
        )),
        #[cfg(feature = "tcp")]
        InterfaceConfig::Tcp { host, port } => Ok(Box::new(TcpInterface::new(host.clone(), *port))),
        #[cfg(not(feature = "tcp"))]
        InterfaceConfig::Tcp { .. } => Err(crate::error::OtgwError::UnsupportedInterface(
            "tcp (build with the `tcp` feature)".to_string(),
        )),
    }
}

/// Connection state of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// First connection attempt in progress
    Connecting,
    /// Successfully connected
    Connected,
    /// Connection lost, retrying
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }

    #[cfg(feature = "tcp")]
    #[test]
    fn test_create_tcp_interface() {
        let iface = create_interface(&InterfaceConfig::Tcp {
            host: "otgw.local".to_string(),
            port: 6638,
        })
        .unwrap();
        assert_eq!(iface.name(), "tcp:otgw.local:6638");
        assert!(!iface.is_connected());
    }

    #[cfg(not(feature = "serial"))]
    #[test]
    fn test_serial_needs_feature() {
        let err = create_interface(&InterfaceConfig::default()).err().unwrap();
        assert!(matches!(err, crate::error::OtgwError::UnsupportedInterface(_)));
    }
}
