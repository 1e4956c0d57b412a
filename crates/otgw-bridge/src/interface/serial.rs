//! Serial port interface for the gateway
//!
//! Async serial communication using tokio-serial. The gateway talks 9600 8N1
//! and expects commands terminated with CR LF.

use crate::config::DEFAULT_BAUD_RATE;
use crate::error::{OtgwError, Result};
use crate::interface::{ConnectionState, GatewayInterface, READ_CHUNK_SIZE};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{error, info, trace};

/// Serial interface for gateway communication
pub struct SerialInterface {
    /// Serial port path
    port_path: PathBuf,

    /// Baud rate
    baud_rate: u32,

    /// Serial stream (when open)
    stream: Option<SerialStream>,

    /// Current connection state
    state: ConnectionState,

    /// Interface name for logging
    name: String,
}

impl SerialInterface {
    /// Create a new serial interface
    pub fn new(port: impl AsRef<Path>) -> Self {
        let port_path = port.as_ref().to_path_buf();
        let name = format!("serial:{}", port_path.display());

        Self {
            port_path,
            baud_rate: DEFAULT_BAUD_RATE,
            stream: None,
            state: ConnectionState::Disconnected,
            name,
        }
    }

    /// Create with custom baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Get the port path
    pub fn port_path(&self) -> &Path {
        &self.port_path
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Terminate a command line with CR LF, dropping any terminator already present
    fn frame(line: &str) -> Vec<u8> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(b"\r\n");
        data
    }
}

#[async_trait]
impl GatewayInterface for SerialInterface {
    async fn open(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        info!(port = %self.port_path.display(), baud = self.baud_rate, "Opening serial port");

        if !self.port_path.exists() {
            self.state = ConnectionState::Disconnected;
            return Err(OtgwError::PortNotFound(
                self.port_path.display().to_string(),
            ));
        }

        let stream = tokio_serial::new(self.port_path.to_string_lossy(), self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()
            .map_err(|e| {
                self.state = ConnectionState::Disconnected;
                OtgwError::PortOpenFailed {
                    port: self.port_path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;

        self.stream = Some(stream);
        self.state = ConnectionState::Connected;

        info!(port = %self.port_path.display(), "Serial port open");
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            info!(port = %self.port_path.display(), "Closed serial port");
        }
        self.state = ConnectionState::Disconnected;
    }

    async fn write(&mut self, line: &str) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(OtgwError::NotConnected)?;

        trace!(line, "Writing command");
        let result = match stream.write_all(&Self::frame(line)).await {
            Ok(()) => stream.flush().await,
            Err(e) => Err(e),
        };

        result.map_err(|e| {
            error!(error = %e, "Serial write error");
            self.state = ConnectionState::Disconnected;
            OtgwError::WriteError(e.to_string())
        })
    }

    async fn read(&mut self, timeout: Duration) -> Result<Bytes> {
        let stream = self.stream.as_mut().ok_or(OtgwError::NotConnected)?;

        let mut buf = [0u8; READ_CHUNK_SIZE];
        match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
            Err(_) => Ok(Bytes::new()),
            Ok(Ok(0)) => {
                // EOF - adapter unplugged
                self.state = ConnectionState::Disconnected;
                Err(OtgwError::Disconnected)
            }
            Ok(Ok(n)) => {
                trace!(bytes = n, "Read from serial port");
                Ok(Bytes::copy_from_slice(&buf[..n]))
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Bytes::new()),
            Ok(Err(e)) => {
                error!(error = %e, "Serial read error");
                self.state = ConnectionState::Disconnected;
                Err(OtgwError::ReadError(e.to_string()))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.stream.is_some()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SerialInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialInterface")
            .field("port", &self.port_path)
            .field("baud_rate", &self.baud_rate)
            .field("state", &self.state)
            .finish()
    }
}
