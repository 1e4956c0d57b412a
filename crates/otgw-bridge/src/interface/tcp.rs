//! TCP interface for gateways behind a serial-to-network adapter
//!
//! The adapter exposes the gateway's serial line as a raw TCP stream.
//! Commands are terminated with a bare carriage return, which is what the
//! gateway firmware's own monitor sends.

use crate::error::{OtgwError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace};

use super::{ConnectionState, GatewayInterface, READ_CHUNK_SIZE};

/// Upper bound on establishing the TCP connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP interface for connecting to a gateway over the network
pub struct TcpInterface {
    host: String,
    port: u16,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    state: ConnectionState,
    name: String,
}

impl TcpInterface {
    /// Create a new TCP interface
    ///
    /// # Arguments
    ///
    /// * `host` - Host name or address of the adapter
    /// * `port` - TCP port (6638 on most adapters)
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let name = format!("tcp:{}:{}", host, port);
        Self {
            host,
            port,
            connect_timeout: CONNECT_TIMEOUT,
            stream: None,
            state: ConnectionState::Disconnected,
            name,
        }
    }

    /// Override the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn frame(line: &str) -> Vec<u8> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\r');
        data
    }
}

#[async_trait]
impl GatewayInterface for TcpInterface {
    async fn open(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        let address = self.address();
        info!(address = %address, "Connecting to gateway");

        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state = ConnectionState::Disconnected;
                return Err(OtgwError::ConnectFailed {
                    address,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                self.state = ConnectionState::Disconnected;
                return Err(OtgwError::ConnectFailed {
                    address,
                    reason: "connect timed out".to_string(),
                });
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Could not disable Nagle");
        }

        self.stream = Some(stream);
        self.state = ConnectionState::Connected;
        info!(address = %address, "Connected to gateway");
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(error = %e, "Ignoring error on TCP shutdown");
            }
            info!(address = %self.address(), "Disconnected from gateway");
        }
        self.state = ConnectionState::Disconnected;
    }

    async fn write(&mut self, line: &str) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(OtgwError::NotConnected)?;

        trace!(line, "Writing command");
        if let Err(e) = stream.write_all(&Self::frame(line)).await {
            error!(error = %e, "TCP write error");
            self.state = ConnectionState::Disconnected;
            return Err(OtgwError::WriteError(e.to_string()));
        }
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> Result<Bytes> {
        let stream = self.stream.as_mut().ok_or(OtgwError::NotConnected)?;

        let mut buf = [0u8; READ_CHUNK_SIZE];
        match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
            Err(_) => Ok(Bytes::new()),
            Ok(Ok(0)) => {
                self.state = ConnectionState::Disconnected;
                Err(OtgwError::Disconnected)
            }
            Ok(Ok(n)) => {
                trace!(bytes = n, "Read from TCP stream");
                Ok(Bytes::copy_from_slice(&buf[..n]))
            }
            Ok(Err(e)) => {
                error!(error = %e, "TCP read error");
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

impl std::fmt::Debug for TcpInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpInterface")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("state", &self.state)
            .finish()
    }
}
