//! Error types for OpenTherm Gateway bridge operations
//!
//! Transport faults propagate to the connection lifecycle manager, which
//! reconnects. Everything else (undecodable lines, unknown control points,
//! listener failures) is contained where it happens and only logged.

use thiserror::Error;

/// Main error type for gateway bridge operations
#[derive(Error, Debug)]
pub enum OtgwError {
    // ===== Transport Errors =====
    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Serial port open failed
    #[error("Failed to open serial port {port}: {reason}")]
    PortOpenFailed {
        /// Port path
        port: String,
        /// Failure reason
        reason: String,
    },

    /// TCP connect failed
    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailed {
        /// Remote address
        address: String,
        /// Failure reason
        reason: String,
    },

    /// Transport read error
    #[error("Read error: {0}")]
    ReadError(String),

    /// Transport write error
    #[error("Write error: {0}")]
    WriteError(String),

    /// Peer closed the connection
    #[error("Gateway disconnected")]
    Disconnected,

    /// Operation attempted on a closed transport
    #[error("Transport is not open")]
    NotConnected,

    // ===== Protocol Errors =====
    /// No control point is registered for a command topic
    #[error("No encoder for topic: {0}")]
    NoEncoder(String),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Interface type not compiled into this build
    #[error("Interface not supported by this build: {0}")]
    UnsupportedInterface(String),

    // ===== Engine Errors =====
    /// Channel to the bridge worker closed
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OtgwError {
    /// Check if this error is recoverable by reconnecting
    pub fn is_retriable(&self) -> bool {
        self.is_transport_error()
    }

    /// Check if this is a transport fault (connect/read/write/peer close)
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            OtgwError::PortNotFound(_)
                | OtgwError::PortOpenFailed { .. }
                | OtgwError::ConnectFailed { .. }
                | OtgwError::ReadError(_)
                | OtgwError::WriteError(_)
                | OtgwError::Disconnected
                | OtgwError::NotConnected
                | OtgwError::Io(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            OtgwError::PortNotFound(_) => "PORT_NOT_FOUND",
            OtgwError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
            OtgwError::ConnectFailed { .. } => "CONNECT_FAILED",
            OtgwError::ReadError(_) => "READ_ERROR",
            OtgwError::WriteError(_) => "WRITE_ERROR",
            OtgwError::Disconnected => "DISCONNECTED",
            OtgwError::NotConnected => "NOT_CONNECTED",
            OtgwError::NoEncoder(_) => "NO_ENCODER",
            OtgwError::InvalidConfig(_) => "INVALID_CONFIG",
            OtgwError::UnsupportedInterface(_) => "UNSUPPORTED_INTERFACE",
            OtgwError::ChannelClosed => "CHANNEL_CLOSED",
            OtgwError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, OtgwError>;

// Conversion from serial port errors (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<tokio_serial::Error> for OtgwError {
    fn from(err: tokio_serial::Error) -> Self {
        match err.kind {
            tokio_serial::ErrorKind::NoDevice => OtgwError::PortNotFound(err.description),
            tokio_serial::ErrorKind::Io(kind) => {
                OtgwError::Io(std::io::Error::new(kind, err.description))
            }
            _ => OtgwError::PortOpenFailed {
                port: String::new(),
                reason: err.description,
            },
        }
    }
}

// Conversion from tokio mpsc send error
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for OtgwError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        OtgwError::ChannelClosed
    }
}
