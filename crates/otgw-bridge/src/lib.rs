//! OpenTherm Gateway bridge engine
//!
//! This crate turns the line protocol of an OpenTherm Gateway (OTGW) into
//! typed `(topic, value)` events and turns `(topic, payload)` control requests
//! into gateway commands, tracking each command until the gateway confirms it.
//!
//! # Architecture
//!
//! The engine operates in four layers:
//!
//! 1. **Transport** - serial or TCP connection to the gateway
//! 2. **Codec & Registry** - telemetry/confirmation lines ↔ events, control
//!    point encoders
//! 3. **Command Tracker** - pending commands, resends and expiry
//! 4. **Bridge** - worker loop, connection lifecycle, liveness events
//!
//! Publishing the events (namespaces, retain policy, the bus client itself)
//! is left to the embedding application.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use otgw_bridge::{create_interface, GatewayConfigBuilder, Listener, OtgwBridge};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfigBuilder::new()
//!         .serial_port("/dev/ttyUSB0")
//!         .command_timeout(std::time::Duration::from_secs(5))
//!         .build();
//!
//!     let listener: Listener = Arc::new(|event| {
//!         println!("{} = {}", event.topic, event.value);
//!         Ok(())
//!     });
//!
//!     let interface = create_interface(&config.interface)?;
//!     let (bridge, handle) = OtgwBridge::new(interface, &config, listener);
//!     let worker = tokio::spawn(bridge.run());
//!
//!     handle.command("/hot_water/enable", "1")?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown();
//!     worker.await??;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - Serial port interface (requires `libudev-dev` on Linux)
//! - `tcp` - TCP interface for serial-to-network adapters (default)
//! - `full` - Enable all interfaces
//!
//! # Protocol Details
//!
//! Telemetry lines look like `B40193280`: source (`B`oiler, `T`hermostat,
//! `A`nswer from the gateway, `R`equest), message type, reserved nibble,
//! Data-ID and a 16-bit data field, all hex. Command confirmations look like
//! `TT: 19.50`. Commands are written as `TT=19.50`.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod config;
pub mod error;
pub mod interface;

// Protocol
pub mod codec;
pub mod registry;
pub mod tracker;

// Engine
pub mod bridge;
pub mod watchdog;

// Testing utilities
pub mod test_utils;

pub use config::{
    CommandConfig, ConnectionConfig, GatewayConfig, GatewayConfigBuilder, InterfaceConfig,
};
pub use error::{OtgwError, Result};
pub use interface::{create_interface, ConnectionState, GatewayInterface};

#[cfg(feature = "serial")]
pub use interface::SerialInterface;
#[cfg(feature = "tcp")]
pub use interface::TcpInterface;

pub use codec::{DecodedEvent, EncodedCommand, EventValue, MessageCodec};
pub use registry::{ControlPoint, DataKind, DataPoint, Encoder, Registry};
pub use tracker::{CommandStatus, CommandTracker, PendingCommand, SubmitOutcome, SweepReport};

pub use bridge::{BridgeCommand, BridgeHandle, BridgeStats, LineBuffer, Listener, OtgwBridge};
pub use watchdog::Watchdog;

pub use test_utils::{EventLog, MockInterface, TestFixture};

// Protocol constants re-exports
pub use config::{
    DEFAULT_BAUD_RATE, DEFAULT_COMMAND_TIMEOUT, DEFAULT_DATA_TIMEOUT, DEFAULT_MAX_RETRIES,
    DEFAULT_READ_TIMEOUT, DEFAULT_RECONNECT_PAUSE, DEFAULT_TCP_PORT,
};
pub use registry::{COMMAND_RESPONSE_MARKER, MASTER_SLAVE_STATUS_TOPIC};
pub use tracker::COMMAND_STATUS_TOPIC;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Gateway firmware the registry tables were written against
pub const FIRMWARE_VERSION: &str = "4.2.5";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_BAUD_RATE, 9600);
        assert_eq!(DEFAULT_TCP_PORT, 6638);
        assert_eq!(COMMAND_RESPONSE_MARKER, "/command_response");
        assert_eq!(COMMAND_STATUS_TOPIC, "/command_status");
    }
}
