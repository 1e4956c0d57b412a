//! OtgwBridge - connection lifecycle and worker loop
//!
//! The bridge owns the transport and runs a single worker that, per cycle:
//!
//! 1. drains queued commands (encode, track, move to the outbox)
//! 2. writes the outbox to the gateway in order
//! 3. reads whatever arrives within the read timeout
//! 4. splits complete lines and decodes them
//! 5. reconciles each event with the pending commands and hands the sweep
//!    diagnostic and the event to the listener
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         OtgwBridge                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌────────────┐    ┌───────────────┐    ┌────────────────┐   │
//! │  │  Gateway   │◄──►│  Worker loop  │───►│   Listener     │   │
//! │  │ (serial /  │    │               │    │ (bus publish)  │   │
//! │  │   tcp)     │    │ LineBuffer    │    └────────────────┘   │
//! │  └────────────┘    │ MessageCodec  │                         │
//! │                    │ CommandTracker│    ┌────────────────┐   │
//! │                    │ outbox        │◄───│ BridgeHandle   │   │
//! │                    └───────────────┘    │ (any task)     │   │
//! │                                         └────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transport faults never end the worker: it closes the transport and
//! reconnects, emitting `offline` for each failed attempt and `online` once
//! the link is back.
//!
//! # Example
//!
//! ```rust,ignore
//! use otgw_bridge::{create_interface, GatewayConfigBuilder, Listener, OtgwBridge};
//! use std::sync::Arc;
//!
//! let config = GatewayConfigBuilder::new().tcp("otgw.local", 6638).build();
//! let interface = create_interface(&config.interface)?;
//! let listener: Listener = Arc::new(|event| {
//!     println!("{} = {}", event.topic, event.value);
//!     Ok(())
//! });
//!
//! let (bridge, handle) = OtgwBridge::new(interface, &config, listener);
//! tokio::spawn(bridge.run());
//!
//! handle.command("/room_setpoint/temporary", "19.5")?;
//! ```

use bytes::{Buf, BytesMut};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::codec::{DecodedEvent, MessageCodec};
use crate::config::GatewayConfig;
use crate::error::{OtgwError, Result};
use crate::interface::{ConnectionState, GatewayInterface};
use crate::tracker::CommandTracker;

/// Requests sent from a [`BridgeHandle`] to the worker
#[derive(Debug, Clone)]
pub enum BridgeCommand {
    /// Encode and send a command
    Send {
        /// Command topic, namespace already stripped
        topic: String,
        /// Raw bus payload
        payload: String,
    },
    /// Drop the link and reconnect
    ForceReconnect {
        /// When the request was made; requests older than the current link are ignored
        issued_at: Instant,
    },
}

/// Bridge statistics
#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    /// Complete lines read from the gateway
    pub lines_received: u64,
    /// Lines that produced no events
    pub undecodable_lines: u64,
    /// Events handed to the listener without error
    pub events_delivered: u64,
    /// Command lines written to the gateway (including resends)
    pub commands_sent: u64,
    /// Commands not sent because the same value was pending
    pub commands_deduplicated: u64,
    /// Commands dropped because no control point matched
    pub commands_rejected: u64,
    /// Pending commands confirmed by the gateway
    pub confirmations: u64,
    /// Pending commands resent after a timeout
    pub retries: u64,
    /// Pending commands dropped by the sweep
    pub expired_commands: u64,
    /// Listener calls that failed or panicked
    pub listener_errors: u64,
    /// Times the link was re-established after a fault
    pub reconnects: u64,
}

/// Receives every event the bridge produces, on the worker task
pub type Listener =
    Arc<dyn Fn(&DecodedEvent) -> std::result::Result<(), String> + Send + Sync>;

/// Handle for controlling an [`OtgwBridge`]
///
/// Cheap to clone and usable from any task. The worker stops when
/// [`shutdown`](Self::shutdown) is called or every handle is dropped.
#[derive(Clone)]
pub struct BridgeHandle {
    command_tx: mpsc::UnboundedSender<BridgeCommand>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    state_rx: watch::Receiver<ConnectionState>,
    stats: Arc<RwLock<BridgeStats>>,
    namespace: String,
}

impl BridgeHandle {
    /// Queue a command for the gateway
    ///
    /// `topic` may carry the command namespace, which is stripped before
    /// the control point lookup. Never blocks.
    pub fn command(&self, topic: &str, payload: impl Into<String>) -> Result<()> {
        let topic = if self.namespace.is_empty() {
            topic
        } else {
            topic.strip_prefix(self.namespace.as_str()).unwrap_or(topic)
        };

        self.command_tx.send(BridgeCommand::Send {
            topic: topic.to_string(),
            payload: payload.into(),
        })?;
        Ok(())
    }

    /// Ask the worker to drop the link and reconnect
    pub fn force_reconnect(&self) -> Result<()> {
        self.command_tx
            .send(BridgeCommand::ForceReconnect {
                issued_at: Instant::now(),
            })
            .map_err(|_| OtgwError::ChannelClosed)
    }

    /// Stop the worker; it closes the transport before returning
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Check if the worker is still alive
    pub fn is_running(&self) -> bool {
        !self.command_tx.is_closed()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to connection state changes
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Snapshot of the bridge statistics
    pub fn stats(&self) -> BridgeStats {
        self.stats.read().clone()
    }
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("state", &self.state())
            .field("namespace", &self.namespace)
            .finish()
    }
}

/// Accumulates transport bytes and yields complete lines
///
/// A line ends at the first CR or LF. Runs of terminators collapse, so empty
/// lines never come out. Non-ASCII bytes are dropped on arrival.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

fn is_terminator(byte: &u8) -> bool {
    matches!(byte, b'\r' | b'\n')
}

impl LineBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend(data.iter().copied().filter(u8::is_ascii));
    }

    /// Take the next complete line, without its terminators
    pub fn next_line(&mut self) -> Option<String> {
        let start = self.buf.iter().position(|b| !is_terminator(b));
        match start {
            Some(start) => self.buf.advance(start),
            None => {
                self.buf.clear();
                return None;
            }
        }

        let end = self.buf.iter().position(is_terminator)?;
        let line = self.buf.split_to(end);
        let run = self.buf.iter().take_while(|b| is_terminator(b)).count();
        self.buf.advance(run);

        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Bytes of the incomplete trailing line
    pub fn remainder(&self) -> &[u8] {
        &self.buf
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop buffered bytes
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Resolves once shutdown is requested or every handle is gone
async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Gateway bridge worker
pub struct OtgwBridge<I: GatewayInterface> {
    /// Gateway transport
    interface: I,
    /// Engine configuration
    config: GatewayConfig,
    /// Line decoder and command encoder
    codec: MessageCodec,
    /// Commands awaiting confirmation
    tracker: CommandTracker,
    /// Bytes not yet forming a complete line
    line_buffer: LineBuffer,
    /// Encoded command lines waiting to be written
    outbox: VecDeque<String>,
    /// Event sink
    listener: Listener,
    /// Command receiver
    command_rx: mpsc::UnboundedReceiver<BridgeCommand>,
    /// Shutdown flag
    shutdown_rx: watch::Receiver<bool>,
    /// Published connection state
    state_tx: watch::Sender<ConnectionState>,
    /// Bridge statistics, shared with handles
    stats: Arc<RwLock<BridgeStats>>,
    /// When the current link was established
    connected_since: Instant,
}

impl<I: GatewayInterface> OtgwBridge<I> {
    /// Create a new bridge with the given interface and listener
    pub fn new(interface: I, config: &GatewayConfig, listener: Listener) -> (Self, BridgeHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let stats = Arc::new(RwLock::new(BridgeStats::default()));

        let handle = BridgeHandle {
            command_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            state_rx,
            stats: Arc::clone(&stats),
            namespace: config.command_namespace.clone(),
        };

        let bridge = Self {
            interface,
            config: config.clone(),
            codec: MessageCodec::new(),
            tracker: CommandTracker::new(&config.commands),
            line_buffer: LineBuffer::new(),
            outbox: VecDeque::new(),
            listener,
            command_rx,
            shutdown_rx,
            state_tx,
            stats,
            connected_since: Instant::now(),
        };

        (bridge, handle)
    }

    /// Run the worker until shutdown
    ///
    /// Transport faults are handled internally by reconnecting, so this only
    /// returns once shutdown was requested.
    pub async fn run(mut self) -> Result<()> {
        info!(interface = self.interface.name(), "Starting gateway bridge");
        self.set_state(ConnectionState::Connecting);

        let mut running = self.establish().await;
        let read_timeout = self.config.connection.read_timeout;

        while running && !self.shutdown_requested() {
            let mut reconnect = self.drain_commands();

            if !reconnect {
                if let Err(e) = self.flush_outbox().await {
                    warn!(error = %e, "Connection lost while writing, will reconnect");
                    reconnect = true;
                }
            }

            if !reconnect {
                let read = tokio::select! {
                    _ = shutdown_signal(&mut self.shutdown_rx) => break,
                    read = self.interface.read(read_timeout) => read,
                };

                match read {
                    Ok(data) if data.is_empty() => {}
                    Ok(data) => {
                        trace!(bytes = data.len(), "Received data");
                        self.line_buffer.extend(&data);
                        self.process_lines();
                    }
                    Err(e) => {
                        warn!(error = %e, "Connection lost, will reconnect");
                        reconnect = true;
                    }
                }
            }

            if reconnect {
                running = self.reconnect().await;
            }
        }

        self.interface.close().await;
        self.set_state(ConnectionState::Disconnected);
        info!("Gateway bridge stopped");
        Ok(())
    }

    /// Open the transport, retrying until it works or shutdown is requested
    async fn establish(&mut self) -> bool {
        let pause = self.config.connection.reconnect_pause;

        loop {
            if self.shutdown_requested() {
                return false;
            }

            let opened = tokio::select! {
                _ = shutdown_signal(&mut self.shutdown_rx) => return false,
                opened = self.interface.open() => opened,
            };

            match opened {
                Ok(()) => {
                    self.connected_since = Instant::now();
                    self.set_state(ConnectionState::Connected);
                    info!(interface = self.interface.name(), "Connected to gateway");
                    self.deliver(&DecodedEvent::liveness(true));
                    return true;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in = ?pause,
                        "Could not connect to gateway"
                    );
                    self.set_state(ConnectionState::Reconnecting);
                    self.deliver(&DecodedEvent::liveness(false));

                    tokio::select! {
                        _ = shutdown_signal(&mut self.shutdown_rx) => return false,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }
    }

    /// Drop the link and establish a new one
    async fn reconnect(&mut self) -> bool {
        self.interface.close().await;
        self.set_state(ConnectionState::Reconnecting);
        // a partial line cannot be completed by a new connection
        self.line_buffer.clear();

        if !self.establish().await {
            return false;
        }

        self.stats.write().reconnects += 1;
        self.tracker.refresh_all();
        true
    }

    /// Move queued requests into the outbox; returns whether a reconnect was requested
    fn drain_commands(&mut self) -> bool {
        let mut reconnect = false;

        while let Ok(cmd) = self.command_rx.try_recv() {
            match cmd {
                BridgeCommand::Send { topic, payload } => self.enqueue_command(&topic, &payload),
                BridgeCommand::ForceReconnect { issued_at } => {
                    if issued_at >= self.connected_since {
                        info!("Reconnect requested");
                        reconnect = true;
                    } else {
                        debug!("Ignoring reconnect request older than the current link");
                    }
                }
            }
        }

        reconnect
    }

    fn enqueue_command(&mut self, topic: &str, payload: &str) {
        let cmd = match self.codec.encode(topic, payload) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(topic, payload, error = %e, "Dropping command");
                self.stats.write().commands_rejected += 1;
                return;
            }
        };

        if self.config.commands.feedback_required {
            let outcome = self.tracker.submit(cmd.topic, &cmd.value, Instant::now());
            if !outcome.should_send() {
                self.stats.write().commands_deduplicated += 1;
                return;
            }
        }

        debug!(topic, command = %cmd, "Queueing command");
        self.outbox.push_back(cmd.line());
    }

    /// Write the outbox front to back; unsent lines survive a reconnect
    async fn flush_outbox(&mut self) -> Result<()> {
        while let Some(line) = self.outbox.front() {
            self.interface.write(line).await?;
            self.outbox.pop_front();
            self.stats.write().commands_sent += 1;
        }
        Ok(())
    }

    fn process_lines(&mut self) {
        while let Some(line) = self.line_buffer.next_line() {
            self.handle_line(&line);
        }
    }

    fn handle_line(&mut self, line: &str) {
        trace!(line, "Processing line");
        let events = self.codec.decode(line);

        {
            let mut stats = self.stats.write();
            stats.lines_received += 1;
            if events.is_empty() {
                stats.undecodable_lines += 1;
            }
        }

        for event in &events {
            if self.config.commands.feedback_required {
                let report = self.tracker.on_event(event, Instant::now());
                {
                    let mut stats = self.stats.write();
                    stats.confirmations += u64::from(report.confirmed.is_some());
                    stats.retries += report.resend.len() as u64;
                    stats.expired_commands += report.expired.len() as u64;
                }
                let status = report.status_event();
                self.outbox.extend(report.resend);
                self.deliver(&status);
            }
            self.deliver(event);
        }
    }

    /// Hand an event to the listener, containing any failure
    fn deliver(&self, event: &DecodedEvent) {
        let listener = &self.listener;
        match std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
            Ok(Ok(())) => self.stats.write().events_delivered += 1,
            Ok(Err(e)) => {
                warn!(topic = %event.topic, error = %e, "Listener failed");
                self.stats.write().listener_errors += 1;
            }
            Err(_) => {
                warn!(topic = %event.topic, "Listener panicked");
                self.stats.write().listener_errors += 1;
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow() || self.shutdown_rx.has_changed().is_err()
    }

    /// Commands awaiting confirmation
    pub fn tracker(&self) -> &CommandTracker {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EventValue;
    use crate::config::GatewayConfigBuilder;
    use crate::test_utils::{EventLog, MockInterface};
    use std::time::Duration;

    fn start(
        config: GatewayConfig,
    ) -> (
        MockInterface,
        EventLog,
        BridgeHandle,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let interface = MockInterface::new();
        let events = EventLog::new();
        let (bridge, handle) = OtgwBridge::new(interface.clone(), &config, events.listener());
        let task = tokio::spawn(bridge.run());
        (interface, events, handle, task)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    #[test]
    fn test_line_buffer_collapses_terminators() {
        let mut buffer = LineBuffer::new();
        buffer.extend(b"AB: x\r\n\r\n\nCD: y\r");

        assert_eq!(buffer.next_line().as_deref(), Some("AB: x"));
        assert_eq!(buffer.next_line().as_deref(), Some("CD: y"));
        assert_eq!(buffer.next_line(), None);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_line_buffer_keeps_partial_line() {
        let mut buffer = LineBuffer::new();
        buffer.extend(b"\n\nB4019");
        assert_eq!(buffer.next_line(), None);
        assert_eq!(buffer.remainder(), b"B4019");

        buffer.extend(b"3280\r\nT10");
        assert_eq!(buffer.next_line().as_deref(), Some("B40193280"));
        assert_eq!(buffer.next_line(), None);
        assert_eq!(buffer.remainder(), b"T10");
    }

    #[test]
    fn test_line_buffer_drops_non_ascii() {
        let mut buffer = LineBuffer::new();
        buffer.extend(&[b'T', b'T', 0xFF, b':', b' ', 0xC3, b'1', b'\n']);
        assert_eq!(buffer.next_line().as_deref(), Some("TT: 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_telemetry_reaches_listener() {
        let (interface, events, handle, _task) = start(GatewayConfig::default());
        interface.queue_line("B40193280");
        settle().await;

        assert_eq!(events.topics(), vec!["", "/command_status", "/boiler_water_temperature"]);
        assert_eq!(
            events.last("/boiler_water_temperature"),
            Some(EventValue::Float(50.5))
        );
        assert_eq!(handle.state(), ConnectionState::Connected);
        assert_eq!(handle.stats().lines_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_status_events_without_feedback() {
        let config = GatewayConfigBuilder::new().feedback_required(false).build();
        let (interface, events, handle, _task) = start(config);
        interface.queue_line("B40193280");
        handle.command("/room_setpoint/temporary", "19").unwrap();
        handle.command("/room_setpoint/temporary", "19").unwrap();
        settle().await;

        assert_eq!(events.count("/command_status"), 0);
        assert_eq!(interface.written(), vec!["TT=19.00", "TT=19.00"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_written_and_confirmed() {
        let (interface, events, handle, _task) = start(GatewayConfig::default());
        handle.command("/room_setpoint/temporary", "19.5").unwrap();
        handle.command("/room_setpoint/temporary", "19.5").unwrap();
        settle().await;

        assert_eq!(interface.written(), vec!["TT=19.50"]);
        assert_eq!(handle.stats().commands_deduplicated, 1);

        interface.queue_line("TT: 19.50");
        settle().await;

        assert_eq!(
            events.last("/command_response/room_setpoint/temporary"),
            Some(EventValue::Text("19.50".to_string()))
        );
        assert_eq!(events.last("/command_status"), Some(EventValue::Int(0)));
        assert_eq!(handle.stats().confirmations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_namespace_is_stripped() {
        let config = GatewayConfigBuilder::new()
            .command_namespace("set/otgw")
            .build();
        let (interface, _events, handle, _task) = start(config);
        handle.command("set/otgw/max_modulation", "42").unwrap();
        settle().await;

        assert_eq!(interface.written(), vec!["MM=42"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_command_is_not_sent() {
        let (interface, _events, handle, _task) = start(GatewayConfig::default());
        handle.command("/not/a/command", "1").unwrap();
        settle().await;

        assert!(interface.written().is_empty());
        assert_eq!(handle.stats().commands_rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_triggers_reconnect() {
        let (interface, events, handle, _task) = start(GatewayConfig::default());
        settle().await;
        interface.queue_read_error();
        settle().await;

        assert_eq!(events.liveness(), vec!["online", "online"]);
        assert_eq!(interface.open_count(), 2);
        assert_eq!(handle.stats().reconnects, 1);
        assert_eq!(handle.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbox_survives_write_failure() {
        let (interface, _events, handle, _task) = start(GatewayConfig::default());
        settle().await;
        interface.fail_next_writes(1);
        handle.command("/hot_water/enable", "on").unwrap();
        settle().await;

        assert_eq!(interface.written(), vec!["HW=T"]);
        assert_eq!(handle.stats().reconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reconnect() {
        let (interface, _events, handle, _task) = start(GatewayConfig::default());
        settle().await;
        handle.force_reconnect().unwrap();
        settle().await;

        assert_eq!(interface.open_count(), 2);
        assert_eq!(interface.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_reconnect_request_is_ignored() {
        let interface = MockInterface::new();
        let events = EventLog::new();
        let (bridge, handle) =
            OtgwBridge::new(interface.clone(), &GatewayConfig::default(), events.listener());
        let issued_at = Instant::now();
        tokio::time::advance(Duration::from_secs(1)).await;

        handle
            .command_tx
            .send(BridgeCommand::ForceReconnect { issued_at })
            .unwrap();
        let _task = tokio::spawn(bridge.run());
        settle().await;

        assert_eq!(interface.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_failures_are_contained() {
        let interface = MockInterface::new();
        let listener: Listener = Arc::new(|event: &DecodedEvent| {
            if event.topic == "/command_status" {
                return Err("bus unavailable".to_string());
            }
            if event.topic == "/room_temperature" {
                panic!("listener bug");
            }
            Ok(())
        });
        let (bridge, handle) = OtgwBridge::new(interface.clone(), &GatewayConfig::default(), listener);
        let _task = tokio::spawn(bridge.run());

        interface.queue_line("T101814C0");
        interface.queue_line("B40193280");
        settle().await;

        let stats = handle.stats();
        assert_eq!(stats.lines_received, 2);
        assert_eq!(stats.listener_errors, 3);
        // online + boiler temperature
        assert_eq!(stats.events_delivered, 2);
        assert_eq!(handle.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_without_offline() {
        let (interface, events, handle, task) = start(GatewayConfig::default());
        settle().await;

        handle.shutdown();
        task.await.unwrap().unwrap();

        assert_eq!(events.liveness(), vec!["online"]);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(!interface.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handles_stops_worker() {
        let (_interface, _events, handle, task) = start(GatewayConfig::default());
        settle().await;
        drop(handle);
        task.await.unwrap().unwrap();
    }
}
