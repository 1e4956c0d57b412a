//! Test utilities for exercising the bridge without a gateway
//!
//! [`MockInterface`] is a scripted transport: tests queue the bytes the
//! "gateway" sends, make opens, reads or writes fail, and inspect what the
//! bridge wrote. Clones share state, so a test keeps one clone while the
//! bridge owns another.
//!
//! # Example
//!
//! ```rust,ignore
//! use otgw_bridge::test_utils::{EventLog, MockInterface};
//! use otgw_bridge::{GatewayConfig, OtgwBridge};
//!
//! let interface = MockInterface::new();
//! let events = EventLog::new();
//! let (bridge, handle) =
//!     OtgwBridge::new(interface.clone(), &GatewayConfig::default(), events.listener());
//! tokio::spawn(bridge.run());
//!
//! interface.queue_line("B40193280");
//! handle.command("/room_setpoint/temporary", "19.5")?;
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::{BridgeHandle, Listener, OtgwBridge};
use crate::codec::{DecodedEvent, EventValue};
use crate::config::{GatewayConfig, GatewayConfigBuilder};
use crate::error::{OtgwError, Result};
use crate::interface::GatewayInterface;

#[derive(Debug)]
enum ScriptedRead {
    Data(Bytes),
    Fault,
}

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    failing_opens: usize,
    failing_writes: usize,
    incoming: VecDeque<ScriptedRead>,
    written: Vec<String>,
    open_count: usize,
    close_count: usize,
}

/// Mock interface for testing without hardware
#[derive(Debug, Clone, Default)]
pub struct MockInterface {
    state: Arc<Mutex<MockState>>,
}

impl MockInterface {
    /// Create a new mock interface
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `open` fail
    pub fn fail_next_opens(&self, n: usize) {
        self.state.lock().failing_opens = n;
    }

    /// Make the next `n` calls to `write` fail and drop the link
    pub fn fail_next_writes(&self, n: usize) {
        self.state.lock().failing_writes = n;
    }

    /// Queue raw bytes returned by a future read
    pub fn queue_incoming(&self, data: impl AsRef<[u8]>) {
        self.state
            .lock()
            .incoming
            .push_back(ScriptedRead::Data(Bytes::copy_from_slice(data.as_ref())));
    }

    /// Queue a line as the gateway sends it (CR LF terminated)
    pub fn queue_line(&self, line: &str) {
        self.queue_incoming(format!("{}\r\n", line));
    }

    /// Queue a read that fails and drops the link
    pub fn queue_read_error(&self) {
        self.state.lock().incoming.push_back(ScriptedRead::Fault);
    }

    /// Lines written by the bridge, in order
    pub fn written(&self) -> Vec<String> {
        self.state.lock().written.clone()
    }

    /// Forget written lines
    pub fn clear_written(&self) {
        self.state.lock().written.clear();
    }

    /// Number of `open` calls so far
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    /// Number of `close` calls so far
    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    /// Whether the mock link is currently open
    pub fn is_open(&self) -> bool {
        self.state.lock().connected
    }
}

#[async_trait]
impl GatewayInterface for MockInterface {
    async fn open(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.open_count += 1;
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(OtgwError::ConnectFailed {
                address: "mock".to_string(),
                reason: "simulated open failure".to_string(),
            });
        }
        state.connected = true;
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.close_count += 1;
    }

    async fn write(&mut self, line: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(OtgwError::NotConnected);
        }
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            state.connected = false;
            return Err(OtgwError::WriteError("simulated write failure".to_string()));
        }
        state.written.push(line.to_string());
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> Result<Bytes> {
        let next = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(OtgwError::NotConnected);
            }
            state.incoming.pop_front()
        };

        match next {
            Some(ScriptedRead::Data(data)) => Ok(data),
            Some(ScriptedRead::Fault) => {
                self.state.lock().connected = false;
                Err(OtgwError::ReadError("simulated read failure".to_string()))
            }
            None => {
                tokio::time::sleep(timeout).await;
                Ok(Bytes::new())
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Records every event handed to the listener
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<DecodedEvent>>>,
}

impl EventLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Listener appending to this log
    pub fn listener(&self) -> Listener {
        let events = Arc::clone(&self.events);
        Arc::new(move |event: &DecodedEvent| {
            events.lock().push(event.clone());
            Ok(())
        })
    }

    /// All recorded events
    pub fn events(&self) -> Vec<DecodedEvent> {
        self.events.lock().clone()
    }

    /// Topics of all recorded events, in order
    pub fn topics(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.topic.clone()).collect()
    }

    /// Payloads of the liveness events, in order
    pub fn liveness(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.is_liveness())
            .map(DecodedEvent::payload)
            .collect()
    }

    /// Number of events recorded for a topic
    pub fn count(&self, topic: &str) -> usize {
        self.events.lock().iter().filter(|e| e.topic == topic).count()
    }

    /// Most recent value recorded for a topic
    pub fn last(&self, topic: &str) -> Option<EventValue> {
        self.events
            .lock()
            .iter()
            .rev()
            .find(|e| e.topic == topic)
            .map(|e| e.value.clone())
    }

    /// Forget recorded events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// Test fixture wiring a mock gateway, a configuration and an event log
pub struct TestFixture {
    /// Mock gateway
    pub interface: MockInterface,
    /// Bridge configuration
    pub config: GatewayConfig,
    /// Events delivered by the bridge
    pub events: EventLog,
}

impl TestFixture {
    /// Create a fixture with the default configuration
    pub fn new() -> Self {
        Self::with_config(GatewayConfigBuilder::new().build())
    }

    /// Create a fixture with a specific configuration
    pub fn with_config(config: GatewayConfig) -> Self {
        Self {
            interface: MockInterface::new(),
            config,
            events: EventLog::new(),
        }
    }

    /// Create a fixture whose gateway already has lines waiting
    pub fn with_incoming_lines(lines: &[&str]) -> Self {
        let fixture = Self::new();
        for line in lines {
            fixture.interface.queue_line(line);
        }
        fixture
    }

    /// Spawn a bridge over the fixture's mock gateway
    pub fn start(&self) -> (BridgeHandle, tokio::task::JoinHandle<Result<()>>) {
        let (bridge, handle) =
            OtgwBridge::new(self.interface.clone(), &self.config, self.events.listener());
        (handle, tokio::spawn(bridge.run()))
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}
