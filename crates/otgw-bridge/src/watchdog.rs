//! Silent link detection
//!
//! A gateway that stops talking without the transport reporting an error
//! (a hung serial adapter, a half-open TCP session) would otherwise leave the
//! bridge connected forever. The watchdog is fed for every event received;
//! when it starves for `data_timeout` it forces a reconnect and re-arms.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bridge::BridgeHandle;
use crate::interface::ConnectionState;

/// Forces a reconnect when no data arrives for a while
#[derive(Debug, Clone)]
pub struct Watchdog {
    timeout: Duration,
    fed: Arc<Notify>,
}

impl Watchdog {
    /// Create a watchdog with the given silence threshold
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            fed: Arc::new(Notify::new()),
        }
    }

    /// Reset the timer
    pub fn feed(&self) {
        self.fed.notify_one();
    }

    /// Silence threshold
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start watching a bridge
    ///
    /// The task ends once the bridge worker is gone.
    pub fn spawn(&self, handle: BridgeHandle) -> JoinHandle<()> {
        let timeout = self.timeout;
        let fed = Arc::clone(&self.fed);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = fed.notified() => continue,
                    _ = tokio::time::sleep(timeout) => {}
                }

                if !handle.is_running() {
                    debug!("Bridge stopped, watchdog exiting");
                    break;
                }
                if handle.state() != ConnectionState::Connected {
                    continue;
                }

                warn!(timeout = ?timeout, "No data received from gateway, reconnecting");
                if handle.force_reconnect().is_err() {
                    break;
                }
            }
        })
    }
}
