//! Pending command tracking
//!
//! Commands sent to the gateway stay pending until the gateway echoes them
//! back as a confirmation line. Every decoded event triggers a sweep over the
//! pending set that resends timed-out commands and expires the ones that ran
//! out of retries.
//!
//! The tracker is owned by the bridge worker and mutated through `&mut self`
//! only, so events are reconciled strictly one at a time.

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{DecodedEvent, EventValue};
use crate::config::CommandConfig;
use crate::registry::Registry;

/// Topic of the diagnostic event emitted after every sweep
pub const COMMAND_STATUS_TOPIC: &str = "/command_status";

/// A command awaiting confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    /// Command topic (without namespace)
    pub topic: String,
    /// Encoded value last sent
    pub payload: String,
    /// When the value was last written
    pub last_sent: Instant,
    /// Resends since the command was submitted or refreshed
    pub retry_count: u32,
}

/// What the caller must do after submitting a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// New pending entry, send the command
    Sent,
    /// Same value already in flight, do not send again
    Deduped,
    /// Replaced a pending entry with a different value, send the command
    Superseded,
}

impl SubmitOutcome {
    /// Whether the command has to be written to the gateway
    pub fn should_send(&self) -> bool {
        !matches!(self, SubmitOutcome::Deduped)
    }
}

/// Outcome of a sweep, reported as the code of the last evaluated entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandStatus {
    /// Nothing pending
    Idle = 0,
    /// Pending entries are still within their timeout
    Waiting = 1,
    /// Pending entry has no control point
    NoEncoder = 2,
    /// Pending entry dropped after too many resends
    RetriesExhausted = 3,
    /// Pending entry was resent
    Resent = 4,
}

impl CommandStatus {
    /// Numeric code as published on the status topic
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandStatus::Idle => write!(f, "idle"),
            CommandStatus::Waiting => write!(f, "waiting"),
            CommandStatus::NoEncoder => write!(f, "no encoder"),
            CommandStatus::RetriesExhausted => write!(f, "retries exhausted"),
            CommandStatus::Resent => write!(f, "resent"),
        }
    }
}

/// Result of reconciling one event against the pending set
#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    /// Status of the last evaluated entry
    pub status: CommandStatus,
    /// Topic confirmed by the event, if any
    pub confirmed: Option<String>,
    /// Command lines to write again, in pending order
    pub resend: Vec<String>,
    /// Topics dropped during this sweep
    pub expired: Vec<String>,
}

impl SweepReport {
    /// Diagnostic event carrying the status code
    pub fn status_event(&self) -> DecodedEvent {
        DecodedEvent::new(
            COMMAND_STATUS_TOPIC,
            EventValue::Int(i64::from(self.status.code())),
        )
    }
}

/// Tracks commands until the gateway confirms them
#[derive(Debug)]
pub struct CommandTracker {
    pending: Vec<PendingCommand>,
    max_retries: u32,
    timeout: Duration,
    registry: &'static Registry,
}

impl CommandTracker {
    /// Create a tracker over the standard registry
    pub fn new(config: &CommandConfig) -> Self {
        Self::with_registry(config, Registry::standard())
    }

    /// Create a tracker over a specific registry
    pub fn with_registry(config: &CommandConfig, registry: &'static Registry) -> Self {
        Self {
            pending: Vec::new(),
            max_retries: config.max_retries,
            timeout: config.timeout,
            registry,
        }
    }

    /// Record a command about to be sent
    pub fn submit(&mut self, topic: &str, payload: &str, now: Instant) -> SubmitOutcome {
        match self.pending.iter_mut().find(|p| p.topic == topic) {
            Some(entry) if entry.payload == payload => {
                entry.retry_count = 0;
                debug!(topic, payload, "Command already pending");
                SubmitOutcome::Deduped
            }
            Some(entry) => {
                debug!(topic, old = %entry.payload, new = payload, "Superseding pending command");
                entry.payload = payload.to_string();
                entry.last_sent = now;
                entry.retry_count = 0;
                SubmitOutcome::Superseded
            }
            None => {
                self.pending.push(PendingCommand {
                    topic: topic.to_string(),
                    payload: payload.to_string(),
                    last_sent: now,
                    retry_count: 0,
                });
                SubmitOutcome::Sent
            }
        }
    }

    /// Reconcile a decoded event, then sweep the pending set
    pub fn on_event(&mut self, event: &DecodedEvent, now: Instant) -> SweepReport {
        let registry = self.registry;
        let confirmed = registry
            .control_for_response_topic(&event.topic)
            .and_then(|point| self.confirm(point.topic, &event.payload()));

        let mut report = self.sweep(now);
        report.confirmed = confirmed;
        report
    }

    fn confirm(&mut self, topic: &str, payload: &str) -> Option<String> {
        let index = self
            .pending
            .iter()
            .position(|p| p.topic == topic && p.payload == payload)?;
        let entry = self.pending.remove(index);
        debug!(topic = %entry.topic, payload = %entry.payload, "Command confirmed");
        Some(entry.topic)
    }

    /// Resend timed-out commands and drop the ones that cannot succeed
    pub fn sweep(&mut self, now: Instant) -> SweepReport {
        let mut status = CommandStatus::Idle;
        let mut resend = Vec::new();
        let mut expired = Vec::new();
        let registry = self.registry;
        let max_retries = self.max_retries;
        let timeout = self.timeout;

        self.pending.retain_mut(|entry| {
            let Some(point) = registry.control_by_topic(&entry.topic) else {
                warn!(topic = %entry.topic, "Dropping pending command without encoder");
                status = CommandStatus::NoEncoder;
                expired.push(entry.topic.clone());
                return false;
            };

            if now.saturating_duration_since(entry.last_sent) <= timeout {
                status = CommandStatus::Waiting;
                return true;
            }

            if entry.retry_count >= max_retries {
                warn!(
                    topic = %entry.topic,
                    payload = %entry.payload,
                    retries = entry.retry_count,
                    "Command not confirmed, giving up"
                );
                status = CommandStatus::RetriesExhausted;
                expired.push(entry.topic.clone());
                return false;
            }

            entry.retry_count += 1;
            entry.last_sent = now;
            info!(
                topic = %entry.topic,
                payload = %entry.payload,
                retry = entry.retry_count,
                "Resending unconfirmed command"
            );
            resend.push(point.command(&entry.payload));
            status = CommandStatus::Resent;
            true
        });

        SweepReport {
            status,
            confirmed: None,
            resend,
            expired,
        }
    }

    /// Reset every retry counter, used after the link was re-established
    ///
    /// Send timestamps are kept, so a command that timed out during the
    /// outage is resent on the next sweep.
    pub fn refresh_all(&mut self) {
        for entry in &mut self.pending {
            entry.retry_count = 0;
        }
    }

    /// Look up the pending entry for a topic
    pub fn get(&self, topic: &str) -> Option<&PendingCommand> {
        self.pending.iter().find(|p| p.topic == topic)
    }

    /// Pending entries in submission order
    pub fn pending(&self) -> &[PendingCommand] {
        &self.pending
    }

    /// Number of pending commands
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
