//! Translation between gateway text lines and logical events
//!
//! The gateway emits two kinds of lines:
//!
//! | Shape | Example | Meaning |
//! |-------|---------|---------|
//! | Telemetry | `B40190105` | source, type, reserved, Data-ID, data |
//! | Confirmation | `TT: 19.50` | gateway echo of an accepted command |
//!
//! Decoding never fails: lines that match neither grammar, or confirmations
//! whose value does not validate, produce no events and a log line.
//!
//! Outbound values go the other way through the control point encoders.
//! Encoded commands carry no line terminator; the transport adds its own.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use tracing::{debug, trace, warn};

use crate::error::{OtgwError, Result};
use crate::registry::Registry;

static TELEMETRY_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<source>[BART])(?P<type>[0-9A-F])(?P<res>[0-9A-F])(?P<id>[0-9A-F]{2})(?P<data>[0-9A-F]{4})$",
    )
    .expect("telemetry pattern compiles")
});

static CONFIRMATION_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<code>[A-Z0-9]{2}):\s(?P<value>.*)$").expect("confirmation pattern compiles")
});

/// Message types passed on: write-data from the thermostat, read-ack from the boiler
const ACCEPTED_MESSAGE_TYPES: [u8; 2] = [1, 4];

/// Payload of a decoded event
#[derive(Debug, Clone, PartialEq)]
pub enum EventValue {
    /// Integer value (counters, raw status word, codes)
    Int(i64),
    /// Fixed-point value rounded to two decimals
    Float(f64),
    /// Single flag
    Bool(bool),
    /// Verbatim text (confirmations, liveness, diagnostic fallbacks)
    Text(String),
}

impl fmt::Display for EventValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventValue::Int(value) => write!(f, "{}", value),
            // keeps a trailing ".0" on whole numbers
            EventValue::Float(value) => write!(f, "{:?}", value),
            EventValue::Bool(value) => write!(f, "{}", u8::from(*value)),
            EventValue::Text(value) => f.write_str(value),
        }
    }
}

/// A `(topic, value)` pair produced by the codec or the engine
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    /// Logical topic, without any bus namespace
    pub topic: String,
    /// Event payload
    pub value: EventValue,
}

impl DecodedEvent {
    /// Create a new event
    pub fn new(topic: impl Into<String>, value: EventValue) -> Self {
        Self {
            topic: topic.into(),
            value,
        }
    }

    /// Device presence event (`""` topic with `online`/`offline`)
    pub fn liveness(online: bool) -> Self {
        Self::new(
            "",
            EventValue::Text(if online { "online" } else { "offline" }.to_string()),
        )
    }

    /// Check if this is a device presence event
    pub fn is_liveness(&self) -> bool {
        self.topic.is_empty()
            && matches!(&self.value, EventValue::Text(v) if v == "online" || v == "offline")
    }

    /// Payload rendered the way it is published
    pub fn payload(&self) -> String {
        self.value.to_string()
    }
}

/// A command ready to be written to the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCommand {
    /// Two-letter gateway code
    pub code: &'static str,
    /// Logical command topic
    pub topic: &'static str,
    /// Encoded value, as the gateway will echo it
    pub value: String,
}

impl EncodedCommand {
    /// Render the command line (`TT=19.50`), without terminator
    pub fn line(&self) -> String {
        format!("{}={}", self.code, self.value)
    }
}

impl fmt::Display for EncodedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.code, self.value)
    }
}

/// Stateless codec over a registry
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    registry: &'static Registry,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    /// Create a codec over the standard registry
    pub fn new() -> Self {
        Self::with_registry(Registry::standard())
    }

    /// Create a codec over a specific registry
    pub fn with_registry(registry: &'static Registry) -> Self {
        Self { registry }
    }

    /// The registry this codec resolves against
    pub fn registry(&self) -> &'static Registry {
        self.registry
    }

    /// Decode one line (terminator already stripped) into events
    pub fn decode(&self, line: &str) -> Vec<DecodedEvent> {
        if let Some(caps) = TELEMETRY_LINE.captures(line) {
            return self.decode_telemetry(
                &caps["source"],
                &caps["type"],
                &caps["res"],
                &caps["id"],
                &caps["data"],
            );
        }

        if let Some(caps) = CONFIRMATION_LINE.captures(line) {
            return self.decode_confirmation(&caps["code"], &caps["value"]);
        }

        if self.registry.is_device_error(line) {
            warn!(code = line, "Gateway rejected a command");
        } else if !line.is_empty() {
            debug!("Did not understand message: '{}'", line);
        }
        Vec::new()
    }

    fn decode_telemetry(
        &self,
        source: &str,
        msg_type: &str,
        reserved: &str,
        id: &str,
        data: &str,
    ) -> Vec<DecodedEvent> {
        // all fields are hex by construction of the pattern
        let type_nibble = u8::from_str_radix(msg_type, 16).unwrap_or(0) & 7;
        if source == "R" || !ACCEPTED_MESSAGE_TYPES.contains(&type_nibble) {
            trace!(source, msg_type, id, "Ignoring request line");
            return Vec::new();
        }

        let data_id = u8::from_str_radix(id, 16).unwrap_or(0);
        let raw = u16::from_str_radix(data, 16).unwrap_or(0);

        match self.registry.data_point(data_id) {
            Some(point) => point.decode(raw),
            None => vec![DecodedEvent::new(
                format!("/unknown/{}/{}/{}/{}", source, msg_type, reserved, id),
                EventValue::Text(data.to_string()),
            )],
        }
    }

    fn decode_confirmation(&self, code: &str, value: &str) -> Vec<DecodedEvent> {
        if self.registry.is_device_error(code) {
            warn!(code, value, "Gateway rejected a command");
            return Vec::new();
        }

        let Some(point) = self.registry.control_by_code(code) else {
            debug!(code, "Ignoring response for unknown command code");
            return Vec::new();
        };

        if !point.accepts_response(value) {
            debug!(code, value, "Confirmation value failed validation");
            return Vec::new();
        }

        vec![DecodedEvent::new(
            point.response_topic(),
            EventValue::Text(value.to_string()),
        )]
    }

    /// Encode a raw bus payload for a command topic.
    ///
    /// Returns [`OtgwError::NoEncoder`] when the topic has no control point;
    /// such a command must not be sent.
    pub fn encode(&self, topic: &str, raw: &str) -> Result<EncodedCommand> {
        let point = self
            .registry
            .control_by_topic(topic)
            .ok_or_else(|| OtgwError::NoEncoder(topic.to_string()))?;

        Ok(EncodedCommand {
            code: point.code,
            topic: point.topic,
            value: point.encode(raw),
        })
    }

    /// Re-encode an already encoded value for a pending command topic
    pub fn reencode(&self, topic: &str, value: &str) -> Option<EncodedCommand> {
        self.registry
            .control_by_topic(topic)
            .map(|point| EncodedCommand {
                code: point.code,
                topic: point.topic,
                value: value.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MASTER_SLAVE_STATUS_TOPIC;

    fn find<'a>(events: &'a [DecodedEvent], topic: &str) -> &'a EventValue {
        &events
            .iter()
            .find(|e| e.topic == topic)
            .unwrap_or_else(|| panic!("missing {}", topic))
            .value
    }

    #[test]
    fn test_decode_status_word() {
        let codec = MessageCodec::new();
        let events = codec.decode("B40000105");

        assert_eq!(events.len(), 17);
        assert_eq!(find(&events, MASTER_SLAVE_STATUS_TOPIC), &EventValue::Int(261));
        assert_eq!(find(&events, "/fault/state"), &EventValue::Bool(true));
        assert_eq!(find(&events, "/dhw_active/state"), &EventValue::Bool(true));
        assert_eq!(find(&events, "/ch_enabled/state"), &EventValue::Bool(true));
        assert_eq!(find(&events, "/flame_on/state"), &EventValue::Bool(false));
        assert_eq!(find(&events, "/fault/state").to_string(), "1");
        assert_eq!(find(&events, "/ch_active/state").to_string(), "0");
    }

    #[test]
    fn test_decode_temperature() {
        let codec = MessageCodec::new();
        let events = codec.decode("B40193280");
        assert_eq!(
            events,
            vec![DecodedEvent::new(
                "/boiler_water_temperature",
                EventValue::Float(50.5)
            )]
        );
        assert_eq!(events[0].payload(), "50.5");

        let events = codec.decode("T1101814C0");
        assert!(events.is_empty(), "too long for the telemetry grammar");

        let events = codec.decode("T101814C0");
        assert_eq!(events[0].topic, "/room_temperature");
        assert_eq!(events[0].payload(), "20.75");
    }

    #[test]
    fn test_decode_filters_requests() {
        let codec = MessageCodec::new();
        // read-data from the thermostat
        assert!(codec.decode("T00190000").is_empty());
        // answers to the gateway's own requests
        assert!(codec.decode("R40193280").is_empty());
        // parity bit set on a read-ack still counts as read-ack
        assert_eq!(codec.decode("BC0193280").len(), 1);
    }

    #[test]
    fn test_unknown_data_id_fallback() {
        let codec = MessageCodec::new();
        let events = codec.decode("A40C80A0B");

        assert_eq!(
            events,
            vec![DecodedEvent::new(
                "/unknown/A/4/0/C8",
                EventValue::Text("0A0B".to_string())
            )]
        );
    }

    #[test]
    fn test_decode_confirmation() {
        let codec = MessageCodec::new();
        let events = codec.decode("TT: 19.50");
        assert_eq!(
            events,
            vec![DecodedEvent::new(
                "/command_response/room_setpoint/temporary",
                EventValue::Text("19.50".to_string())
            )]
        );

        assert_eq!(codec.decode("HW: 1")[0].topic, "/command_response/hot_water/enable");
    }

    #[test]
    fn test_confirmation_rejects() {
        let codec = MessageCodec::new();
        // fails validation
        assert!(codec.decode("TT: 19.5").is_empty());
        assert!(codec.decode("OT: -3.00").is_empty());
        // unknown code
        assert!(codec.decode("ZZ: 1").is_empty());
        // device error acknowledgements
        assert!(codec.decode("NG: TT").is_empty());
        assert!(codec.decode("SE").is_empty());
    }

    #[test]
    fn test_malformed_lines_yield_nothing() {
        let codec = MessageCodec::new();
        for line in ["", "hello", "B4019328", "b40193280", "TT:19.50", "OpenTherm Gateway 4.2.5"] {
            assert!(codec.decode(line).is_empty(), "{:?}", line);
        }
    }

    #[test]
    fn test_encode() {
        let codec = MessageCodec::new();
        let cmd = codec.encode("/room_setpoint/temporary", "19.5").unwrap();
        assert_eq!(cmd.code, "TT");
        assert_eq!(cmd.value, "19.50");
        assert_eq!(cmd.line(), "TT=19.50");
        assert_eq!(cmd.to_string(), "TT=19.50");

        let cmd = codec.encode("/hot_water/enable", "true").unwrap();
        assert_eq!(cmd.line(), "HW=1");
    }

    #[test]
    fn test_encode_unknown_topic() {
        let codec = MessageCodec::new();
        let err = codec.encode("/does/not/exist", "1").unwrap_err();
        assert!(matches!(err, OtgwError::NoEncoder(topic) if topic == "/does/not/exist"));
        assert!(codec.reencode("/does/not/exist", "1").is_none());
    }

    #[test]
    fn test_liveness_event() {
        let online = DecodedEvent::liveness(true);
        assert!(online.is_liveness());
        assert_eq!(online.payload(), "online");
        assert!(DecodedEvent::liveness(false).is_liveness());
        assert!(!DecodedEvent::new("", EventValue::Text("x".into())).is_liveness());
    }
}
