//! Static protocol tables for the OpenTherm Gateway
//!
//! This module provides the read-only mappings the codec works from:
//!
//! - **Data points**: OpenTherm Data-ID → topic + value decoder
//! - **Control points**: command topic ↔ two-letter gateway code, with the
//!   encoder for outbound values and the pattern a confirmation must match
//!
//! # Firmware
//!
//! The tables follow the OTGW firmware 4.2.5 command set. A firmware grammar
//! change means editing these tables, not the engine.
//!
//! # Confirmation patterns
//!
//! Temperature encoders accept negative values (the gateway allows
//! -40.00..64.00 for `OT`), while the shared confirmation pattern only
//! matches unsigned `D{1,2}.DD`. A negative setpoint is therefore sent but
//! never confirmed, and ends up expiring through the retry path.

use chrono::Local;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use crate::codec::{DecodedEvent, EventValue};

/// Topic marker prepended to the topic of a confirmed command
pub const COMMAND_RESPONSE_MARKER: &str = "/command_response";

/// Topic carrying the raw master/slave status word (Data-ID 0)
pub const MASTER_SLAVE_STATUS_TOPIC: &str = "/master_slave_status";

/// Two-letter codes the gateway uses to reject a command
pub const DEVICE_ERROR_CODES: &[&str] = &["NG", "SE", "BV", "OR", "NS", "NF", "OE"];

/// Bus payloads read as "on" by switch encoders
pub const TRUE_VALUES: &[&str] = &["True", "true", "1", "y", "yes"];

/// Bus payloads read as "off" by switch encoders
pub const FALSE_VALUES: &[&str] = &["False", "false", "0", "n", "no"];

/// Flag names of the Data-ID 0 status word, indexed by bit number.
///
/// The low byte carries the slave (boiler) flags, the high byte the master
/// (thermostat) flags.
pub const STATUS_BITS: [&str; 16] = [
    "fault",
    "ch_active",
    "dhw_active",
    "flame_on",
    "cooling_active",
    "ch2_active",
    "diagnostic_event",
    "electricity_production",
    "ch_enabled",
    "dhw_enabled",
    "cooling_enabled",
    "otc_active",
    "ch2_enabled",
    "summer_mode",
    "dhw_blocking",
    "master_reserved",
];

const FLOAT_RESPONSE: &str = r"^\d{1,2}\.\d{2}$";
const LEVEL_RESPONSE: &str = r"^(\d{1,3}|T)$";
const CLOCK_RESPONSE: &str = r"^\d{1,2}:\d{2}/[1-7]$";

static CLOCK_INPUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([01]?\d|2[0-3]):[0-5]\d/[1-7]$").expect("clock pattern compiles")
});

static STANDARD: Lazy<Registry> = Lazy::new(Registry::build);

// ============================================================================
// Data points
// ============================================================================

/// Value shape of an OpenTherm data field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    /// Master/slave status word: raw value plus one flag per bit
    StatusFlags,
    /// Signed fixed point, 8 integer bits and 8 fraction bits
    F88,
    /// Unsigned 16-bit counter
    U16,
    /// Signed 16-bit integer
    S16,
}

/// Registry entry for a known Data-ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPoint {
    /// OpenTherm Data-ID
    pub id: u8,
    /// Logical topic
    pub topic: &'static str,
    /// How the 16-bit data field is interpreted
    pub kind: DataKind,
}

impl DataPoint {
    /// Decode the 16-bit data field into one or more events
    pub fn decode(&self, raw: u16) -> Vec<DecodedEvent> {
        match self.kind {
            DataKind::StatusFlags => {
                let mut events = Vec::with_capacity(STATUS_BITS.len() + 1);
                events.push(DecodedEvent::new(self.topic, EventValue::Int(raw as i64)));
                for (bit, name) in STATUS_BITS.iter().enumerate() {
                    events.push(DecodedEvent::new(
                        format!("/{}/state", name),
                        EventValue::Bool(raw & (1 << bit) != 0),
                    ));
                }
                events
            }
            DataKind::F88 => {
                let value = (raw as i16) as f64 / 256.0;
                vec![DecodedEvent::new(
                    self.topic,
                    EventValue::Float((value * 100.0).round() / 100.0),
                )]
            }
            DataKind::U16 => vec![DecodedEvent::new(self.topic, EventValue::Int(raw as i64))],
            DataKind::S16 => vec![DecodedEvent::new(
                self.topic,
                EventValue::Int((raw as i16) as i64),
            )],
        }
    }
}

const DATA_POINTS: &[(u8, &str, DataKind)] = &[
    (0, MASTER_SLAVE_STATUS_TOPIC, DataKind::StatusFlags),
    (1, "/control_setpoint", DataKind::F88),
    (9, "/remote_override_setpoint", DataKind::F88),
    (14, "/max_relative_modulation_level", DataKind::F88),
    (16, "/room_setpoint", DataKind::F88),
    (17, "/relative_modulation_level", DataKind::F88),
    (18, "/ch_water_pressure", DataKind::F88),
    (19, "/dhw_flow_rate", DataKind::F88),
    (24, "/room_temperature", DataKind::F88),
    (25, "/boiler_water_temperature", DataKind::F88),
    (26, "/dhw_temperature", DataKind::F88),
    (27, "/outside_temperature", DataKind::F88),
    (28, "/return_water_temperature", DataKind::F88),
    (33, "/exhaust_temperature", DataKind::S16),
    (56, "/dhw_setpoint", DataKind::F88),
    (57, "/max_ch_water_setpoint", DataKind::F88),
    (116, "/burner_starts", DataKind::U16),
    (117, "/ch_pump_starts", DataKind::U16),
    (118, "/dhw_pump_starts", DataKind::U16),
    (119, "/dhw_burner_starts", DataKind::U16),
    (120, "/burner_operation_hours", DataKind::U16),
    (121, "/ch_pump_operation_hours", DataKind::U16),
    (122, "/dhw_pump_valve_operation_hours", DataKind::U16),
    (123, "/dhw_burner_operation_hours", DataKind::U16),
];

// ============================================================================
// Control points
// ============================================================================

/// Converts a raw bus payload into the value part of a gateway command.
///
/// Encoders never fail: unusable input maps to a per-point fallback, which
/// mirrors the tolerant command grammar of the gateway firmware.
#[derive(Debug, Clone, PartialEq)]
pub enum Encoder {
    /// Temperature with two decimals
    Float {
        /// Value sent when the input is not a number
        fallback: f64,
    },
    /// On/off switch with optional extra letter modes
    Switch {
        /// Additional single-letter values passed through (uppercased)
        extra: &'static [&'static str],
        /// Value sent when the input is not recognised
        fallback: &'static str,
    },
    /// Integer level clamped to `0..=max`
    Level {
        /// Upper bound
        max: u16,
        /// Value sent when the input is not a number
        fallback: &'static str,
    },
    /// Clock in `HH:MM/D` form (D = ISO weekday)
    Clock,
}

impl Encoder {
    /// Encode a raw bus payload
    pub fn encode(&self, raw: &str) -> String {
        let raw = raw.trim();
        match self {
            Encoder::Float { fallback } => {
                let value = raw
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .unwrap_or(*fallback);
                format!("{:.2}", value)
            }
            Encoder::Switch { extra, fallback } => {
                if TRUE_VALUES.contains(&raw) {
                    "1".to_string()
                } else if FALSE_VALUES.contains(&raw) {
                    "0".to_string()
                } else {
                    let upper = raw.to_ascii_uppercase();
                    if extra.contains(&upper.as_str()) {
                        upper
                    } else {
                        (*fallback).to_string()
                    }
                }
            }
            Encoder::Level { max, fallback } => match raw.parse::<f64>() {
                Ok(value) if value.is_finite() => {
                    (value.round().clamp(0.0, *max as f64) as u16).to_string()
                }
                _ => (*fallback).to_string(),
            },
            Encoder::Clock => {
                if CLOCK_INPUT.is_match(raw) {
                    raw.to_string()
                } else {
                    Local::now().format("%H:%M/%u").to_string()
                }
            }
        }
    }
}

/// Registry entry for a gateway command
#[derive(Debug, Clone)]
pub struct ControlPoint {
    /// Two-letter gateway code
    pub code: &'static str,
    /// Logical command topic
    pub topic: &'static str,
    /// Outbound value encoder
    pub encoder: Encoder,
    /// Pattern a confirmation value must match
    pub response: Regex,
}

impl ControlPoint {
    fn new(code: &'static str, topic: &'static str, encoder: Encoder, pattern: &str) -> Self {
        Self {
            code,
            topic,
            encoder,
            response: Regex::new(pattern).expect("response pattern compiles"),
        }
    }

    /// Encode a raw payload into the value part of the command
    pub fn encode(&self, raw: &str) -> String {
        self.encoder.encode(raw)
    }

    /// Render the command line for an already encoded value
    pub fn command(&self, value: &str) -> String {
        format!("{}={}", self.code, value)
    }

    /// Check a confirmation value against the response pattern
    pub fn accepts_response(&self, value: &str) -> bool {
        self.response.is_match(value)
    }

    /// Topic under which confirmations for this point are published
    pub fn response_topic(&self) -> String {
        format!("{}{}", COMMAND_RESPONSE_MARKER, self.topic)
    }
}

fn control_points() -> Vec<ControlPoint> {
    vec![
        // 0 cancels the override
        ControlPoint::new(
            "TT",
            "/room_setpoint/temporary",
            Encoder::Float { fallback: 0.0 },
            FLOAT_RESPONSE,
        ),
        ControlPoint::new(
            "TC",
            "/room_setpoint/constant",
            Encoder::Float { fallback: 0.0 },
            FLOAT_RESPONSE,
        ),
        // values outside -40..64 clear the outside temperature
        ControlPoint::new(
            "OT",
            "/outside_temperature",
            Encoder::Float { fallback: 99.0 },
            FLOAT_RESPONSE,
        ),
        ControlPoint::new(
            "SW",
            "/hot_water/setpoint",
            Encoder::Float { fallback: 60.0 },
            FLOAT_RESPONSE,
        ),
        ControlPoint::new(
            "SH",
            "/central_heating/max_setpoint",
            Encoder::Float { fallback: 60.0 },
            FLOAT_RESPONSE,
        ),
        // 0 hands control back to the thermostat
        ControlPoint::new(
            "CS",
            "/control_setpoint",
            Encoder::Float { fallback: 0.0 },
            FLOAT_RESPONSE,
        ),
        ControlPoint::new(
            "HW",
            "/hot_water/enable",
            Encoder::Switch {
                extra: &["T", "P"],
                fallback: "T",
            },
            r"^[01TP]$",
        ),
        ControlPoint::new(
            "CH",
            "/central_heating/enable",
            Encoder::Switch {
                extra: &[],
                fallback: "1",
            },
            r"^[01]$",
        ),
        ControlPoint::new(
            "MM",
            "/max_modulation",
            Encoder::Level {
                max: 100,
                fallback: "T",
            },
            LEVEL_RESPONSE,
        ),
        ControlPoint::new(
            "VS",
            "/ventilation_setpoint",
            Encoder::Level {
                max: 100,
                fallback: "T",
            },
            LEVEL_RESPONSE,
        ),
        ControlPoint::new("SC", "/set_clock", Encoder::Clock, CLOCK_RESPONSE),
        ControlPoint::new(
            "GW",
            "/gateway_mode",
            Encoder::Switch {
                extra: &["R"],
                fallback: "1",
            },
            r"^[01R]$",
        ),
        ControlPoint::new(
            "PM",
            "/priority_message",
            Encoder::Level {
                max: 255,
                fallback: "0",
            },
            r"^\d{1,3}$",
        ),
    ]
}

// ============================================================================
// Registry
// ============================================================================

/// Read-only lookup tables, keyed by Data-ID, command topic and code
#[derive(Debug)]
pub struct Registry {
    data_points: HashMap<u8, DataPoint>,
    controls: Vec<ControlPoint>,
    by_topic: HashMap<&'static str, usize>,
    by_code: HashMap<&'static str, usize>,
}

impl Registry {
    /// The registry for the supported firmware, built once per process
    pub fn standard() -> &'static Registry {
        &STANDARD
    }

    fn build() -> Self {
        let data_points = DATA_POINTS
            .iter()
            .map(|&(id, topic, kind)| (id, DataPoint { id, topic, kind }))
            .collect();

        let controls = control_points();
        let mut by_topic = HashMap::with_capacity(controls.len());
        let mut by_code = HashMap::with_capacity(controls.len());
        for (index, point) in controls.iter().enumerate() {
            by_topic.insert(point.topic, index);
            by_code.insert(point.code, index);
        }

        Self {
            data_points,
            controls,
            by_topic,
            by_code,
        }
    }

    /// Look up the decoder for a Data-ID
    pub fn data_point(&self, id: u8) -> Option<&DataPoint> {
        self.data_points.get(&id)
    }

    /// Look up a control point by its command topic
    pub fn control_by_topic(&self, topic: &str) -> Option<&ControlPoint> {
        self.by_topic.get(topic).map(|&index| &self.controls[index])
    }

    /// Look up a control point by its two-letter code
    pub fn control_by_code(&self, code: &str) -> Option<&ControlPoint> {
        self.by_code.get(code).map(|&index| &self.controls[index])
    }

    /// Map a confirmation topic back to the control point that produced it
    pub fn control_for_response_topic(&self, topic: &str) -> Option<&ControlPoint> {
        topic
            .strip_prefix(COMMAND_RESPONSE_MARKER)
            .and_then(|base| self.control_by_topic(base))
    }

    /// Check whether a code is a gateway error acknowledgement
    pub fn is_device_error(&self, code: &str) -> bool {
        DEVICE_ERROR_CODES.contains(&code)
    }

    /// Iterate over all control points in table order
    pub fn control_points(&self) -> impl Iterator<Item = &ControlPoint> {
        self.controls.iter()
    }

    /// Number of known Data-IDs
    pub fn data_point_count(&self) -> usize {
        self.data_points.len()
    }
}
