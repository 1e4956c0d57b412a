//! Integration tests for the gateway bridge
//!
//! These tests verify end-to-end behaviour through the public API:
//! - Gateway lines flowing through codec and tracker to the listener
//! - Command submission, deduplication, confirmation and expiry
//! - Reconnect sequence and liveness events
//! - Containment of malformed input

use otgw_bridge::{
    CommandStatus, CommandTracker, ConnectionState, DecodedEvent, EventValue,
    GatewayConfig, GatewayConfigBuilder, LineBuffer, MessageCodec, OtgwError, SubmitOutcome,
    TestFixture, COMMAND_STATUS_TOPIC, MASTER_SLAVE_STATUS_TOPIC,
};
use std::time::Duration;
use tokio::time::Instant;

const ROOM_SETPOINT: &str = "/room_setpoint/temporary";

async fn advance(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

fn quick_retry_config(max_retries: u32) -> GatewayConfig {
    GatewayConfigBuilder::new()
        .max_retries(max_retries)
        .command_timeout(Duration::from_secs(5))
        .reconnect_pause(Duration::from_secs(10))
        .build()
}

// ============================================================================
// Decoding
// ============================================================================

#[test]
fn test_status_word_decodes_every_flag() {
    let codec = MessageCodec::new();
    let events = codec.decode("B40000105");

    assert_eq!(events.len(), 17);
    assert_eq!(
        events[0],
        DecodedEvent::new(MASTER_SLAVE_STATUS_TOPIC, EventValue::Int(261))
    );

    let set: Vec<&str> = events[1..]
        .iter()
        .filter(|e| e.value == EventValue::Bool(true))
        .map(|e| e.topic.as_str())
        .collect();
    assert_eq!(set, vec!["/fault/state", "/dhw_active/state", "/ch_enabled/state"]);
    assert!(events[1..].iter().all(|e| e.topic.ends_with("/state")));
}

#[test]
fn test_unknown_data_id_yields_one_diagnostic() {
    let codec = MessageCodec::new();
    let events = codec.decode("T1070BEEF");

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].topic, "/unknown/T/1/0/70");
    assert_eq!(events[0].value, EventValue::Text("BEEF".to_string()));
}

#[test]
fn test_line_extraction_collapses_terminator_runs() {
    let mut buffer = LineBuffer::new();
    buffer.extend(b"AB: x\r\n\r\n\nCD: y\r");

    let mut lines = Vec::new();
    while let Some(line) = buffer.next_line() {
        lines.push(line);
    }
    assert_eq!(lines, vec!["AB: x", "CD: y"]);

    buffer.extend(b"EF: z");
    assert_eq!(buffer.next_line(), None);
    assert_eq!(buffer.remainder(), b"EF: z");
}

// ============================================================================
// Command tracking
// ============================================================================

#[test]
fn test_same_command_twice_is_one_pending_entry() {
    let config = quick_retry_config(4);
    let mut tracker = CommandTracker::new(&config.commands);
    let now = Instant::now();

    assert_eq!(tracker.submit(ROOM_SETPOINT, "19.50", now), SubmitOutcome::Sent);
    assert_eq!(tracker.submit(ROOM_SETPOINT, "19.50", now), SubmitOutcome::Deduped);
    assert_eq!(tracker.len(), 1);
    assert_eq!(tracker.get(ROOM_SETPOINT).unwrap().retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_command_is_sent_once() {
    let fixture = TestFixture::new();
    let (handle, _task) = fixture.start();

    handle.command(ROOM_SETPOINT, "19.5").unwrap();
    handle.command(ROOM_SETPOINT, "19.5").unwrap();
    advance(1).await;

    assert_eq!(fixture.interface.written(), vec!["TT=19.50"]);
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_command_is_resent_then_expired() {
    let fixture = TestFixture::with_config(quick_retry_config(2));
    let (handle, _task) = fixture.start();

    handle.command(ROOM_SETPOINT, "19.5").unwrap();
    advance(1).await;
    assert_eq!(fixture.interface.written().len(), 1);

    // every sweep needs an incoming event
    let mut codes = Vec::new();
    for _ in 0..4 {
        advance(6).await;
        fixture.interface.queue_line("B40193280");
        advance(1).await;
        codes.push(fixture.events.last(COMMAND_STATUS_TOPIC));
    }

    assert_eq!(
        codes,
        vec![
            Some(EventValue::Int(CommandStatus::Resent.code().into())),
            Some(EventValue::Int(CommandStatus::Resent.code().into())),
            Some(EventValue::Int(CommandStatus::RetriesExhausted.code().into())),
            Some(EventValue::Int(CommandStatus::Idle.code().into())),
        ]
    );
    assert_eq!(
        fixture.interface.written(),
        vec!["TT=19.50", "TT=19.50", "TT=19.50"]
    );

    let stats = handle.stats();
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.expired_commands, 1);
    assert_eq!(stats.commands_sent, 3);
}

#[tokio::test(start_paused = true)]
async fn test_default_retries_write_command_five_times() {
    let fixture = TestFixture::new();
    let (handle, _task) = fixture.start();

    handle.command(ROOM_SETPOINT, "19.5").unwrap();
    for _ in 0..6 {
        advance(6).await;
        fixture.interface.queue_line("B40193280");
        advance(1).await;
    }

    assert_eq!(fixture.interface.written().len(), 5);
    let stats = handle.stats();
    assert_eq!(stats.retries, 4);
    assert_eq!(stats.expired_commands, 1);
}

#[tokio::test(start_paused = true)]
async fn test_confirmation_stops_resends() {
    let fixture = TestFixture::new();
    let (handle, _task) = fixture.start();

    handle.command("/central_heating/enable", "no").unwrap();
    advance(1).await;
    fixture.interface.queue_line("CH: 0");
    advance(1).await;

    assert_eq!(
        fixture.events.last("/command_response/central_heating/enable"),
        Some(EventValue::Text("0".to_string()))
    );

    advance(10).await;
    fixture.interface.queue_line("B40193280");
    advance(1).await;

    assert_eq!(fixture.interface.written(), vec!["CH=0"]);
    assert_eq!(
        fixture.events.last(COMMAND_STATUS_TOPIC),
        Some(EventValue::Int(0))
    );
    assert_eq!(handle.stats().confirmations, 1);
}

#[tokio::test(start_paused = true)]
async fn test_superseding_command_is_sent() {
    let fixture = TestFixture::new();
    let (handle, _task) = fixture.start();

    handle.command(ROOM_SETPOINT, "19.5").unwrap();
    handle.command(ROOM_SETPOINT, "21").unwrap();
    advance(1).await;

    // the old value is no longer pending, its confirmation does nothing
    fixture.interface.queue_line("TT: 19.50");
    advance(1).await;

    assert_eq!(fixture.interface.written(), vec!["TT=19.50", "TT=21.00"]);
    assert_eq!(handle.stats().confirmations, 0);
    assert_eq!(
        fixture.events.last(COMMAND_STATUS_TOPIC),
        Some(EventValue::Int(1))
    );
}

// ============================================================================
// Connection lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_reconnect_sequence_reports_each_failed_attempt() {
    let fixture = TestFixture::with_config(quick_retry_config(4));
    fixture.interface.fail_next_opens(2);
    let (handle, _task) = fixture.start();

    advance(1).await;
    assert_eq!(fixture.events.liveness(), vec!["offline"]);
    assert_eq!(handle.state(), ConnectionState::Reconnecting);

    advance(10).await;
    assert_eq!(fixture.events.liveness(), vec!["offline", "offline"]);

    advance(10).await;
    assert_eq!(
        fixture.events.liveness(),
        vec!["offline", "offline", "online"]
    );
    assert_eq!(fixture.interface.open_count(), 3);
    assert_eq!(handle.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_pending_commands_survive_reconnect() {
    let fixture = TestFixture::with_config(quick_retry_config(1));
    let (handle, _task) = fixture.start();

    handle.command(ROOM_SETPOINT, "19.5").unwrap();
    advance(6).await;
    fixture.interface.queue_line("B40193280");
    advance(1).await;
    assert_eq!(fixture.interface.written().len(), 2);

    fixture.interface.queue_read_error();
    advance(1).await;
    assert_eq!(handle.stats().reconnects, 1);

    // the reconnect reset the retry counter, so this is a resend and not an expiry
    advance(6).await;
    fixture.interface.queue_line("B40193280");
    advance(1).await;
    assert_eq!(fixture.interface.written().len(), 3);
    assert_eq!(
        fixture.events.last(COMMAND_STATUS_TOPIC),
        Some(EventValue::Int(4))
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_reconnect_pause() {
    let fixture = TestFixture::new();
    fixture.interface.fail_next_opens(usize::MAX);
    let (handle, task) = fixture.start();

    advance(1).await;
    handle.shutdown();
    task.await.unwrap().unwrap();

    assert_eq!(fixture.events.liveness(), vec!["offline"]);
    assert_eq!(handle.state(), ConnectionState::Disconnected);
}

// ============================================================================
// Malformed input
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_malformed_lines_do_not_stop_processing() {
    let fixture = TestFixture::with_incoming_lines(&[
        "OpenTherm Gateway 4.2.5",
        "B4019",
        "XX: what",
        "NG",
        "B40193280",
    ]);
    let (handle, _task) = fixture.start();
    advance(1).await;

    let stats = handle.stats();
    assert_eq!(stats.lines_received, 5);
    assert_eq!(stats.undecodable_lines, 4);
    assert_eq!(
        fixture.events.last("/boiler_water_temperature"),
        Some(EventValue::Float(50.5))
    );
    assert_eq!(handle.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_bytes_split_across_reads() {
    let fixture = TestFixture::new();
    fixture.interface.queue_incoming("B401");
    fixture.interface.queue_incoming("93280\r");
    fixture.interface.queue_incoming("\nT101814C0\n");
    let (_handle, _task) = fixture.start();
    advance(2).await;

    assert_eq!(
        fixture.events.last("/boiler_water_temperature"),
        Some(EventValue::Float(50.5))
    );
    assert_eq!(
        fixture.events.last("/room_temperature"),
        Some(EventValue::Float(20.75))
    );
}

#[test]
fn test_encode_without_control_point() {
    let err = MessageCodec::new().encode("/hot_water/temperature", "50").unwrap_err();
    assert!(matches!(err, OtgwError::NoEncoder(_)));
    assert_eq!(err.error_code(), "NO_ENCODER");
}
