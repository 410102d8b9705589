//! Sessions against a fake port agent

use crate::common::*;
use seacomm_core::core::chunker::{MarkerSieve, RecordMarker};
use seacomm_core::core::parser::RecordParser;
use seacomm_core::core::protocol::port_agent::{read_packet, PacketType, WirePacket};
use seacomm_core::core::sample::{FieldValue, Sample, SampleDecoder};
use seacomm_core::core::session::{
    CommandRequest, FramingMode, Prompt, SessionBuilder, SessionError, SessionEvent, SessionSettings,
};
use seacomm_core::core::state_machine::StateMachineError;
use seacomm_core::core::timebase::{CounterTimeBase, TimeBaseSettings};
use seacomm_core::core::transport::WritePolicy;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

fn timebase() -> CounterTimeBase {
    let settings = TimeBaseSettings {
        tick_rate: 2.0,
        counter_width: 16,
        rollover_tolerance: 2.1,
    };
    CounterTimeBase::new(settings, epoch())
}

fn tick_session(framing: FramingMode) -> SessionBuilder<State, Event, ()> {
    SessionBuilder::new("tick", ctd_machine(), ())
        .sieve(MarkerSieve::new(
            vec![RecordMarker::new(0xCB, TICK_RECORD_LEN)],
            tick_trailer(),
        ))
        .schema(tick_schema())
        .timebase(timebase())
        .settings(SessionSettings {
            framing,
            ..SessionSettings::default()
        })
}

#[tokio::test]
async fn test_command_flow_and_autosample() {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (commands_tx, mut commands) = mpsc::unbounded_channel();
    tokio::spawn(fake_ctd(remote, commands_tx, vec![20.1, 20.2, 20.3]));

    let sink = Arc::new(RecordingSink::default());
    let session = ctd_session("ctd").sink(sink.clone()).start(local).unwrap();
    let mut events = session.subscribe();

    let responses = session.dispatch(Event::Discover, Value::Null).await.unwrap();
    assert_eq!(responses[0].as_ref().unwrap().text(), "S>");
    assert_eq!(session.state().await, State::Command);

    let responses = session.dispatch(Event::StartAutosample, Value::Null).await.unwrap();
    assert_eq!(responses[0].as_ref().unwrap().text(), "S>");
    assert_eq!(session.state().await, State::Autosample);

    let samples = collect_samples(&mut events, 3).await;
    let temps: Vec<f64> = samples.iter().filter_map(|s| s.get("temperature").and_then(FieldValue::as_f64)).collect();
    assert_eq!(temps, [20.1, 20.2, 20.3]);
    assert_eq!(sink.samples.lock().len(), 3);
    assert_eq!(
        *sink.states.lock(),
        [
            ("Unknown".to_string(), "Command".to_string()),
            ("Command".to_string(), "Autosample".to_string())
        ]
    );

    session.send_break(Duration::from_millis(500)).await.unwrap();
    let command = tokio::time::timeout(Duration::from_secs(5), commands.recv()).await.unwrap().unwrap();
    assert_eq!(command, "break 500");

    let stats = session.stats();
    assert_eq!(stats.packets_sent, 3);
    assert!(stats.bytes_received > 0);
}

#[tokio::test]
async fn test_samples_flow_while_response_is_pending() {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (commands_tx, _commands) = mpsc::unbounded_channel();
    tokio::spawn(fake_ctd(remote, commands_tx, vec![1.5, 2.5, 3.5, 4.5]));

    let sink = Arc::new(RecordingSink::default());
    let session = ctd_session("ctd").sink(sink.clone()).start(local).unwrap();
    let mut events = session.subscribe();

    let response = session
        .send(CommandRequest::new("dump").expect(Prompt::literal("S>")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.text(), "S>");
    assert!(response.sample.is_none());

    // Every sample came in ahead of the prompt, so the sink already has them
    let temps = |samples: &[Sample]| -> Vec<f64> {
        samples
            .iter()
            .filter_map(|s| s.get("temperature").and_then(FieldValue::as_f64))
            .collect()
    };
    assert_eq!(temps(&sink.samples.lock()), [1.5, 2.5, 3.5, 4.5]);
    assert_eq!(temps(&collect_samples(&mut events, 4).await), [1.5, 2.5, 3.5, 4.5]);
    assert!(sink.errors.lock().is_empty());
}

#[tokio::test]
async fn test_illegal_transition_closes_session() {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (commands_tx, _commands) = mpsc::unbounded_channel();
    tokio::spawn(fake_ctd(remote, commands_tx, Vec::new()));

    let sink = Arc::new(RecordingSink::default());
    let session = ctd_session("ctd").sink(sink.clone()).start(local).unwrap();
    let mut events = session.subscribe();

    let err = session.dispatch(Event::StopAutosample, Value::Null).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::StateMachine(StateMachineError::IllegalTransition { .. })
    ));
    assert!(err.is_fatal());
    assert!(session.is_closed());
    assert_eq!(sink.errors.lock().len(), 1);

    wait_for(&mut events, |e| matches!(e, SessionEvent::Closed(_))).await;
    assert!(matches!(
        session.dispatch(Event::Discover, Value::Null).await,
        Err(SessionError::ConnectionLost(_))
    ));
}

#[tokio::test]
async fn test_port_agent_stream_with_rollover() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let session = tick_session(FramingMode::PortAgent).start(local).unwrap();
    let mut events = session.subscribe();

    let policy = WritePolicy::default();
    let send = |payload: Vec<u8>, ty: PacketType| WirePacket::new(ty, payload).unwrap();

    let status = send(b"online".to_vec(), PacketType::PortAgentStatus);
    seacomm_core::core::protocol::port_agent::write_packet(&mut remote, &status, &policy)
        .await
        .unwrap();

    let mut corrupt = send(b"junk".to_vec(), PacketType::DataFromInstrument).pack().to_vec();
    corrupt[7] ^= 0xFF;
    remote.write_all(&corrupt).await.unwrap();

    let heartbeat = send(Vec::new(), PacketType::Heartbeat);
    seacomm_core::core::protocol::port_agent::write_packet(&mut remote, &heartbeat, &policy)
        .await
        .unwrap();

    // 30 records, counter wraps past 65535, fed in 5-byte packets
    let data = tick_stream(65_400, 20, 30);
    for piece in data.chunks(5) {
        let packet = send(piece.to_vec(), PacketType::DataFromInstrument);
        seacomm_core::core::protocol::port_agent::write_packet(&mut remote, &packet, &policy)
            .await
            .unwrap();
    }

    let samples = collect_samples(&mut events, 30).await;
    assert!(samples.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert_eq!(samples[29].timestamp, epoch() + chrono::Duration::seconds(29 * 10));
    assert_eq!(session.checkpoint().rollover_count, 1);

    let stats = session.stats();
    assert_eq!(stats.invalid_packets, 1);
    assert_eq!(stats.bytes_received, data.len() as u64);
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_port_agent_events_are_published() {
    let (local, mut remote) = tokio::io::duplex(4096);
    let session = tick_session(FramingMode::PortAgent).start(local).unwrap();
    let mut events = session.subscribe();
    let policy = WritePolicy::default();

    for (ty, text) in [(PacketType::PortAgentStatus, "online"), (PacketType::PortAgentFault, "serial overrun")] {
        let packet = WirePacket::new(ty, text.as_bytes().to_vec()).unwrap();
        seacomm_core::core::protocol::port_agent::write_packet(&mut remote, &packet, &policy)
            .await
            .unwrap();
    }

    match wait_for(&mut events, |e| matches!(e, SessionEvent::PortAgentStatus(_))).await {
        SessionEvent::PortAgentStatus(s) => assert_eq!(s, "online"),
        _ => unreachable!(),
    }
    match wait_for(&mut events, |e| matches!(e, SessionEvent::PortAgentFault(_))).await {
        SessionEvent::PortAgentFault(s) => assert_eq!(s, "serial overrun"),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_bad_header_is_fatal() {
    let (local, mut remote) = tokio::io::duplex(4096);
    let session = tick_session(FramingMode::PortAgent).start(local).unwrap();
    let mut events = session.subscribe();

    remote.write_all(&[0u8; 16]).await.unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::Closed(_))).await;
    assert!(session.is_closed());
}

#[tokio::test]
async fn test_resume_from_checkpoint_in_new_session() {
    let data = tick_stream(60_000, 500, 40);
    let split = 150;

    let mut offline = RecordParser::new(
        MarkerSieve::new(vec![RecordMarker::new(0xCB, TICK_RECORD_LEN)], tick_trailer()),
        SampleDecoder::new(vec![tick_schema()]),
    )
    .with_timebase(timebase());
    let expected: Vec<_> = offline
        .feed(&data, epoch())
        .iter()
        .filter_map(|e| e.sample().cloned())
        .collect();
    let first_part = split / TICK_RECORD_LEN;

    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let first = tick_session(FramingMode::Raw).start(local).unwrap();
    let mut events = first.subscribe();
    remote.write_all(&data[..split]).await.unwrap();
    let head = collect_samples(&mut events, first_part).await;
    let checkpoint = first.checkpoint();
    first.disconnect().await;

    let json = checkpoint.to_json().unwrap();
    let checkpoint = seacomm_core::ParserCheckpoint::from_json(&json).unwrap();
    assert!(checkpoint.byte_offset <= split as u64);

    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let second = tick_session(FramingMode::Raw).start(local).unwrap();
    second.restore(&checkpoint);
    let mut events = second.subscribe();
    remote
        .write_all(&data[checkpoint.byte_offset as usize..])
        .await
        .unwrap();

    let tail_expected: Vec<_> = expected
        .iter()
        .filter(|s| s.offset >= checkpoint.byte_offset)
        .cloned()
        .collect();
    let tail = collect_samples(&mut events, tail_expected.len()).await;

    let head: Vec<_> = head.into_iter().filter(|s| s.offset < checkpoint.byte_offset).collect();
    let mut resumed = head;
    resumed.extend(tail);
    assert_eq!(resumed, expected);
}

#[tokio::test]
async fn test_traffic_log_records_both_directions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ctd.log");
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (commands_tx, _commands) = mpsc::unbounded_channel();
    tokio::spawn(fake_ctd(remote, commands_tx, Vec::new()));

    let settings = SessionSettings {
        traffic_log: Some(path.clone()),
        ..SessionSettings::default()
    };
    let session = ctd_session("ctd").settings(settings).start(local).unwrap();
    session.dispatch(Event::Discover, Value::Null).await.unwrap();
    session.disconnect().await;
    drop(session);

    let log = std::fs::read_to_string(&path).unwrap();
    assert!(log.lines().any(|l| l.ends_with("TX \\r")));
    assert!(log.lines().any(|l| l.ends_with("RX S>")));
}

#[tokio::test]
async fn test_read_packet_sees_driver_framing() {
    // What the session writes is a valid DataFromDriver packet
    let (local, mut remote) = tokio::io::duplex(4096);
    let session = ctd_session("ctd").start(local).unwrap();
    session
        .send(seacomm_core::CommandRequest::new("stop"))
        .await
        .unwrap();

    let packet = read_packet(&mut remote).await.unwrap();
    assert_eq!(packet.packet_type(), PacketType::DataFromDriver);
    assert_eq!(packet.payload().as_ref(), b"stop\r\n");
    assert!(packet.is_valid());
}
