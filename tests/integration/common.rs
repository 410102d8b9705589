//! Fake instruments and port agents shared by the integration tests
#![allow(dead_code)]

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use seacomm_core::core::chunker::LineSieve;
use seacomm_core::core::protocol::checksum::{ChecksumType, TrailingChecksum};
use seacomm_core::core::protocol::port_agent::{read_packet, write_packet, PacketType, WirePacket};
use seacomm_core::core::sample::{BinaryType, Extractor, RecordChecksum, Sample, Schema, TextType};
use seacomm_core::core::session::{
    CommandRequest, EventSink, Prompt, SessionBuilder, SessionError, SessionEvent,
    SessionMachine,
};
use seacomm_core::core::state_machine::HandlerResult;
use seacomm_core::core::transport::WritePolicy;
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Unknown,
    Command,
    Autosample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Discover,
    StartAutosample,
    StopAutosample,
}

/// Driver for a small text CTD: wake with `\r`, `startnow`/`stop`
pub fn ctd_machine() -> SessionMachine<State, Event, ()> {
    let prompt = || Prompt::literal("S>");
    let mut fsm = SessionMachine::new(State::Unknown);
    fsm.add_handler(State::Unknown, Event::Discover, move |_: &mut (), _: &Value| {
        Ok(HandlerResult::goto(State::Command, vec![CommandRequest::new("wake").expect(prompt())]))
    });
    fsm.add_handler(State::Command, Event::StartAutosample, move |_: &mut (), _: &Value| {
        Ok(HandlerResult::goto(State::Autosample, vec![CommandRequest::new("start").expect(prompt())]))
    });
    fsm.add_handler(State::Autosample, Event::StopAutosample, move |_: &mut (), _: &Value| {
        Ok(HandlerResult::goto(State::Command, vec![CommandRequest::new("stop").expect(prompt())]))
    });
    fsm
}

pub fn ctd_schema() -> Schema {
    Schema::text("ctd", "#CTD")
        .field_with_unit("temperature", Extractor::token(1, TextType::Float), "degC")
        .field_with_unit("conductivity", Extractor::token(2, TextType::Float), "S/m")
        .field_with_unit("pressure", Extractor::token(3, TextType::Float), "dbar")
}

pub fn ctd_session(name: &str) -> SessionBuilder<State, Event, ()> {
    SessionBuilder::new(name, ctd_machine(), ())
        .literal_command("wake", b"\r")
        .literal_command("start", b"startnow\r\n")
        .literal_command("stop", b"stop\r\n")
        .literal_command("dump", b"dump\r\n")
        .sieve(
            LineSieve::from_patterns(&[r"#CTD[^\r\n]*\r\n", r"S>"])
                .unwrap()
                .with_record_start("#CTD")
                .unwrap(),
        )
        .schema(ctd_schema())
}

pub fn ctd_line(temperature: f64) -> String {
    format!("#CTD, {:.4}, 3.81000, 10.25\r\n", temperature)
}

/// Plays a text CTD behind a port agent until the stream closes.
/// Port agent commands (breaks) are reported on `commands`.
pub async fn fake_ctd<T>(mut stream: T, commands: mpsc::UnboundedSender<String>, samples: Vec<f64>)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let policy = WritePolicy::default();
    while let Ok(packet) = read_packet(&mut stream).await {
        let text = String::from_utf8_lossy(packet.payload()).into_owned();
        let replies: Vec<String> = match packet.packet_type() {
            PacketType::PortAgentCommand => {
                let _ = commands.send(text);
                continue;
            }
            PacketType::DataFromDriver => match text.as_str() {
                "\r" => vec!["S>".into()],
                "startnow\r\n" => {
                    // Samples arrive split across packets
                    let mut all = String::from("start now\r\nS>");
                    for t in &samples {
                        all.push_str(&ctd_line(*t));
                    }
                    let bytes = all.into_bytes();
                    bytes.chunks(7).map(|c| String::from_utf8_lossy(c).into_owned()).collect()
                }
                "stop\r\n" => vec!["S>".into()],
                "dump\r\n" => {
                    // Stored samples first, the prompt only at the end
                    let mut all: String = samples.iter().map(|t| ctd_line(*t)).collect();
                    all.push_str("S>");
                    let bytes = all.into_bytes();
                    bytes.chunks(5).map(|c| String::from_utf8_lossy(c).into_owned()).collect()
                }
                _ => vec!["?CMD\r\n".into()],
            },
            _ => continue,
        };
        for reply in replies {
            let packet = WirePacket::new(PacketType::DataFromInstrument, reply.into_bytes()).unwrap();
            if write_packet(&mut stream, &packet, &policy).await.is_err() {
                return;
            }
        }
    }
}

/// Event sink that records everything it is told
#[derive(Default)]
pub struct RecordingSink {
    pub samples: Mutex<Vec<Sample>>,
    pub states: Mutex<Vec<(String, String)>>,
    pub errors: Mutex<Vec<String>>,
}

impl EventSink for RecordingSink {
    fn on_sample(&self, sample: &Sample) {
        self.samples.lock().push(sample.clone());
    }

    fn on_state_change(&self, from: &str, to: &str) {
        self.states.lock().push((from.to_string(), to.to_string()));
    }

    fn on_error(&self, error: &SessionError) {
        self.errors.lock().push(error.to_string());
    }
}

/// Collect `n` samples from an event stream
pub async fn collect_samples(events: &mut broadcast::Receiver<SessionEvent>, n: usize) -> Vec<Sample> {
    let mut samples = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while samples.len() < n {
            if let Ok(SessionEvent::Sample(s)) = events.recv().await {
                samples.push(s);
            }
        }
    })
    .await
    .expect("samples did not arrive");
    samples
}

/// Wait for the first event matching `pred`
pub async fn wait_for<F>(events: &mut broadcast::Receiver<SessionEvent>, pred: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(event) = events.recv().await {
                if pred(&event) {
                    return event;
                }
            }
        }
    })
    .await
    .expect("event did not arrive")
}

// Binary instrument with a 16-bit tick counter

pub const TICK_RECORD_LEN: usize = 9;

pub fn tick_trailer() -> TrailingChecksum {
    TrailingChecksum::new(ChecksumType::Sum16)
}

pub fn tick_schema() -> Schema {
    Schema::binary("tick", 0xCB)
        .field("counter", Extractor::binary(1, BinaryType::U16Le))
        .field("value", Extractor::binary(3, BinaryType::I32Le))
        .checksum(RecordChecksum::Trailing(tick_trailer()))
        .tick_field("counter")
}

pub fn tick_record(counter: u16, value: i32) -> Vec<u8> {
    let mut r = vec![0xCB];
    r.extend(counter.to_le_bytes());
    r.extend(value.to_le_bytes());
    tick_trailer().append(&mut r);
    r
}

/// Records whose counter wraps once, starting at `first` with spacing `step`
pub fn tick_stream(first: u16, step: u16, count: i32) -> Vec<u8> {
    let mut counter = first;
    let mut out = Vec::new();
    for i in 0..count {
        out.extend(tick_record(counter, i));
        counter = counter.wrapping_add(step);
    }
    out
}

pub fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}
