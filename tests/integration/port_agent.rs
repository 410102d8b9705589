//! Replaying port-agent capture files

use crate::common::*;
use futures::StreamExt;
use seacomm_core::core::chunker::{MarkerSieve, PortAgentSieve, RecordMarker, StreamChunk, StreamChunker};
use seacomm_core::core::parser::RecordParser;
use seacomm_core::core::protocol::port_agent::{PacketType, PortAgentCodec, WirePacket};
use seacomm_core::core::sample::SampleDecoder;
use tokio_util::codec::FramedRead;

/// A capture that starts mid-packet and has line noise between packets
fn capture(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let lead = WirePacket::new(PacketType::DataFromInstrument, b"cut off".to_vec()).unwrap().pack();
    out.extend_from_slice(&lead[5..]);
    for (i, piece) in data.chunks(11).enumerate() {
        out.extend_from_slice(&WirePacket::new(PacketType::DataFromInstrument, piece.to_vec()).unwrap().pack());
        if i % 4 == 0 {
            out.extend_from_slice(&[0xA3, 0x9D, 0x00, 0x42]);
        }
        if i % 5 == 0 {
            out.extend_from_slice(&WirePacket::new(PacketType::Heartbeat, Vec::new()).unwrap().pack());
        }
    }
    out
}

fn parser() -> RecordParser<MarkerSieve> {
    RecordParser::new(
        MarkerSieve::new(vec![RecordMarker::new(0xCB, TICK_RECORD_LEN)], tick_trailer()),
        SampleDecoder::new(vec![tick_schema()]),
    )
}

#[tokio::test]
async fn test_replay_capture_file_through_codec() {
    let data = tick_stream(100, 7, 50);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.dat");
    std::fs::write(&path, capture(&data)).unwrap();

    let file = tokio::fs::File::open(&path).await.unwrap();
    let mut frames = FramedRead::new(file, PortAgentCodec::new());
    let mut parser = parser();
    let mut samples = Vec::new();
    let mut heartbeats = 0;
    while let Some(packet) = frames.next().await {
        let packet = packet.unwrap();
        match packet.packet_type() {
            PacketType::DataFromInstrument => {
                samples.extend(parser.feed(packet.payload(), epoch()).iter().filter_map(|e| e.sample().cloned()));
            }
            PacketType::Heartbeat => heartbeats += 1,
            other => panic!("unexpected {:?}", other),
        }
    }

    assert_eq!(samples.len(), 50);
    assert_eq!(heartbeats, data.chunks(11).len().div_ceil(5));
    assert!(frames.decoder().discarded() > 0);
}

#[test]
fn test_port_agent_sieve_over_raw_capture() {
    let data = tick_stream(0, 1, 10);
    let raw = capture(&data);
    let mut chunker = StreamChunker::new(PortAgentSieve);
    for piece in raw.chunks(13) {
        chunker.add(piece);
    }

    let mut payload = Vec::new();
    let mut non_data = 0;
    while let Some(chunk) = chunker.next_chunk() {
        match chunk {
            StreamChunk::Data(c) => {
                let packet = WirePacket::unpack(&c.bytes).unwrap();
                if packet.packet_type() == PacketType::DataFromInstrument {
                    payload.extend_from_slice(packet.payload());
                }
            }
            StreamChunk::NonData(_) => non_data += 1,
        }
    }
    assert_eq!(payload, data);
    assert!(non_data > 0);
}
