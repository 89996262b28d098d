#![allow(dead_code)]

use std::path::Path;

use etherparse::PacketBuilder;
use netcap::decode::writer::PcapWriter;

pub const BASE_US: i64 = 1_700_000_000_000_000;

pub fn tcp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4(src, dst, 64)
        .tcp(sport, dport, 1, 1024)
        .ack(1);
    let mut frame = Vec::with_capacity(builder.size(4));
    builder.write(&mut frame, b"ping").unwrap();
    frame
}

pub fn udp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4(src, dst, 64)
        .udp(sport, dport);
    let mut frame = Vec::with_capacity(builder.size(4));
    builder.write(&mut frame, b"pong").unwrap();
    frame
}

pub fn pcap_bytes(records: &[(i64, Vec<u8>)]) -> Vec<u8> {
    let mut writer = PcapWriter::new(Vec::new(), 1, 65535).unwrap();
    for (ts, frame) in records {
        writer.write_record(*ts, frame.len() as u32, frame).unwrap();
    }
    writer.into_inner().unwrap()
}

/// `count` frames between two hosts, `step_us` apart, alternating TCP and UDP when `mixed`.
pub fn series(start_us: i64, step_us: i64, count: usize, mixed: bool) -> Vec<(i64, Vec<u8>)> {
    (0..count)
        .map(|i| {
            let frame = if mixed && i % 2 == 1 {
                udp_frame([10, 0, 0, 1], [10, 0, 0, 53], 5353, 53)
            } else {
                tcp_frame([10, 0, 0, 1], [10, 0, 0, 80], 40000, 80)
            };
            (start_us + step_us * i as i64, frame)
        })
        .collect()
}

pub fn write_capture(dir: &Path, name: &str, records: &[(i64, Vec<u8>)]) -> Vec<u8> {
    let bytes = pcap_bytes(records);
    std::fs::write(dir.join(name), &bytes).unwrap();
    bytes
}
