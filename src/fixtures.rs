// Frame and capture builders shared by unit tests.
use std::io::Cursor;

use etherparse::PacketBuilder;

use crate::decode::{decode_reader, writer::PcapWriter};
use crate::model::{DecodedCapture, LinkType};

const CLIENT_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
const SERVER_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];

pub fn tcp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(CLIENT_MAC, SERVER_MAC)
        .ipv4(src, dst, 64)
        .tcp(sport, dport, 1000, 4096)
        .syn();
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).unwrap();
    frame
}

pub fn udp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(CLIENT_MAC, SERVER_MAC)
        .ipv4(src, dst, 64)
        .udp(sport, dport);
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).unwrap();
    frame
}

pub fn arp_reply(sender: [u8; 4], target: [u8; 4]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(42);
    frame.extend_from_slice(&SERVER_MAC);
    frame.extend_from_slice(&CLIENT_MAC);
    frame.extend_from_slice(&[0x08, 0x06]);
    frame.extend_from_slice(&[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x02]);
    frame.extend_from_slice(&CLIENT_MAC);
    frame.extend_from_slice(&sender);
    frame.extend_from_slice(&SERVER_MAC);
    frame.extend_from_slice(&target);
    frame
}

/// Classic pcap bytes for `(absolute_us, frame)` records.
pub fn pcap_bytes(link: LinkType, records: &[(i64, Vec<u8>)]) -> Vec<u8> {
    let mut writer = PcapWriter::new(Vec::new(), link.code(), 65535).unwrap();
    for (ts, frame) in records {
        writer.write_record(*ts, frame.len() as u32, frame).unwrap();
    }
    writer.into_inner().unwrap()
}

pub fn capture(name: &str, records: &[(i64, Vec<u8>)]) -> DecodedCapture {
    let bytes = pcap_bytes(LinkType::Ethernet, records);
    decode_reader(Cursor::new(bytes), name).unwrap()
}

/// `count` TCP frames between two hosts, `step_us` apart, starting at `start_us`.
pub fn tcp_series(start_us: i64, step_us: i64, count: usize, src: [u8; 4], dst: [u8; 4]) -> Vec<(i64, Vec<u8>)> {
    (0..count)
        .map(|i| (start_us + step_us * i as i64, tcp_frame(src, dst, 40000, 80, b"GET /")))
        .collect()
}
