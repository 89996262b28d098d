use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::FormatError;

/// Link-layer framing declared by a capture file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    Null,
    Ethernet,
    RawIp,
    LinuxSll,
    Other(u32),
}

impl LinkType {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => LinkType::Null,
            1 => LinkType::Ethernet,
            // DLT_RAW differs between platforms; 101 is the file-format value.
            12 | 14 | 101 | 228 | 229 => LinkType::RawIp,
            113 => LinkType::LinuxSll,
            other => LinkType::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            LinkType::Null => 0,
            LinkType::Ethernet => 1,
            LinkType::RawIp => 101,
            LinkType::LinuxSll => 113,
            LinkType::Other(code) => code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NetworkProtocol {
    Ipv4,
    Ipv6,
    Arp,
    Other,
}

impl NetworkProtocol {
    pub const ALL: [NetworkProtocol; 4] = [
        NetworkProtocol::Ipv4,
        NetworkProtocol::Ipv6,
        NetworkProtocol::Arp,
        NetworkProtocol::Other,
    ];

    pub fn label(self) -> &'static str {
        match self {
            NetworkProtocol::Ipv4 => "IPv4",
            NetworkProtocol::Ipv6 => "IPv6",
            NetworkProtocol::Arp => "ARP",
            NetworkProtocol::Other => "Other Network",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Icmp,
    Other,
    None,
}

impl TransportProtocol {
    pub const ALL: [TransportProtocol; 5] = [
        TransportProtocol::Tcp,
        TransportProtocol::Udp,
        TransportProtocol::Icmp,
        TransportProtocol::Other,
        TransportProtocol::None,
    ];

    pub fn label(self) -> &'static str {
        match self {
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Icmp => "ICMP",
            TransportProtocol::Other => "Other Transport",
            TransportProtocol::None => "No Transport",
        }
    }
}

/// Endpoint address as far as classification got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Address {
    Ip(IpAddr),
    Mac([u8; 6]),
    Unknown,
}

impl Address {
    pub fn is_known(&self) -> bool {
        !matches!(self, Address::Unknown)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(ip) => write!(f, "{}", ip),
            Address::Mac(mac) => write!(
                f,
                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
            ),
            Address::Unknown => f.write_str("unknown"),
        }
    }
}

/// One decoded frame. Built once by the decoder and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketRecord {
    pub sequence_index: usize,
    /// Microseconds since the capture's `start_time`.
    pub relative_us: i64,
    pub wire_length: u32,
    pub captured_length: u32,
    pub link_type: LinkType,
    pub network: NetworkProtocol,
    pub transport: TransportProtocol,
    pub source: Address,
    pub destination: Address,
    pub source_port: Option<u16>,
    pub destination_port: Option<u16>,
    pub application: Option<&'static str>,
    pub flags: BTreeSet<String>,
}

impl PacketRecord {
    pub fn relative_secs(&self) -> f64 {
        self.relative_us as f64 / 1_000_000.0
    }

    /// Transport name when there is one, otherwise the network name.
    pub fn protocol_label(&self) -> &'static str {
        match self.transport {
            TransportProtocol::None => self.network.label(),
            other => other.label(),
        }
    }

    pub fn source_endpoint(&self) -> String {
        endpoint(&self.source, self.source_port)
    }

    pub fn destination_endpoint(&self) -> String {
        endpoint(&self.destination, self.destination_port)
    }
}

fn endpoint(address: &Address, port: Option<u16>) -> String {
    match (address, port) {
        (Address::Ip(ip), Some(port)) => SocketAddr::new(*ip, port).to_string(),
        (address, _) => address.to_string(),
    }
}

/// All packets of one capture file, in timestamp order.
#[derive(Debug, Clone)]
pub struct DecodedCapture {
    pub source_file: PathBuf,
    pub start_time: DateTime<Utc>,
    pub packets: Vec<PacketRecord>,
    /// Set when decoding stopped early; `packets` then holds everything read before it.
    pub truncation: Option<FormatError>,
}

impl DecodedCapture {
    pub fn name(&self) -> String {
        file_label(&self.source_file)
    }

    pub fn is_complete(&self) -> bool {
        self.truncation.is_none()
    }

    pub fn start_us(&self) -> i64 {
        self.start_time.timestamp_micros()
    }

    pub fn absolute_us(&self, packet: &PacketRecord) -> i64 {
        self.start_us() + packet.relative_us
    }

    pub fn duration_us(&self) -> i64 {
        match (self.packets.first(), self.packets.last()) {
            (Some(first), Some(last)) if self.packets.len() > 1 => last.relative_us - first.relative_us,
            _ => 0,
        }
    }
}

pub(crate) fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
