use std::collections::{BTreeMap, HashMap};

use chrono::SecondsFormat;

use super::render::{self, cell};
use crate::decode::classify::service_for_port;
use crate::model::{DecodedCapture, NetworkProtocol, PacketRecord, TransportProtocol};

pub const TOP_CONVERSATIONS: usize = 10;
pub const TOP_PORTS: usize = 10;

pub const LENGTH_BINS: [(&str, u32); 5] = [
    ("0-100", 100),
    ("101-500", 500),
    ("501-1000", 1000),
    ("1001-1500", 1500),
    ("1500+", u32::MAX),
];

/// Traffic between an unordered pair of addresses. `endpoints.0 <= endpoints.1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub endpoints: (String, String),
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCount {
    pub port: u16,
    pub service: Option<&'static str>,
    pub packets: u64,
}

/// Aggregates behind an [`AnalysisReport`].
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureStats {
    pub source_name: String,
    pub start_time: String,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub duration_us: i64,
    pub network_counts: BTreeMap<NetworkProtocol, u64>,
    pub transport_counts: BTreeMap<TransportProtocol, u64>,
    pub application_counts: BTreeMap<&'static str, u64>,
    pub unclassified_packets: u64,
    pub length_bins: [u64; 5],
    pub top_ports: Vec<PortCount>,
    pub top_conversations: Vec<Conversation>,
    pub conversation_count: usize,
    pub decode_warning: Option<String>,
}

impl CaptureStats {
    /// Single pass over the packets, then deterministic ranking.
    pub fn collect(capture: &DecodedCapture) -> Self {
        let mut network_counts: BTreeMap<NetworkProtocol, u64> =
            NetworkProtocol::ALL.iter().map(|p| (*p, 0)).collect();
        let mut transport_counts: BTreeMap<TransportProtocol, u64> =
            TransportProtocol::ALL.iter().map(|p| (*p, 0)).collect();
        let mut application_counts = BTreeMap::new();
        let mut unclassified_packets = 0;
        let mut length_bins = [0u64; 5];
        let mut ports: HashMap<u16, u64> = HashMap::new();
        let mut conversations: HashMap<(String, String), (u64, u64)> = HashMap::new();
        let mut total_bytes = 0u64;

        for packet in &capture.packets {
            let bytes = u64::from(packet.wire_length);
            total_bytes += bytes;
            *network_counts.entry(packet.network).or_insert(0) += 1;
            *transport_counts.entry(packet.transport).or_insert(0) += 1;

            match packet.application {
                Some(app) => *application_counts.entry(app).or_insert(0) += 1,
                None => unclassified_packets += 1,
            }

            let bin = LENGTH_BINS
                .iter()
                .position(|(_, upper)| packet.wire_length <= *upper)
                .unwrap_or(LENGTH_BINS.len() - 1);
            length_bins[bin] += 1;

            if let Some(port) = packet.destination_port.filter(|p| *p > 0) {
                *ports.entry(port).or_insert(0) += 1;
            }

            if let Some(key) = conversation_key(packet) {
                let entry = conversations.entry(key).or_insert((0, 0));
                entry.0 += 1;
                entry.1 += bytes;
            }
        }

        let conversation_count = conversations.len();
        let mut ranked: Vec<Conversation> = conversations
            .into_iter()
            .map(|(endpoints, (packets, bytes))| Conversation { endpoints, packets, bytes })
            .collect();
        ranked.sort_by(|a, b| {
            b.packets
                .cmp(&a.packets)
                .then(b.bytes.cmp(&a.bytes))
                .then_with(|| a.endpoints.cmp(&b.endpoints))
        });
        ranked.truncate(TOP_CONVERSATIONS);

        let mut top_ports: Vec<PortCount> = ports
            .into_iter()
            .map(|(port, packets)| PortCount {
                port,
                service: service_for_port(port),
                packets,
            })
            .collect();
        top_ports.sort_by(|a, b| b.packets.cmp(&a.packets).then(a.port.cmp(&b.port)));
        top_ports.truncate(TOP_PORTS);

        CaptureStats {
            source_name: capture.name(),
            start_time: if capture.packets.is_empty() {
                "-".to_string()
            } else {
                capture.start_time.to_rfc3339_opts(SecondsFormat::Micros, true)
            },
            total_packets: capture.packets.len() as u64,
            total_bytes,
            duration_us: capture.duration_us(),
            network_counts,
            transport_counts,
            application_counts,
            unclassified_packets,
            length_bins,
            top_ports,
            top_conversations: ranked,
            conversation_count,
            decode_warning: capture.truncation.as_ref().map(|err| err.to_string()),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        render::heading(&mut out, 1, "Capture Analysis");

        let mut summary = vec![
            ("Source File".to_string(), self.source_name.clone()),
            ("Capture Start".to_string(), self.start_time.clone()),
            ("Total Packets".to_string(), self.total_packets.to_string()),
            ("Total Bytes".to_string(), self.total_bytes.to_string()),
            ("Duration (s)".to_string(), render::seconds(self.duration_us)),
            ("Throughput (bytes/s)".to_string(), render::rate(self.total_bytes, self.duration_us)),
            ("Throughput (packets/s)".to_string(), render::rate(self.total_packets, self.duration_us)),
            ("Conversations".to_string(), self.conversation_count.to_string()),
        ];
        if let Some(warning) = &self.decode_warning {
            summary.push(("Decode Warning".to_string(), warning.clone()));
        }
        render::metric_table(&mut out, &summary);

        render::heading(&mut out, 2, "Network Protocols");
        let network: Vec<(&str, String)> = self
            .network_counts
            .iter()
            .map(|(proto, count)| (proto.label(), count.to_string()))
            .collect();
        render::metric_table(&mut out, &network);

        render::heading(&mut out, 2, "Transport Protocols");
        let transport: Vec<(&str, String)> = self
            .transport_counts
            .iter()
            .map(|(proto, count)| (proto.label(), count.to_string()))
            .collect();
        render::metric_table(&mut out, &transport);

        render::heading(&mut out, 2, "Applications");
        let mut applications: Vec<(String, String)> = self
            .application_counts
            .iter()
            .map(|(app, count)| (format!("App {}", app), count.to_string()))
            .collect();
        applications.push(("App Unclassified".to_string(), self.unclassified_packets.to_string()));
        render::metric_table(&mut out, &applications);

        render::heading(&mut out, 2, "Packet Lengths");
        let lengths: Vec<(String, String)> = LENGTH_BINS
            .iter()
            .zip(self.length_bins.iter())
            .map(|((label, _), count)| (format!("Length {}", label), count.to_string()))
            .collect();
        render::metric_table(&mut out, &lengths);

        render::heading(&mut out, 2, "Top Conversations");
        let conversations: Vec<Vec<String>> = self
            .top_conversations
            .iter()
            .enumerate()
            .map(|(rank, conv)| {
                vec![
                    format!("Conversation {}", rank + 1),
                    format!("{} <-> {}", conv.endpoints.0, conv.endpoints.1),
                    conv.packets.to_string(),
                    conv.bytes.to_string(),
                ]
            })
            .collect();
        render::ranked_table(&mut out, &["Endpoints", "Packets", "Bytes"], &conversations);

        render::heading(&mut out, 2, "Top Destination Ports");
        let ports: Vec<Vec<String>> = self
            .top_ports
            .iter()
            .enumerate()
            .map(|(rank, port)| {
                vec![
                    format!("Port Rank {}", rank + 1),
                    port.port.to_string(),
                    cell(port.service.unwrap_or("Unknown")),
                    port.packets.to_string(),
                ]
            })
            .collect();
        render::ranked_table(&mut out, &["Port", "Service", "Packets"], &ports);

        out
    }
}

fn conversation_key(packet: &PacketRecord) -> Option<(String, String)> {
    if !packet.source.is_known() || !packet.destination.is_known() {
        return None;
    }
    let a = packet.source.to_string();
    let b = packet.destination.to_string();
    Some(if a <= b { (a, b) } else { (b, a) })
}

/// Single-capture report: the aggregates and the text rendered from them.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisReport {
    pub stats: CaptureStats,
    text: String,
}

impl AnalysisReport {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

pub fn generate(capture: &DecodedCapture) -> AnalysisReport {
    let stats = CaptureStats::collect(capture);
    let text = stats.render();
    AnalysisReport { stats, text }
}
