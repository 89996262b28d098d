// Link -> network -> transport -> application classification of one frame.
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

use etherparse::{Ethernet2HeaderSlice, NetSlice, SlicedPacket, TransportSlice};

use crate::model::{Address, LinkType, NetworkProtocol, TransportProtocol};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_ARP: u16 = 0x0806;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88A8;

const ETHERNET_HEADER_LEN: usize = 14;
const SLL_HEADER_LEN: usize = 16;
const ARP_IPV4_LEN: usize = 28;

pub const MALFORMED: &str = "MALFORMED";

const PORT_SERVICES: &[(u16, &str)] = &[
    (20, "FTP-DATA"),
    (21, "FTP"),
    (22, "SSH"),
    (23, "TELNET"),
    (25, "SMTP"),
    (53, "DNS"),
    (67, "DHCP"),
    (68, "DHCP"),
    (80, "HTTP"),
    (110, "POP3"),
    (123, "NTP"),
    (143, "IMAP"),
    (443, "HTTPS"),
    (465, "SMTPS"),
    (587, "SMTP"),
    (993, "IMAPS"),
    (995, "POP3S"),
    (3306, "MySQL"),
    (5432, "PostgreSQL"),
    (6379, "Redis"),
    (8080, "HTTP-ALT"),
    (8443, "HTTPS-ALT"),
    (27017, "MongoDB"),
];

pub fn service_for_port(port: u16) -> Option<&'static str> {
    PORT_SERVICES
        .binary_search_by_key(&port, |(p, _)| *p)
        .ok()
        .map(|idx| PORT_SERVICES[idx].1)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub network: NetworkProtocol,
    pub transport: TransportProtocol,
    pub source: Address,
    pub destination: Address,
    pub source_port: Option<u16>,
    pub destination_port: Option<u16>,
    pub application: Option<&'static str>,
    pub flags: BTreeSet<String>,
}

impl Default for Classification {
    fn default() -> Self {
        Classification {
            network: NetworkProtocol::Other,
            transport: TransportProtocol::None,
            source: Address::Unknown,
            destination: Address::Unknown,
            source_port: None,
            destination_port: None,
            application: None,
            flags: BTreeSet::new(),
        }
    }
}

impl Classification {
    fn malformed(mut self) -> Self {
        self.flags.insert(MALFORMED.to_string());
        self
    }
}

/// Never fails: anything that cannot be parsed stays `Other`/`None` and is flagged.
pub fn classify(link: LinkType, data: &[u8]) -> Classification {
    let mut class = match link {
        LinkType::Ethernet => classify_ethernet(data),
        LinkType::RawIp => classify_ip(data),
        LinkType::Null => classify_null(data),
        LinkType::LinuxSll => classify_sll(data),
        LinkType::Other(_) => Classification::default(),
    };

    class.application = class
        .destination_port
        .and_then(service_for_port)
        .or_else(|| class.source_port.and_then(service_for_port));
    class
}

fn classify_ethernet(data: &[u8]) -> Classification {
    let eth = match Ethernet2HeaderSlice::from_slice(data) {
        Ok(eth) => eth,
        Err(_) => return Classification::default().malformed(),
    };

    let mut class = dispatch_ether_type(eth.ether_type().0, &data[ETHERNET_HEADER_LEN..]);
    if !class.source.is_known() && class.network == NetworkProtocol::Other {
        class.source = Address::Mac(eth.source());
        class.destination = Address::Mac(eth.destination());
    }
    class
}

fn classify_sll(data: &[u8]) -> Classification {
    if data.len() < SLL_HEADER_LEN {
        return Classification::default().malformed();
    }
    let protocol = u16::from_be_bytes([data[14], data[15]]);
    dispatch_ether_type(protocol, &data[SLL_HEADER_LEN..])
}

// BSD loopback: 4-byte address family in the writer's byte order.
fn classify_null(data: &[u8]) -> Classification {
    if data.len() < 4 {
        return Classification::default().malformed();
    }
    let raw = [data[0], data[1], data[2], data[3]];
    let family = match u32::from_le_bytes(raw) {
        family if family <= 0xFFFF => family,
        _ => u32::from_be_bytes(raw),
    };
    match family {
        2 | 24 | 28 | 30 => classify_ip(&data[4..]),
        _ => Classification::default(),
    }
}

fn dispatch_ether_type(ether_type: u16, payload: &[u8]) -> Classification {
    match ether_type {
        ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => {
            let mut class = classify_ip(payload);
            if class.network == NetworkProtocol::Other {
                // header did not parse, but the frame still declared its network layer
                class.network = if ether_type == ETHERTYPE_IPV4 {
                    NetworkProtocol::Ipv4
                } else {
                    NetworkProtocol::Ipv6
                };
            }
            class
        }
        ETHERTYPE_ARP => classify_arp(payload),
        ETHERTYPE_VLAN | ETHERTYPE_QINQ if payload.len() >= 4 => {
            dispatch_ether_type(u16::from_be_bytes([payload[2], payload[3]]), &payload[4..])
        }
        ETHERTYPE_VLAN | ETHERTYPE_QINQ => Classification::default().malformed(),
        _ => Classification::default(),
    }
}

fn classify_arp(payload: &[u8]) -> Classification {
    let mut class = Classification {
        network: NetworkProtocol::Arp,
        ..Classification::default()
    };

    // only Ethernet/IPv4 ARP carries addresses we can report
    if payload.len() < ARP_IPV4_LEN || payload[4] != 6 || payload[5] != 4 {
        return class.malformed();
    }

    let operation = u16::from_be_bytes([payload[6], payload[7]]);
    class.source = Address::Ip(IpAddr::V4(Ipv4Addr::new(payload[14], payload[15], payload[16], payload[17])));
    class.destination = Address::Ip(IpAddr::V4(Ipv4Addr::new(payload[24], payload[25], payload[26], payload[27])));
    class.flags.insert(
        match operation {
            1 => "REQUEST",
            2 => "REPLY",
            _ => "UNKNOWN-OP",
        }
        .to_string(),
    );
    class
}

fn classify_ip(payload: &[u8]) -> Classification {
    let sliced = match SlicedPacket::from_ip(payload) {
        Ok(sliced) => sliced,
        Err(_) => return Classification::default().malformed(),
    };

    let mut class = Classification::default();
    match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            class.network = NetworkProtocol::Ipv4;
            class.source = Address::Ip(IpAddr::V4(ipv4.header().source_addr()));
            class.destination = Address::Ip(IpAddr::V4(ipv4.header().destination_addr()));
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            class.network = NetworkProtocol::Ipv6;
            class.source = Address::Ip(IpAddr::V6(ipv6.header().source_addr()));
            class.destination = Address::Ip(IpAddr::V6(ipv6.header().destination_addr()));
        }
        _ => return class.malformed(),
    }

    class.transport = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            class.source_port = Some(tcp.source_port());
            class.destination_port = Some(tcp.destination_port());
            let flags = [
                (tcp.syn(), "SYN"),
                (tcp.ack(), "ACK"),
                (tcp.fin(), "FIN"),
                (tcp.rst(), "RST"),
                (tcp.psh(), "PSH"),
                (tcp.urg(), "URG"),
            ];
            for (set, name) in flags {
                if set {
                    class.flags.insert(name.to_string());
                }
            }
            TransportProtocol::Tcp
        }
        Some(TransportSlice::Udp(udp)) => {
            class.source_port = Some(udp.source_port());
            class.destination_port = Some(udp.destination_port());
            TransportProtocol::Udp
        }
        Some(TransportSlice::Icmpv4(_)) | Some(TransportSlice::Icmpv6(_)) => TransportProtocol::Icmp,
        _ => TransportProtocol::Other,
    };
    class
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{arp_reply, tcp_frame, udp_frame};

    #[test]
    fn tcp_frame_gets_ports_flags_and_service() {
        let frame = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 51000, 443, b"hello");
        let class = classify(LinkType::Ethernet, &frame);

        assert_eq!(class.network, NetworkProtocol::Ipv4);
        assert_eq!(class.transport, TransportProtocol::Tcp);
        assert_eq!(class.source.to_string(), "10.0.0.1");
        assert_eq!(class.destination_port, Some(443));
        assert_eq!(class.application, Some("HTTPS"));
        assert!(class.flags.contains("SYN"));
    }

    #[test]
    fn udp_dns_is_recognised_from_source_port() {
        let frame = udp_frame([8, 8, 8, 8], [192, 168, 1, 10], 53, 40000, b"answer");
        let class = classify(LinkType::Ethernet, &frame);
        assert_eq!(class.transport, TransportProtocol::Udp);
        assert_eq!(class.application, Some("DNS"));
    }

    #[test]
    fn arp_reply_reports_protocol_addresses() {
        let class = classify(LinkType::Ethernet, &arp_reply([192, 168, 1, 1], [192, 168, 1, 20]));
        assert_eq!(class.network, NetworkProtocol::Arp);
        assert_eq!(class.transport, TransportProtocol::None);
        assert_eq!(class.source.to_string(), "192.168.1.1");
        assert!(class.flags.contains("REPLY"));
    }

    #[test]
    fn raw_ip_link_skips_ethernet() {
        let frame = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1234, 22, b"");
        let class = classify(LinkType::RawIp, &frame[ETHERNET_HEADER_LEN..]);
        assert_eq!(class.network, NetworkProtocol::Ipv4);
        assert_eq!(class.application, Some("SSH"));
    }

    #[test]
    fn unknown_link_type_is_not_fatal() {
        let class = classify(LinkType::Other(147), &[1, 2, 3]);
        assert_eq!(class.network, NetworkProtocol::Other);
        assert_eq!(class.transport, TransportProtocol::None);
        assert!(!class.flags.contains(MALFORMED));
    }

    #[test]
    fn cut_ip_header_is_flagged_but_keeps_network() {
        let frame = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1234, 80, b"");
        let class = classify(LinkType::Ethernet, &frame[..20]);
        assert_eq!(class.network, NetworkProtocol::Ipv4);
        assert!(class.flags.contains(MALFORMED));
    }

    #[test]
    fn port_table_is_sorted_for_lookup() {
        assert!(PORT_SERVICES.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(service_for_port(27017), Some("MongoDB"));
        assert_eq!(service_for_port(4), None);
    }
}
