//! Streaming decoder for capture files.
//!
//! Classic pcap (either byte order, micro- or nanosecond timestamps) and
//! pcapng are recognised by `pcap_parser` from the file header. Blocks are
//! pulled one at a time through a refillable buffer, classified, and their
//! payload dropped, so the file never has to be memory-resident.
//!
//! A record cut short by the end of the file ends decoding: the packets read
//! before it are kept and the error is stored in
//! [`DecodedCapture::truncation`].

pub mod classify;
pub mod writer;

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pcap_parser::pcapng::Block;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{create_reader, PcapBlockOwned, PcapError};
use tracing::{debug, warn};

use crate::error::FormatError;
use crate::model::{DecodedCapture, LinkType, PacketRecord};
use classify::classify;

const BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on a single record; anything larger is treated as corruption.
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

pub fn decode(raw: &[u8]) -> Result<DecodedCapture, FormatError> {
    decode_reader(raw, "<memory>")
}

pub fn decode_file(path: &Path) -> Result<DecodedCapture, FormatError> {
    let file = File::open(path)?;
    decode_reader(BufReader::new(file), path)
}

pub fn decode_reader<R: Read + Send>(
    reader: R,
    source_file: impl Into<PathBuf>,
) -> Result<DecodedCapture, FormatError> {
    let source_file = source_file.into();

    let mut reader = create_reader(BUFFER_SIZE, reader).map_err(|err| match err {
        PcapError::ReadError => FormatError::Io("could not read capture header".into()),
        _ => FormatError::UnrecognizedHeader,
    })?;

    let mut collector = Collector::default();
    let truncation = read_blocks(&mut *reader, &mut collector);

    match &truncation {
        Some(err) => warn!(
            "Decoding {} stopped after {} packets: {}",
            source_file.display(),
            collector.packets.len(),
            err
        ),
        None => debug!("Decoded {} packets from {}", collector.packets.len(), source_file.display()),
    }

    Ok(collector.finish(source_file, truncation))
}

/// Accumulates records; timestamps stay absolute until `finish` rebases them.
#[derive(Default)]
struct Collector {
    packets: Vec<PacketRecord>,
    last_us: Option<i64>,
    out_of_order: bool,
}

impl Collector {
    fn next_index(&self) -> usize {
        self.packets.len()
    }

    fn push(&mut self, absolute_us: i64, wire_length: u32, link: LinkType, data: &[u8]) {
        if self.last_us.map_or(false, |last| absolute_us < last) {
            self.out_of_order = true;
        }
        self.last_us = Some(absolute_us);

        let class = classify(link, data);
        self.packets.push(PacketRecord {
            sequence_index: self.packets.len(),
            relative_us: absolute_us,
            wire_length: wire_length.max(data.len() as u32),
            captured_length: data.len() as u32,
            link_type: link,
            network: class.network,
            transport: class.transport,
            source: class.source,
            destination: class.destination,
            source_port: class.source_port,
            destination_port: class.destination_port,
            application: class.application,
            flags: class.flags,
        });
    }

    fn finish(mut self, source_file: PathBuf, truncation: Option<FormatError>) -> DecodedCapture {
        if self.out_of_order {
            // stable: equal timestamps keep file order
            self.packets.sort_by_key(|p| p.relative_us);
        }

        let anchor = self.packets.first().map_or(0, |p| p.relative_us);
        for packet in &mut self.packets {
            packet.relative_us -= anchor;
        }

        DecodedCapture {
            source_file,
            start_time: DateTime::<Utc>::from_timestamp_micros(anchor).unwrap_or(DateTime::UNIX_EPOCH),
            packets: self.packets,
            truncation,
        }
    }
}

/// Per-file state the blocks depend on.
#[derive(Default)]
struct Layout {
    /// Classic pcap link type and timestamp precision.
    legacy: Option<(LinkType, bool)>,
    /// pcapng interfaces of the current section.
    interfaces: Vec<Interface>,
}

struct Interface {
    link: LinkType,
    units_per_sec: u64,
    offset_us: i64,
}

/// Drives the reader to the end of the file. Returns the error that stopped
/// it early, if any; everything decoded before that stays in `collector`.
fn read_blocks<P>(reader: &mut P, collector: &mut Collector) -> Option<FormatError>
where
    P: PcapReaderIterator + ?Sized,
{
    let mut layout = Layout::default();
    let mut capacity = BUFFER_SIZE;

    loop {
        let at_index = collector.next_index();
        match reader.next() {
            Ok((offset, block)) => {
                let step = layout.apply(block, collector);
                reader.consume(offset);
                if let Err(reason) = step {
                    return Some(FormatError::CorruptRecord { at_index, reason });
                }
            }
            Err(PcapError::Eof) => return None,
            Err(PcapError::Incomplete(_)) => {
                let before = reader.data().len();
                if reader.refill().is_err() {
                    return Some(FormatError::Io("read failed while refilling".into()));
                }
                let after = reader.data().len();
                if after > before {
                    continue;
                }
                if after == 0 {
                    return None;
                }
                if after < capacity {
                    // bytes left over and nothing more to read
                    return Some(FormatError::TruncatedRecord { at_index });
                }
                if !grow(reader, &mut capacity) {
                    return Some(oversized(at_index));
                }
            }
            Err(PcapError::BufferTooSmall) => {
                if !grow(reader, &mut capacity) {
                    return Some(oversized(at_index));
                }
            }
            Err(PcapError::UnexpectedEof) => return Some(FormatError::TruncatedRecord { at_index }),
            Err(PcapError::ReadError) => return Some(FormatError::Io("read failed".into())),
            Err(PcapError::NomError(_, kind)) | Err(PcapError::OwnedNomError(_, kind)) => {
                return Some(FormatError::CorruptRecord {
                    at_index,
                    reason: format!("unparsable block ({:?})", kind),
                });
            }
            Err(_) => {
                return Some(FormatError::CorruptRecord {
                    at_index,
                    reason: "unrecognized block".into(),
                });
            }
        }
    }
}

fn grow<P: PcapReaderIterator + ?Sized>(reader: &mut P, capacity: &mut usize) -> bool {
    if *capacity >= MAX_RECORD_LEN {
        return false;
    }
    *capacity = (*capacity * 2).min(MAX_RECORD_LEN);
    debug!("Growing decode buffer to {} bytes", capacity);
    reader.grow(*capacity)
}

fn oversized(at_index: usize) -> FormatError {
    FormatError::CorruptRecord {
        at_index,
        reason: format!("record exceeds {} bytes", MAX_RECORD_LEN),
    }
}

impl Layout {
    fn apply(&mut self, block: PcapBlockOwned<'_>, collector: &mut Collector) -> Result<(), String> {
        match block {
            PcapBlockOwned::LegacyHeader(header) => {
                // upper bits of the link type field carry FCS information
                let link = LinkType::from_code((header.network.0 as u32) & 0x0FFF_FFFF);
                self.legacy = Some((link, header.is_nanosecond_precision()));
            }
            PcapBlockOwned::Legacy(packet) => {
                let (link, nanos) = self.legacy.ok_or("record before file header")?;
                let micros = if nanos { packet.ts_usec / 1_000 } else { packet.ts_usec };
                let absolute_us = i64::from(packet.ts_sec) * 1_000_000 + i64::from(micros);
                collector.push(absolute_us, packet.origlen, link, packet.data);
            }
            PcapBlockOwned::NG(Block::SectionHeader(_)) => self.interfaces.clear(),
            PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                let units_per_sec = ts_resolution(idb.if_tsresol)
                    .ok_or_else(|| format!("timestamp resolution {:#x} out of range", idb.if_tsresol))?;
                self.interfaces.push(Interface {
                    link: LinkType::from_code(idb.linktype.0 as u32),
                    units_per_sec,
                    offset_us: (idb.if_tsoffset as i64).saturating_mul(1_000_000),
                });
            }
            PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                let interface = self
                    .interfaces
                    .get(epb.if_id as usize)
                    .ok_or_else(|| format!("unknown interface {}", epb.if_id))?;
                // block data is padded to 32 bits
                let data = epb
                    .data
                    .get(..epb.caplen as usize)
                    .ok_or("captured length exceeds block")?;
                let ts = (u64::from(epb.ts_high) << 32) | u64::from(epb.ts_low);
                let absolute_us = interface.offset_us + to_micros(ts, interface.units_per_sec);
                collector.push(absolute_us, epb.origlen, interface.link, data);
            }
            PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                let interface = self
                    .interfaces
                    .first()
                    .ok_or("simple packet block before any interface")?;
                let captured = (spb.origlen as usize).min(spb.data.len());
                // simple packet blocks carry no timestamp
                let absolute_us = collector.last_us.unwrap_or(0);
                collector.push(absolute_us, spb.origlen, interface.link, &spb.data[..captured]);
            }
            PcapBlockOwned::NG(other) => debug!("Skipping pcapng {} block", block_kind(&other)),
        }
        Ok(())
    }
}

fn block_kind(block: &Block<'_>) -> &'static str {
    match block {
        Block::NameResolution(_) => "name resolution",
        Block::InterfaceStatistics(_) => "interface statistics",
        Block::Custom(_) => "custom",
        _ => "other",
    }
}

/// Timestamp units per second for an `if_tsresol` value: a power of ten, or
/// of two when the high bit is set.
fn ts_resolution(tsresol: u8) -> Option<u64> {
    let exponent = u32::from(tsresol & 0x7F);
    if tsresol & 0x80 == 0 {
        10u64.checked_pow(exponent)
    } else {
        1u64.checked_shl(exponent)
    }
}

fn to_micros(ts: u64, units_per_sec: u64) -> i64 {
    (u128::from(ts) * 1_000_000 / u128::from(units_per_sec.max(1))) as i64
}
