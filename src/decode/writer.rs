use std::io::{self, Write};

const MAGIC_MICROS: u32 = 0xA1B2_C3D4;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;

/// Writes classic little-endian, microsecond-resolution pcap.
///
/// Each call to [`PcapWriter::write_record`] emits one complete record, so a
/// writer that is dropped between calls never leaves a partial trailing record.
pub struct PcapWriter<W: Write> {
    inner: W,
    snaplen: u32,
}

impl<W: Write> PcapWriter<W> {
    pub fn new(mut inner: W, link_type: u32, snaplen: u32) -> io::Result<Self> {
        let mut header = [0u8; 24];
        header[0..4].copy_from_slice(&MAGIC_MICROS.to_le_bytes());
        header[4..6].copy_from_slice(&VERSION_MAJOR.to_le_bytes());
        header[6..8].copy_from_slice(&VERSION_MINOR.to_le_bytes());
        // thiszone and sigfigs stay zero
        header[16..20].copy_from_slice(&snaplen.to_le_bytes());
        header[20..24].copy_from_slice(&link_type.to_le_bytes());
        inner.write_all(&header)?;
        Ok(Self { inner, snaplen })
    }

    pub fn write_record(&mut self, timestamp_us: i64, wire_length: u32, data: &[u8]) -> io::Result<()> {
        let timestamp_us = timestamp_us.max(0);
        let captured = &data[..data.len().min(self.snaplen as usize)];

        let mut header = [0u8; 16];
        header[0..4].copy_from_slice(&((timestamp_us / 1_000_000) as u32).to_le_bytes());
        header[4..8].copy_from_slice(&((timestamp_us % 1_000_000) as u32).to_le_bytes());
        header[8..12].copy_from_slice(&(captured.len() as u32).to_le_bytes());
        header[12..16].copy_from_slice(&wire_length.max(captured.len() as u32).to_le_bytes());

        self.inner.write_all(&header)?;
        self.inner.write_all(captured)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    pub fn into_inner(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}
