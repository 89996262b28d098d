// Live capture through libpcap.
use pcap::{Active, Capture, Device, Linktype};
use tracing::{debug, info};

use super::{CaptureOptions, Frame, FrameSource};
use crate::error::CaptureError;

/// Compiles `filter` against a dead Ethernet handle, so no interface is touched.
pub fn validate_filter(filter: &str) -> Result<(), CaptureError> {
    if filter.trim().is_empty() {
        return Ok(());
    }
    let dead = Capture::dead(Linktype(1)).map_err(|e| CaptureError::Backend(e.to_string()))?;
    dead.compile(filter, true)
        .map(|_| ())
        .map_err(|e| CaptureError::InvalidFilter {
            filter: filter.to_string(),
            reason: e.to_string(),
        })
}

pub fn list_interfaces() -> Result<Vec<String>, CaptureError> {
    let devices = Device::list().map_err(|e| CaptureError::Backend(e.to_string()))?;
    Ok(devices.into_iter().map(|device| device.name).collect())
}

pub struct LiveSource {
    cap: Capture<Active>,
    link_type: u32,
}

impl LiveSource {
    pub fn open(interface: &str, filter: &str, options: &CaptureOptions) -> Result<Self, CaptureError> {
        if !list_interfaces()?.iter().any(|name| name == interface) {
            return Err(CaptureError::NoSuchInterface {
                interface: interface.to_string(),
            });
        }

        let mut cap = Capture::from_device(interface)
            .map_err(|e| open_error(interface, e))?
            .promisc(false)
            .snaplen(options.snaplen)
            // a short read timeout keeps an idle interface from blocking the stop check
            .timeout(options.read_timeout_ms)
            .immediate_mode(true)
            .open()
            .map_err(|e| open_error(interface, e))?;

        if !filter.trim().is_empty() {
            cap.filter(filter, true).map_err(|e| CaptureError::InvalidFilter {
                filter: filter.to_string(),
                reason: e.to_string(),
            })?;
        }

        let link_type = cap.get_datalink().0 as u32;
        info!("Opened {} (link type {}) with filter '{}'", interface, link_type, filter);
        Ok(Self { cap, link_type })
    }
}

impl FrameSource for LiveSource {
    fn link_type(&self) -> u32 {
        self.link_type
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        match self.cap.next_packet() {
            Ok(packet) => {
                let ts = packet.header.ts;
                Ok(Some(Frame {
                    timestamp_us: ts.tv_sec as i64 * 1_000_000 + ts.tv_usec as i64,
                    wire_length: packet.header.len,
                    data: packet.data.to_vec(),
                }))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(e) => Err(CaptureError::Backend(e.to_string())),
        }
    }
}

fn open_error(interface: &str, err: pcap::Error) -> CaptureError {
    debug!("Opening {} failed: {:?}", interface, err);
    let interface = interface.to_string();
    match err {
        pcap::Error::TimeoutExpired => CaptureError::OpenTimeout { interface },
        pcap::Error::PcapError(message) => {
            let lower = message.to_lowercase();
            if lower.contains("permission") || lower.contains("not permitted") {
                CaptureError::PermissionDenied { interface }
            } else if lower.contains("no such device") || lower.contains("doesn't exist") {
                CaptureError::NoSuchInterface { interface }
            } else {
                CaptureError::Backend(message)
            }
        }
        other => CaptureError::Backend(other.to_string()),
    }
}
