//! Bounded live capture into a pcap file.
//!
//! A capture stops on whichever bound is reached first: `packet_limit`
//! frames written, or `duration_limit` elapsed. Both may be given; they are
//! independent triggers and the first one wins. External cancellation goes
//! through the same [`StopSignal`] as the duration timer, and the loop only
//! looks at it between frames, so the file always ends on a whole record.

pub mod live;
pub mod session;

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::decode::writer::PcapWriter;
use crate::error::CaptureError;
pub use live::{list_interfaces, validate_filter, LiveSource};
pub use session::{CaptureRegistry, CaptureSession, SessionState, StopSignal};
use session::DurationTimer;

#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp_us: i64,
    pub wire_length: u32,
    pub data: Vec<u8>,
}

/// Anything that yields captured frames. `Ok(None)` means nothing arrived
/// within the source's read timeout.
pub trait FrameSource {
    fn link_type(&self) -> u32;
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;
}

pub trait FrameSink {
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

impl<W: Write> FrameSink for PcapWriter<W> {
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.write_record(frame.timestamp_us, frame.wire_length, &frame.data)
    }

    fn flush(&mut self) -> io::Result<()> {
        PcapWriter::flush(self)
    }
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub snaplen: i32,
    pub read_timeout_ms: i32,
    pub default_duration: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            snaplen: 65535,
            read_timeout_ms: 100,
            default_duration: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub interface: String,
    pub filter: String,
    pub packet_limit: Option<u64>,
    pub duration_limit: Option<Duration>,
}

impl CaptureRequest {
    /// The bounds a session runs under. A time bound always applies: without
    /// an explicit duration the default races the packet limit.
    pub fn limits(&self, default_duration: Duration) -> Result<(Option<u64>, Duration), CaptureError> {
        if self.packet_limit == Some(0) {
            return Err(CaptureError::InvalidLimit("packet count must be positive".into()));
        }
        if self.duration_limit == Some(Duration::ZERO) {
            return Err(CaptureError::InvalidLimit("duration must be positive".into()));
        }
        Ok((self.packet_limit, self.duration_limit.unwrap_or(default_duration)))
    }
}

#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub path: PathBuf,
    pub packets: u64,
    pub state: SessionState,
}

/// Validates, claims the interface, opens it and captures into `output_dir`.
/// Blocks until a bound is reached or the capture is cancelled.
pub fn start_capture(
    request: CaptureRequest,
    registry: &CaptureRegistry,
    output_dir: &Path,
    options: &CaptureOptions,
) -> Result<CaptureOutcome, CaptureError> {
    let (packet_limit, duration_limit) = request.limits(options.default_duration)?;
    validate_filter(&request.filter)?;

    let mut session = CaptureSession::new(
        request.interface.clone(),
        request.filter.clone(),
        packet_limit,
        Some(duration_limit),
    );

    let _guard = registry.acquire(&session.interface, session.stop_signal())?;
    let mut source = LiveSource::open(&session.interface, &session.filter, options)?;

    let path = output_dir.join(capture_file_name(&session.interface));
    let packets = capture_to_file(&mut session, &mut source, &path, options.snaplen.max(0) as u32)?;

    Ok(CaptureOutcome {
        path,
        packets,
        state: session.state,
    })
}

/// Runs `session` against `source`, writing to a new file at `path`.
/// The file is removed if the capture aborts.
pub fn capture_to_file<S: FrameSource>(
    session: &mut CaptureSession,
    source: &mut S,
    path: &Path,
    snaplen: u32,
) -> Result<u64, CaptureError> {
    let file = File::create(path)?;
    let mut sink = PcapWriter::new(BufWriter::new(file), source.link_type(), snaplen)?;

    match run_session(session, source, &mut sink) {
        Ok(count) => {
            info!("Captured {} packets on {} into {}", count, session.interface, path.display());
            Ok(count)
        }
        Err(err) => {
            drop(sink);
            if let Err(remove_err) = fs::remove_file(path) {
                warn!("Could not remove partial capture {}: {}", path.display(), remove_err);
            }
            Err(err)
        }
    }
}

/// The capture loop. Checks the stop signal and packet bound between frames,
/// never while a frame is being written.
pub fn run_session<S: FrameSource, K: FrameSink>(
    session: &mut CaptureSession,
    source: &mut S,
    sink: &mut K,
) -> Result<u64, CaptureError> {
    let stop = session.stop_signal();
    session.state = SessionState::Running;
    session.started_at = Some(Utc::now());
    info!(
        "Capture on {} started (packet limit {:?}, duration limit {:?})",
        session.interface, session.packet_limit, session.duration_limit
    );

    let _timer = session
        .duration_limit
        .map(|limit| DurationTimer::start(limit, stop.clone()));

    let result = loop {
        if stop.is_raised() || session.packet_limit_reached() {
            break Ok(());
        }
        match source.next_frame() {
            Ok(Some(frame)) => {
                if let Err(err) = sink.write_frame(&frame) {
                    break Err(CaptureError::Io(err));
                }
                session.packets_captured += 1;
            }
            Ok(None) => continue,
            Err(err) => break Err(err),
        }
    };

    let result = result.and_then(|()| sink.flush().map_err(CaptureError::Io));
    match result {
        Ok(()) => {
            session.state = SessionState::Completed;
            Ok(session.packets_captured)
        }
        Err(err) => {
            error!("Capture on {} aborted: {}", session.interface, err);
            session.state = SessionState::Aborted;
            Err(err)
        }
    }
}

fn capture_file_name(interface: &str) -> String {
    let iface: String = interface
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("capture_{}_{}.pcap", iface, Utc::now().format("%Y%m%d_%H%M%S_%3f"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode_file;
    use crate::fixtures::tcp_frame;
    use std::thread;
    use std::time::Instant;

    /// Emits a TCP frame every `interval`, forever.
    struct SteadyFeed {
        interval: Duration,
        sent: u64,
    }

    impl FrameSource for SteadyFeed {
        fn link_type(&self) -> u32 {
            1
        }

        fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            thread::sleep(self.interval);
            self.sent += 1;
            let data = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 40000, 443, b"tick");
            Ok(Some(Frame {
                timestamp_us: 1_000_000 + self.sent as i64 * 1_000,
                wire_length: data.len() as u32,
                data,
            }))
        }
    }

    /// Never produces a frame, like an interface with no traffic.
    struct IdleFeed;

    impl FrameSource for IdleFeed {
        fn link_type(&self) -> u32 {
            1
        }

        fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            thread::sleep(Duration::from_millis(10));
            Ok(None)
        }
    }

    struct FailingFeed;

    impl FrameSource for FailingFeed {
        fn link_type(&self) -> u32 {
            1
        }

        fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            Err(CaptureError::Backend("interface went down".into()))
        }
    }

    #[test]
    fn duration_wins_over_unreached_packet_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bounded.pcap");
        let mut session = CaptureSession::new("test0", "", Some(10), Some(Duration::from_millis(150)));
        let mut feed = SteadyFeed { interval: Duration::from_millis(40), sent: 0 };

        let count = capture_to_file(&mut session, &mut feed, &path, 65535).unwrap();

        assert!(count < 10);
        assert_eq!(session.state, SessionState::Completed);
        let decoded = decode_file(&path).unwrap();
        assert!(decoded.is_complete());
        assert_eq!(decoded.packets.len() as u64, count);
    }

    #[test]
    fn packet_limit_wins_when_reached_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counted.pcap");
        let mut session = CaptureSession::new("test0", "", Some(5), Some(Duration::from_secs(30)));
        let mut feed = SteadyFeed { interval: Duration::from_millis(1), sent: 0 };

        let started = Instant::now();
        let count = capture_to_file(&mut session, &mut feed, &path, 65535).unwrap();

        assert_eq!(count, 5);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(decode_file(&path).unwrap().packets.len(), 5);
    }

    #[test]
    fn idle_interface_stops_on_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idle.pcap");
        let mut session = CaptureSession::new("test0", "", None, Some(Duration::from_millis(100)));

        let started = Instant::now();
        let count = capture_to_file(&mut session, &mut IdleFeed, &path, 65535).unwrap();

        assert_eq!(count, 0);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(decode_file(&path).unwrap().packets.is_empty());
    }

    #[test]
    fn external_stop_ends_capture_on_record_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cancelled.pcap");
        let mut session = CaptureSession::new("test0", "", None, None);
        let stop = session.stop_signal();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            stop.raise();
        });

        let mut feed = SteadyFeed { interval: Duration::from_millis(5), sent: 0 };
        let count = capture_to_file(&mut session, &mut feed, &path, 65535).unwrap();
        canceller.join().unwrap();

        let decoded = decode_file(&path).unwrap();
        assert!(decoded.is_complete());
        assert_eq!(decoded.packets.len() as u64, count);
    }

    #[test]
    fn backend_failure_aborts_and_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pcap");
        let mut session = CaptureSession::new("test0", "", Some(3), None);

        let err = capture_to_file(&mut session, &mut FailingFeed, &path, 65535).unwrap_err();

        assert!(matches!(err, CaptureError::Backend(_)));
        assert_eq!(session.state, SessionState::Aborted);
        assert!(!path.exists());
    }

    #[test]
    fn invalid_filter_fails_before_claiming_interface() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CaptureRegistry::new();
        let request = CaptureRequest {
            interface: "definitely-not-an-interface0".into(),
            filter: "port port port".into(),
            packet_limit: Some(1),
            duration_limit: None,
        };

        let err = start_capture(request, &registry, dir.path(), &CaptureOptions::default()).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidFilter { .. }));
        assert!(!registry.is_running("definitely-not-an-interface0"));
    }

    #[test]
    fn busy_interface_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CaptureRegistry::new();
        let _held = registry.acquire("busy0", StopSignal::new()).unwrap();
        let request = CaptureRequest {
            interface: "busy0".into(),
            filter: String::new(),
            packet_limit: Some(1),
            duration_limit: None,
        };

        let err = start_capture(request, &registry, dir.path(), &CaptureOptions::default()).unwrap_err();
        assert!(matches!(err, CaptureError::CaptureInProgress { .. }));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let request = CaptureRequest {
            interface: "lo".into(),
            filter: String::new(),
            packet_limit: Some(0),
            duration_limit: None,
        };
        let err = start_capture(request, &CaptureRegistry::new(), dir.path(), &CaptureOptions::default()).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidLimit(_)));
    }

    fn request(packet_limit: Option<u64>, duration_limit: Option<Duration>) -> CaptureRequest {
        CaptureRequest {
            interface: "lo".into(),
            filter: String::new(),
            packet_limit,
            duration_limit,
        }
    }

    #[test]
    fn count_only_request_still_gets_default_duration() {
        let default = Duration::from_secs(10);
        let (packets, duration) = request(Some(100), None).limits(default).unwrap();
        assert_eq!(packets, Some(100));
        assert_eq!(duration, default);

        let (packets, duration) = request(None, None).limits(default).unwrap();
        assert_eq!(packets, None);
        assert_eq!(duration, default);

        let (_, duration) = request(Some(5), Some(Duration::from_secs(2))).limits(default).unwrap();
        assert_eq!(duration, Duration::from_secs(2));

        assert!(matches!(
            request(None, Some(Duration::ZERO)).limits(default),
            Err(CaptureError::InvalidLimit(_))
        ));
    }

    #[test]
    fn quiet_interface_with_count_limit_ends_on_default_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quiet.pcap");
        let (packet_limit, duration_limit) = request(Some(100), None)
            .limits(Duration::from_millis(80))
            .unwrap();
        let mut session = CaptureSession::new("test0", "", packet_limit, Some(duration_limit));

        let started = Instant::now();
        let count = capture_to_file(&mut session, &mut IdleFeed, &path, 65535).unwrap();

        assert_eq!(count, 0);
        assert_eq!(session.state, SessionState::Completed);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn capture_file_names_are_filesystem_safe() {
        let name = capture_file_name("en0:1/x");
        assert!(name.starts_with("capture_en0_1_x_"));
        assert!(name.ends_with(".pcap"));
    }
}
