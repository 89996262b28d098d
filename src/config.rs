//! Runtime settings. Every flag has a `NETCAP_*` environment fallback, and
//! `main` loads a `.env` file first so either source works.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::capture::CaptureOptions;
use crate::report::timeline::TimelineOptions;

#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// Working directory holding capture files
    #[arg(long, env = "NETCAP_STORE_DIR", default_value = "/tmp/netcap_uploads")]
    pub store_dir: PathBuf,

    /// Capture duration in seconds when a request gives neither count nor duration
    #[arg(long, env = "NETCAP_DEFAULT_DURATION", default_value_t = 10)]
    pub default_duration_secs: u64,

    /// Bytes kept per captured frame
    #[arg(long, env = "NETCAP_SNAPLEN", default_value_t = 65535)]
    pub snaplen: i32,

    /// libpcap read timeout; bounds how late a stop request is noticed
    #[arg(long, env = "NETCAP_READ_TIMEOUT_MS", default_value_t = 100)]
    pub read_timeout_ms: i32,

    /// Maximum event rows rendered in a timeline report
    #[arg(long, env = "NETCAP_MAX_TIMELINE_EVENTS", default_value_t = 5000)]
    pub max_timeline_events: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("/tmp/netcap_uploads"),
            default_duration_secs: 10,
            snaplen: 65535,
            read_timeout_ms: 100,
            max_timeline_events: 5000,
        }
    }
}

impl Settings {
    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            snaplen: self.snaplen,
            read_timeout_ms: self.read_timeout_ms,
            default_duration: Duration::from_secs(self.default_duration_secs),
        }
    }

    pub fn timeline_options(&self) -> TimelineOptions {
        TimelineOptions {
            max_rendered_events: Some(self.max_timeline_events),
            ..TimelineOptions::default()
        }
    }
}
