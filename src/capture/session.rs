use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{after, bounded, select, Sender};
use tracing::{debug, info};

use crate::error::CaptureError;

/// Cooperative stop request shared between a capture loop and whoever may end it.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Completed,
    Aborted,
}

/// State of one capture invocation. Owned by the controller for its whole run.
#[derive(Debug)]
pub struct CaptureSession {
    pub interface: String,
    pub filter: String,
    pub packet_limit: Option<u64>,
    pub duration_limit: Option<Duration>,
    pub packets_captured: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub state: SessionState,
    stop: StopSignal,
}

impl CaptureSession {
    pub fn new(
        interface: impl Into<String>,
        filter: impl Into<String>,
        packet_limit: Option<u64>,
        duration_limit: Option<Duration>,
    ) -> Self {
        Self {
            interface: interface.into(),
            filter: filter.into(),
            packet_limit,
            duration_limit,
            packets_captured: 0,
            started_at: None,
            state: SessionState::Idle,
            stop: StopSignal::new(),
        }
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub(crate) fn packet_limit_reached(&self) -> bool {
        self.packet_limit.map_or(false, |limit| self.packets_captured >= limit)
    }
}

/// Interfaces with a capture in `Running` state, each with the signal that stops it.
#[derive(Debug, Clone, Default)]
pub struct CaptureRegistry {
    active: Arc<Mutex<HashMap<String, StopSignal>>>,
}

impl CaptureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StopSignal>> {
        // a panicking holder cannot leave the map half-updated
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims `interface`; fails fast if it is already claimed.
    pub fn acquire(&self, interface: &str, stop: StopSignal) -> Result<SessionGuard, CaptureError> {
        let mut active = self.lock();
        if active.contains_key(interface) {
            return Err(CaptureError::CaptureInProgress {
                interface: interface.to_string(),
            });
        }
        active.insert(interface.to_string(), stop);
        Ok(SessionGuard {
            registry: self.clone(),
            interface: interface.to_string(),
        })
    }

    pub fn is_running(&self, interface: &str) -> bool {
        self.lock().contains_key(interface)
    }

    /// Asks the capture on `interface` to stop. Returns false when none is running.
    pub fn cancel(&self, interface: &str) -> bool {
        match self.lock().get(interface) {
            Some(stop) => {
                info!("Stop requested for capture on {}", interface);
                stop.raise();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for stop in self.lock().values() {
            stop.raise();
        }
    }
}

/// Releases the interface claim when dropped.
#[derive(Debug)]
pub struct SessionGuard {
    registry: CaptureRegistry,
    interface: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.interface);
    }
}

/// Raises a stop signal once `limit` has elapsed, unless dropped first.
pub(crate) struct DurationTimer {
    done: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl DurationTimer {
    pub(crate) fn start(limit: Duration, stop: StopSignal) -> Self {
        let (done, finished) = bounded::<()>(1);
        let handle = thread::spawn(move || {
            select! {
                recv(after(limit)) -> _ => {
                    debug!("Capture duration of {:?} elapsed", limit);
                    stop.raise();
                }
                recv(finished) -> _ => {}
            }
        });
        Self {
            done: Some(done),
            handle: Some(handle),
        }
    }
}

impl Drop for DurationTimer {
    fn drop(&mut self) {
        // disconnecting the channel wakes the timer thread
        self.done.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
