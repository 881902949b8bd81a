//! Per-camera capture worker.
//!
//! Each camera runs on its own thread so sensor latency never stalls the
//! compute pipeline. The worker overwrites a single-slot buffer with the
//! most recent frame; the consumer always sees the freshest frame available
//! and stale frames are dropped without queueing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use super::{Frame, FrameSource, Intrinsics};
use crate::error::{Result, TrackError};

/// How long a worker blocks in the driver per poll before rechecking the
/// stop flag.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Single-slot most-recent-frame buffer (overwrite on write).
pub struct FrameSlot {
    latest: Mutex<Option<Arc<Frame>>>,
    arrived: Condvar,
}

impl FrameSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            latest: Mutex::new(None),
            arrived: Condvar::new(),
        })
    }

    /// Replace the slot content with a newer frame.
    pub fn store(&self, frame: Arc<Frame>) {
        *self.latest.lock() = Some(frame);
        self.arrived.notify_all();
    }

    /// Wait up to `timeout` for a frame with a timestamp different from
    /// `last_seen_ns`. Returns `None` on expiry.
    pub fn wait_newer(&self, last_seen_ns: Option<u64>, timeout: Duration) -> Option<Arc<Frame>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.latest.lock();
        loop {
            if let Some(frame) = guard.as_ref() {
                if last_seen_ns != Some(frame.timestamp_ns) {
                    return Some(frame.clone());
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if self
                .arrived
                .wait_for(&mut guard, deadline - now)
                .timed_out()
            {
                // Re-check once after expiry; the store may have raced the
                // timeout.
                return guard.as_ref().and_then(|frame| {
                    (last_seen_ns != Some(frame.timestamp_ns)).then(|| frame.clone())
                });
            }
        }
    }
}

/// Owns one camera driver thread and its frame slot.
pub struct CaptureWorker {
    name: String,
    intrinsics: Intrinsics,
    provides_depth: bool,
    slot: Arc<FrameSlot>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    /// Spawn the capture thread for `source`.
    pub fn spawn(mut source: Box<dyn FrameSource>) -> Self {
        let name = source.name().to_string();
        let intrinsics = source.intrinsics();
        let provides_depth = source.provides_depth();
        let slot = FrameSlot::new();
        let stop = Arc::new(AtomicBool::new(false));

        let thread_slot = slot.clone();
        let thread_stop = stop.clone();
        let thread_name = name.clone();
        let handle = thread::spawn(move || {
            while !thread_stop.load(Ordering::SeqCst) {
                match source.next_frame(POLL_TIMEOUT) {
                    Ok(frame) => thread_slot.store(frame),
                    Err(TrackError::CameraTimeout { .. }) => continue,
                    Err(err) => {
                        warn!("camera `{}` capture error: {}", thread_name, err);
                    }
                }
            }
        });

        Self {
            name,
            intrinsics,
            provides_depth,
            slot,
            stop,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    pub fn provides_depth(&self) -> bool {
        self.provides_depth
    }

    /// Freshest frame not yet seen by the caller.
    ///
    /// Fails with `CameraTimeout` when no new frame arrives within `timeout`;
    /// the caller skips the frame and retries on the next step.
    pub fn latest(&self, last_seen_ns: Option<u64>, timeout: Duration) -> Result<Arc<Frame>> {
        self.slot
            .wait_newer(last_seen_ns, timeout)
            .ok_or_else(|| TrackError::CameraTimeout {
                camera: self.name.clone(),
                timeout_ms: timeout.as_millis() as u64,
            })
    }

    /// Signal the thread to stop and join it.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
