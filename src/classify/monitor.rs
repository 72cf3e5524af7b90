//! Classifier thread for an auxiliary capture path

use super::{FormatTracker, StreamFormat, PCM_PERIOD_SIZE};
use crate::audio::TunerSource;
use crate::error::{PatchError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

/// Capture window scanned on each pass
pub const CAPTURE_WINDOW_BYTES: usize = 4096;

/// Latest detection, published as plain scalars the decode path polls
#[derive(Debug)]
pub struct DetectedFormat {
    format: AtomicU8,
    period_size: AtomicUsize,
    /// Set while the stream is bare DTS-CD words rather than bursts
    bare: AtomicBool,
    changes: AtomicU64,
}

impl DetectedFormat {
    pub fn new() -> Self {
        Self {
            format: AtomicU8::new(StreamFormat::Pcm.code()),
            period_size: AtomicUsize::new(PCM_PERIOD_SIZE),
            bare: AtomicBool::new(false),
            changes: AtomicU64::new(0),
        }
    }

    pub fn format(&self) -> StreamFormat {
        StreamFormat::from_code(self.format.load(Ordering::Relaxed))
    }

    pub fn period_size(&self) -> usize {
        self.period_size.load(Ordering::Relaxed)
    }

    pub fn is_bare(&self) -> bool {
        self.bare.load(Ordering::Relaxed)
    }

    /// Number of times the published format changed
    pub fn changes(&self) -> u64 {
        self.changes.load(Ordering::Relaxed)
    }

    pub fn publish(&self, format: StreamFormat, period_size: usize) {
        let previous = self.format.swap(format.code(), Ordering::Relaxed);
        self.period_size.store(period_size, Ordering::Relaxed);
        if previous != format.code() {
            self.changes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Publish the tracker's current verdict
    pub fn publish_from(&self, tracker: &FormatTracker) {
        self.bare.store(tracker.is_bare(), Ordering::Relaxed);
        self.publish(tracker.format(), tracker.period_size());
    }
}

impl Default for DetectedFormat {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs format detection on its own thread until stopped
pub struct FormatMonitor {
    detected: Arc<DetectedFormat>,
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FormatMonitor {
    pub fn spawn(source: Box<dyn TunerSource>, hysteresis_periods: usize) -> Result<Self> {
        let detected = Arc::new(DetectedFormat::new());
        let stop_flag = Arc::new(AtomicBool::new(false));

        let thread_detected = detected.clone();
        let thread_stop = stop_flag.clone();
        let handle = thread::Builder::new()
            .name("format-monitor".into())
            .spawn(move || {
                classifier_thread(source, thread_detected, thread_stop, hysteresis_periods)
            })
            .map_err(|_| PatchError::ThreadSpawn("classifier"))?;

        Ok(Self {
            detected,
            stop_flag,
            handle: Some(handle),
        })
    }

    /// Shared handle to the published detection
    pub fn detected(&self) -> Arc<DetectedFormat> {
        self.detected.clone()
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Classifier thread panicked");
            }
        }
    }
}

impl Drop for FormatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn classifier_thread(
    mut source: Box<dyn TunerSource>,
    detected: Arc<DetectedFormat>,
    stop_flag: Arc<AtomicBool>,
    hysteresis_periods: usize,
) {
    info!("Classifier thread started");

    let mut tracker = FormatTracker::new(hysteresis_periods);
    let mut window = vec![0u8; CAPTURE_WINDOW_BYTES];

    while !stop_flag.load(Ordering::Relaxed) {
        match source.read(&mut window) {
            Ok(0) => thread::sleep(Duration::from_millis(5)),
            Ok(n) => {
                tracker.observe(&window[..n]);
                detected.publish_from(&tracker);
            }
            Err(e) => {
                warn!("Classifier capture error: {}", e);
                thread::sleep(Duration::from_millis(10));
            }
        }
    }

    info!("Classifier thread stopped");
}
