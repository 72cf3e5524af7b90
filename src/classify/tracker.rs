//! Format hysteresis across consecutive capture windows

use super::{scan, StreamFormat, PCM_PERIOD_SIZE};
use tracing::{debug, info};

/// Default number of periods without a sync hit before reverting to PCM
pub const DEFAULT_HYSTERESIS_PERIODS: usize = 2;

/// Tracks the current stream format over a sequence of reads
///
/// A compressed sync hit switches format immediately. Falling back to PCM
/// only happens after `hysteresis_periods` whole periods of the current
/// format pass without any sync.
#[derive(Debug, Clone)]
pub struct FormatTracker {
    format: StreamFormat,
    period_size: usize,
    bytes_since_sync: usize,
    hysteresis_periods: usize,
    /// Last sync was a bare DTS-CD word rather than a burst
    bare: bool,
}

impl FormatTracker {
    pub fn new(hysteresis_periods: usize) -> Self {
        Self {
            format: StreamFormat::Pcm,
            period_size: PCM_PERIOD_SIZE,
            bytes_since_sync: 0,
            hysteresis_periods: hysteresis_periods.max(1),
            bare: false,
        }
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn period_size(&self) -> usize {
        self.period_size
    }

    /// Whether the stream carries frames without a burst wrapper
    pub fn is_bare(&self) -> bool {
        self.bare
    }

    /// Feed one capture window and return the format in effect after it
    pub fn observe(&mut self, window: &[u8]) -> StreamFormat {
        match scan(window) {
            Some(detection) => {
                if detection.format != self.format || detection.period_size != self.period_size {
                    info!(
                        "Stream format {} -> {} (period {} bytes)",
                        self.format, detection.format, detection.period_size
                    );
                }
                self.format = detection.format;
                self.period_size = detection.period_size;
                self.bare = detection.envelope.is_none();
                self.bytes_since_sync = window.len() - detection.offset;
            }
            None => {
                self.bytes_since_sync = self.bytes_since_sync.saturating_add(window.len());
                if self.format.is_compressed()
                    && self.bytes_since_sync >= self.hysteresis_periods * self.period_size
                {
                    debug!(
                        "No sync for {} bytes, reverting {} -> PCM",
                        self.bytes_since_sync, self.format
                    );
                    self.format = StreamFormat::Pcm;
                    self.period_size = PCM_PERIOD_SIZE;
                    self.bare = false;
                }
            }
        }
        self.format
    }

    pub fn reset(&mut self) {
        self.format = StreamFormat::Pcm;
        self.period_size = PCM_PERIOD_SIZE;
        self.bytes_since_sync = 0;
        self.bare = false;
    }
}

impl Default for FormatTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HYSTERESIS_PERIODS)
    }
}
