//! Presentation timestamp tracking and play clock reconciliation

use super::{ClockEvent, ClockSource};
use crate::audio::{OUTPUT_FRAME_BYTES, TARGET_SAMPLE_RATE};
use tracing::{debug, info, trace, warn};

/// Ticks per second of the presentation clock
pub const PTS_CLOCK_HZ: u64 = 90_000;

/// Drift below this is left alone
pub const DEFAULT_SOFT_THRESHOLD: u64 = 900; // 10ms

/// Drift at or above this is signalled as a jump
pub const DEFAULT_DISCONTINUITY_THRESHOLD: u64 = 27_000; // 300ms

/// Drift thresholds in 90 kHz ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncThresholds {
    pub soft: u64,
    pub discontinuity: u64,
}

impl Default for SyncThresholds {
    fn default() -> Self {
        Self {
            soft: DEFAULT_SOFT_THRESHOLD,
            discontinuity: DEFAULT_DISCONTINUITY_THRESHOLD,
        }
    }
}

/// Outcome of comparing computed audio PTS with the play clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Noop,
    /// Play clock was overwritten with this value
    SoftCorrect(u64),
    /// Discontinuity event issued with this value
    Discontinuity(u64),
}

/// Per-stream PTS state, owned by the output thread
pub struct PtsSynchronizer {
    thresholds: SyncThresholds,
    sample_rate: u32,
    /// Last PTS obtained from the lookup register
    last_valid_pts: u64,
    /// Output bytes rendered since `last_valid_pts`
    outlen_since_last_valid: u64,
    first_lookup_done: bool,
    audio_started: bool,
    lookup_errors: u64,
}

impl PtsSynchronizer {
    pub fn new(thresholds: SyncThresholds) -> Self {
        Self {
            thresholds,
            sample_rate: TARGET_SAMPLE_RATE,
            last_valid_pts: 0,
            outlen_since_last_valid: 0,
            first_lookup_done: false,
            audio_started: false,
            lookup_errors: 0,
        }
    }

    pub fn thresholds(&self) -> SyncThresholds {
        self.thresholds
    }

    pub fn last_valid_pts(&self) -> u64 {
        self.last_valid_pts
    }

    pub fn outlen_since_last_valid(&self) -> u64 {
        self.outlen_since_last_valid
    }

    pub fn is_started(&self) -> bool {
        self.audio_started
    }

    pub fn lookup_errors(&self) -> u64 {
        self.lookup_errors
    }

    /// Rate of the rendered stream, used for extrapolation
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        if sample_rate > 0 {
            self.sample_rate = sample_rate;
        }
    }

    /// Forget everything, called on each stream start
    pub fn reset(&mut self) {
        self.last_valid_pts = 0;
        self.outlen_since_last_valid = 0;
        self.first_lookup_done = false;
        self.audio_started = false;
        self.lookup_errors = 0;
    }

    /// Account for bytes handed to the render sink
    pub fn record_output(&mut self, bytes: usize) {
        self.outlen_since_last_valid += bytes as u64;
    }

    /// Ticks covered by `bytes` of rendered output
    pub fn extrapolate(&self, bytes: u64) -> u64 {
        let frames = bytes / OUTPUT_FRAME_BYTES as u64;
        frames * PTS_CLOCK_HZ / self.sample_rate as u64
    }

    /// PTS of the audio at `decoder_offset`
    ///
    /// A lookup that yields 0 or repeats the last value is ignored and the PTS
    /// is extrapolated from the output rendered since the last valid reading.
    pub fn compute_pts(&mut self, clock: &dyn ClockSource, decoder_offset: u64) -> u64 {
        self.compute_pts_after(clock, decoder_offset, 0)
    }

    /// PTS of the audio `played` rendered bytes past the input at `decoder_offset`
    pub fn compute_pts_after(
        &mut self,
        clock: &dyn ClockSource,
        decoder_offset: u64,
        played: u64,
    ) -> u64 {
        let mut looked_up = match clock.lookup_pts(decoder_offset) {
            Ok(pts) => pts,
            Err(e) => {
                self.lookup_errors += 1;
                if self.lookup_errors == 1 {
                    warn!("PTS lookup failed, extrapolating: {}", e);
                }
                0
            }
        };

        if !self.first_lookup_done {
            self.first_lookup_done = true;
            if looked_up == 0 {
                looked_up = clock.first_checkin_apts().unwrap_or(0);
                debug!("Using first checkin APTS {:#x}", looked_up);
            }
        }

        if looked_up != 0 && looked_up != self.last_valid_pts {
            trace!(
                "PTS lookup offset={} pts={:#x}",
                decoder_offset,
                looked_up
            );
            self.last_valid_pts = looked_up;
            self.outlen_since_last_valid = played;
            return looked_up + self.extrapolate(played);
        }

        self.last_valid_pts + self.extrapolate(self.outlen_since_last_valid)
    }

    /// Classify the drift between `pts` and `system_clock`
    pub fn decide(&self, pts: u64, system_clock: u64) -> SyncAction {
        let diff = pts.abs_diff(system_clock);
        if diff < self.thresholds.soft {
            SyncAction::Noop
        } else if diff < self.thresholds.discontinuity {
            SyncAction::SoftCorrect(pts)
        } else {
            SyncAction::Discontinuity(pts)
        }
    }

    /// Compare `pts` with the play clock and correct it if needed
    ///
    /// The first call after a reset posts the audio start event instead.
    pub fn reconcile(&mut self, clock: &dyn ClockSource, pts: u64) -> SyncAction {
        if !self.audio_started {
            self.audio_started = true;
            info!("Audio start at PTS {:#x}", pts);
            if let Err(e) = clock.post_event(ClockEvent::AudioStart(pts)) {
                warn!("Failed to post audio start: {}", e);
            }
            return SyncAction::Noop;
        }

        let system_clock = match clock.play_pts() {
            Ok(v) => v,
            Err(e) => {
                trace!("Play clock unavailable: {}", e);
                return SyncAction::Noop;
            }
        };

        let action = self.decide(pts, system_clock);
        let applied = match action {
            SyncAction::Noop => Ok(()),
            SyncAction::SoftCorrect(v) => {
                debug!("Soft PTS correction {:#x} -> {:#x}", system_clock, v);
                clock.set_play_pts(v)
            }
            SyncAction::Discontinuity(v) => {
                info!(
                    "PTS discontinuity: play clock {:#x}, audio {:#x}",
                    system_clock, v
                );
                clock.post_event(ClockEvent::Discontinuity(v))
            }
        };
        if let Err(e) = applied {
            warn!("Failed to apply {:?}: {}", action, e);
        }
        action
    }
}

impl Default for PtsSynchronizer {
    fn default() -> Self {
        Self::new(SyncThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::MemoryClock;

    #[test]
    fn test_decide_thresholds() {
        let sync = PtsSynchronizer::default();
        assert_eq!(sync.decide(1000, 1005), SyncAction::Noop);
        assert_eq!(sync.decide(1000, 50_000), SyncAction::Discontinuity(1000));
        assert_eq!(sync.decide(10_000, 5_000), SyncAction::SoftCorrect(10_000));
        assert_eq!(sync.decide(1000, 1000 + 900), SyncAction::SoftCorrect(1000));
    }

    #[test]
    fn test_no_delta_is_stable() {
        let clock = MemoryClock::new();
        clock.checkin(0, 45_000);
        let mut sync = PtsSynchronizer::default();

        let mut last = sync.compute_pts(&clock, 0);
        assert_eq!(last, 45_000);
        for _ in 0..100 {
            let pts = sync.compute_pts(&clock, 0);
            assert!(pts >= last);
            assert_eq!(pts, 45_000);
            last = pts;
        }
    }

    #[test]
    fn test_extrapolates_between_checkins() {
        let clock = MemoryClock::new();
        clock.checkin(0, 90_000);
        let mut sync = PtsSynchronizer::default();
        assert_eq!(sync.compute_pts(&clock, 0), 90_000);

        // 48000 frames is one second of output
        let mut last = 90_000;
        for _ in 0..10 {
            sync.record_output(4800 * 4);
            let pts = sync.compute_pts(&clock, 100);
            assert!(pts > last);
            last = pts;
        }
        assert_eq!(last, 180_000);

        clock.checkin(100_000, 200_000);
        assert_eq!(sync.compute_pts(&clock, 100_000), 200_000);
        assert_eq!(sync.outlen_since_last_valid(), 0);
    }

    #[test]
    fn test_first_checkin_fallback() {
        let clock = MemoryClock::new();
        clock.set_first_checkin_apts(7_000);
        let mut sync = PtsSynchronizer::default();
        assert_eq!(sync.compute_pts(&clock, 0), 7_000);

        // Only consulted on the first lookup after a reset
        clock.set_first_checkin_apts(99_000);
        assert_eq!(sync.compute_pts(&clock, 0), 7_000);
        sync.reset();
        assert_eq!(sync.compute_pts(&clock, 0), 99_000);
    }

    #[test]
    fn test_lookup_errors_fall_back_to_extrapolation() {
        let clock = MemoryClock::new();
        clock.checkin(0, 1_000);
        let mut sync = PtsSynchronizer::default();
        assert_eq!(sync.compute_pts(&clock, 0), 1_000);

        clock.set_fail_reads(true);
        sync.record_output(480 * 4);
        assert_eq!(sync.compute_pts(&clock, 0), 1_900);
        assert_eq!(sync.lookup_errors(), 1);
    }

    #[test]
    fn test_reconcile_sequence() {
        let clock = MemoryClock::new();
        let mut sync = PtsSynchronizer::default();

        assert_eq!(sync.reconcile(&clock, 1000), SyncAction::Noop);
        assert_eq!(clock.events(), vec![ClockEvent::AudioStart(1000)]);

        assert_eq!(sync.reconcile(&clock, 1005), SyncAction::Noop);
        assert_eq!(sync.reconcile(&clock, 3000), SyncAction::SoftCorrect(3000));
        assert_eq!(clock.play_writes(), 1);
        assert_eq!(clock.play_pts().unwrap(), 3000);

        assert_eq!(
            sync.reconcile(&clock, 100_000),
            SyncAction::Discontinuity(100_000)
        );
        assert_eq!(
            clock.events().last(),
            Some(&ClockEvent::Discontinuity(100_000))
        );
        // Jump was not a direct overwrite
        assert_eq!(clock.play_writes(), 1);
    }

    #[test]
    fn test_pts_after_played_bytes() {
        let clock = MemoryClock::new();
        clock.checkin(0, 90_000);
        clock.checkin(256, 92_880);
        let mut sync = PtsSynchronizer::default();

        // 1000 frames into the frame at offset 0
        sync.record_output(4000);
        assert_eq!(sync.compute_pts_after(&clock, 0, 4000), 91_875);

        // Still inside it, extrapolated from the same reading
        sync.record_output(2000);
        assert_eq!(sync.compute_pts_after(&clock, 0, 6000), 92_812);

        // 100 frames into the next frame
        sync.record_output(544);
        assert_eq!(sync.compute_pts_after(&clock, 256, 400), 93_067);
        assert_eq!(sync.outlen_since_last_valid(), 400);
    }

    #[test]
    fn test_extrapolate_other_rates() {
        let mut sync = PtsSynchronizer::default();
        sync.set_sample_rate(32_000);
        assert_eq!(sync.extrapolate(32_000 * 4), PTS_CLOCK_HZ);
        sync.set_sample_rate(0);
        assert_eq!(sync.extrapolate(32 * 4), 90);
    }
}
