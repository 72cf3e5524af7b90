//! System clock registers the synchronizer reads and writes

use crate::error::{PatchError, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Tagged directive written to the event register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    /// First audio of a stream will present at this PTS
    AudioStart(u64),
    /// Presentation should jump to this PTS instead of slewing
    Discontinuity(u64),
}

impl fmt::Display for ClockEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockEvent::AudioStart(pts) => write!(f, "AUDIO_START:{:#x}", pts),
            ClockEvent::Discontinuity(pts) => write!(f, "AUDIO_TSTAMP_DISCONTINUITY:{:#x}", pts),
        }
    }
}

/// Source of the shared audio/video presentation clock
///
/// All PTS values are 90 kHz ticks. A value of 0 means "unknown".
pub trait ClockSource: Send + Sync {
    /// Current audio play clock
    fn play_pts(&self) -> Result<u64>;

    /// Current video clock
    fn video_pts(&self) -> Result<u64>;

    /// Timestamp of the first audio checkin since stream start
    fn first_checkin_apts(&self) -> Result<u64>;

    /// PTS the demultiplexer recorded for a decoder byte offset
    fn lookup_pts(&self, decoder_offset: u64) -> Result<u64>;

    /// Overwrite the audio play clock
    fn set_play_pts(&self, pts: u64) -> Result<()>;

    fn post_event(&self, event: ClockEvent) -> Result<()>;
}

/// Parse a hexadecimal register line, with or without a `0x` prefix
pub fn parse_hex_register(text: &str) -> Option<u64> {
    let line = text.lines().next()?.trim();
    let digits = line
        .strip_prefix("0x")
        .or_else(|| line.strip_prefix("0X"))
        .unwrap_or(line);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Locations of the text registers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterPaths {
    pub play_pts: PathBuf,
    pub video_pts: PathBuf,
    pub first_checkin_apts: PathBuf,
    /// Written with the decimal decoder offset before each lookup
    pub lookup_request: PathBuf,
    pub lookup_result: PathBuf,
    pub event: PathBuf,
}

impl RegisterPaths {
    /// Standard register names under one directory
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        Self {
            play_pts: dir.join("pts_audio"),
            video_pts: dir.join("pts_video"),
            first_checkin_apts: dir.join("first_apts"),
            lookup_request: dir.join("pts_lookup_offset"),
            lookup_result: dir.join("pts_lookup"),
            event: dir.join("event"),
        }
    }
}

/// Clock backed by small text files such as sysfs attributes
pub struct RegisterClock {
    paths: RegisterPaths,
}

impl RegisterClock {
    pub fn new(paths: RegisterPaths) -> Self {
        debug!("Clock registers: {:?}", paths);
        Self { paths }
    }

    pub fn paths(&self) -> &RegisterPaths {
        &self.paths
    }

    fn read_register(&self, path: &Path) -> Result<u64> {
        let text = fs::read_to_string(path).map_err(|e| PatchError::ClockRead {
            register: path.display().to_string(),
            message: e.to_string(),
        })?;
        parse_hex_register(&text).ok_or_else(|| PatchError::ClockRead {
            register: path.display().to_string(),
            message: format!("not a hex value: {:?}", text.trim()),
        })
    }

    fn write_register(&self, path: &Path, value: &str) -> Result<()> {
        trace!("{} <- {}", path.display(), value);
        fs::write(path, value).map_err(|e| PatchError::ClockWrite {
            register: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

impl ClockSource for RegisterClock {
    fn play_pts(&self) -> Result<u64> {
        self.read_register(&self.paths.play_pts)
    }

    fn video_pts(&self) -> Result<u64> {
        self.read_register(&self.paths.video_pts)
    }

    fn first_checkin_apts(&self) -> Result<u64> {
        self.read_register(&self.paths.first_checkin_apts)
    }

    fn lookup_pts(&self, decoder_offset: u64) -> Result<u64> {
        self.write_register(&self.paths.lookup_request, &decoder_offset.to_string())?;
        self.read_register(&self.paths.lookup_result)
    }

    fn set_play_pts(&self, pts: u64) -> Result<()> {
        self.write_register(&self.paths.play_pts, &format!("{:#x}", pts))
    }

    fn post_event(&self, event: ClockEvent) -> Result<()> {
        debug!("Clock event: {}", event);
        self.write_register(&self.paths.event, &event.to_string())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    play_pts: u64,
    video_pts: u64,
    first_checkin_apts: u64,
    checkins: BTreeMap<u64, u64>,
    events: Vec<ClockEvent>,
    play_writes: u64,
    fail_reads: bool,
}

/// In-process clock, cloned handles share state
#[derive(Debug, Clone, Default)]
pub struct MemoryClock {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_video_pts(&self, pts: u64) {
        self.state.lock().video_pts = pts;
    }

    pub fn set_first_checkin_apts(&self, pts: u64) {
        self.state.lock().first_checkin_apts = pts;
    }

    /// Move the play clock the way a running system clock would
    ///
    /// Unlike `set_play_pts` this is not counted as a correction.
    pub fn advance_play_clock(&self, pts: u64) {
        self.state.lock().play_pts = pts;
    }

    /// Record that data at `offset` carries `pts`
    pub fn checkin(&self, offset: u64, pts: u64) {
        self.state.lock().checkins.insert(offset, pts);
    }

    /// Make every read fail, as if the registers vanished
    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    pub fn events(&self) -> Vec<ClockEvent> {
        self.state.lock().events.clone()
    }

    /// Number of direct play clock overwrites
    pub fn play_writes(&self) -> u64 {
        self.state.lock().play_writes
    }

    fn read(&self, pick: impl FnOnce(&MemoryState) -> u64) -> Result<u64> {
        let state = self.state.lock();
        if state.fail_reads {
            return Err(PatchError::ClockRead {
                register: "memory".to_string(),
                message: "reads disabled".to_string(),
            });
        }
        Ok(pick(&state))
    }
}

impl ClockSource for MemoryClock {
    fn play_pts(&self) -> Result<u64> {
        self.read(|s| s.play_pts)
    }

    fn video_pts(&self) -> Result<u64> {
        self.read(|s| s.video_pts)
    }

    fn first_checkin_apts(&self) -> Result<u64> {
        self.read(|s| s.first_checkin_apts)
    }

    fn lookup_pts(&self, decoder_offset: u64) -> Result<u64> {
        self.read(|s| {
            s.checkins
                .range(..=decoder_offset)
                .next_back()
                .map(|(_, pts)| *pts)
                .unwrap_or(0)
        })
    }

    fn set_play_pts(&self, pts: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.play_pts = pts;
        state.play_writes += 1;
        Ok(())
    }

    fn post_event(&self, event: ClockEvent) -> Result<()> {
        let mut state = self.state.lock();
        let (ClockEvent::AudioStart(pts) | ClockEvent::Discontinuity(pts)) = event;
        state.play_pts = pts;
        state.events.push(event);
        Ok(())
    }
}
