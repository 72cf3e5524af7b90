//! Audio/video clock synchronization

mod clock;
mod pts;

pub use clock::{
    parse_hex_register, ClockEvent, ClockSource, MemoryClock, RegisterClock, RegisterPaths,
};
pub use pts::{
    PtsSynchronizer, SyncAction, SyncThresholds, DEFAULT_DISCONTINUITY_THRESHOLD,
    DEFAULT_SOFT_THRESHOLD, PTS_CLOCK_HZ,
};
