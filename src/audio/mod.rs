//! Audio types, byte sources and sinks, ring buffering and rate conversion

mod buffer;
mod capture;
mod renderer;
mod resample;

pub use buffer::{RingBuffer, WriteStatus};
pub use capture::{ReaderSource, TunerSource};
pub use renderer::{MemorySink, NullSink, RenderSink, WriterSink};
pub use resample::Resampler;

/// Sample rate every leg of the pipeline is rendered at
pub const TARGET_SAMPLE_RATE: u32 = 48_000;

/// Bytes per stereo 16-bit frame at the render sink
pub const OUTPUT_FRAME_BYTES: usize = 4;

/// Codec carried by a compressed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Pcm,
    Ac3,
    Eac3,
    Dts,
    DtsHd,
    TrueHd,
}

impl Codec {
    /// Whether frames of this codec go through the Dolby engine family
    pub fn is_dolby(&self) -> bool {
        matches!(self, Codec::Ac3 | Codec::Eac3)
    }

    /// Whether frames of this codec go through the DTS engine family
    pub fn is_dts(&self) -> bool {
        matches!(self, Codec::Dts | Codec::DtsHd)
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Codec::Pcm => "PCM",
            Codec::Ac3 => "AC-3",
            Codec::Eac3 => "E-AC-3",
            Codec::Dts => "DTS",
            Codec::DtsHd => "DTS-HD",
            Codec::TrueHd => "TrueHD",
        };
        f.pad(name)
    }
}

/// Geometry of one compressed frame, recomputed from header bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedFrame {
    pub codec: Codec,
    pub sample_rate: u32,
    pub frame_size_bytes: usize,
    /// Always 1 or 2, wider layouts are collapsed to stereo
    pub channel_count: u16,
    pub samples_per_frame: u32,
    /// Header arrived with 16-bit words byte-swapped
    pub is_big_endian_on_wire: bool,
}

/// Audio format information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub block_align: u16,
}

impl AudioFormat {
    /// 48 kHz stereo 16-bit, the render sink configuration
    pub fn render_default() -> Self {
        Self {
            sample_rate: TARGET_SAMPLE_RATE,
            channels: 2,
            bits_per_sample: 16,
            block_align: OUTPUT_FRAME_BYTES as u16,
        }
    }

    /// Calculate bytes per second
    pub fn bytes_per_second(&self) -> u32 {
        self.sample_rate * self.block_align as u32
    }

    /// Calculate buffer size in bytes for given milliseconds
    pub fn buffer_size_for_ms(&self, ms: u32) -> usize {
        ((self.bytes_per_second() as u64 * ms as u64) / 1000) as usize
    }

    /// Calculate number of frames for given bytes
    pub fn bytes_to_frames(&self, bytes: usize) -> u32 {
        (bytes / self.block_align as usize) as u32
    }

    /// Calculate bytes for given number of frames
    pub fn frames_to_bytes(&self, frames: u32) -> usize {
        frames as usize * self.block_align as usize
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}Hz {}ch {}bit",
            self.sample_rate, self.channels, self.bits_per_sample
        )
    }
}
