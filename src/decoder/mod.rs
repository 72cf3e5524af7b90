//! Decode engine capabilities and the adapter that drives them

mod adapter;
mod passthrough;

pub use adapter::{DecodeEngineAdapter, DecodeOutput, FrameSpan, MAX_FRAME_BYTES};
pub use passthrough::PassthroughDecoder;

use crate::audio::Codec;
use crate::error::{PatchError, Result};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Codec family an engine instance is opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineFamily {
    Dolby,
    Dts,
}

impl EngineFamily {
    pub fn for_codec(codec: Codec) -> Option<Self> {
        if codec.is_dolby() {
            Some(EngineFamily::Dolby)
        } else if codec.is_dts() {
            Some(EngineFamily::Dts)
        } else {
            None
        }
    }
}

impl fmt::Display for EngineFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineFamily::Dolby => f.write_str("dolby"),
            EngineFamily::Dts => f.write_str("dts"),
        }
    }
}

/// Format of the PCM an engine produced in one call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PcmInfo {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Byte counts reported by one `process` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessResult {
    /// Input bytes the engine consumed
    pub used: usize,
    /// Valid bytes written to the PCM buffer (16-bit LE interleaved)
    pub pcm_len: usize,
    /// Valid bytes written to the raw buffer
    pub raw_len: usize,
    pub pcm_info: PcmInfo,
}

/// Parameters an engine may optionally report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineParam {
    SampleRate,
    Channels,
    /// Frames decoded since init
    DecodedFrames,
}

/// An external decoding engine, resolved by name at configuration time
///
/// `process` receives exactly one compressed frame and writes decoded PCM
/// and a re-packaged bitstream copy into caller-owned buffers.
pub trait DecoderCapability: Send {
    fn name(&self) -> &str;

    fn init(&mut self, family: EngineFamily, raw_output: bool) -> Result<()>;

    fn process(
        &mut self,
        input: &[u8],
        pcm_out: &mut [u8],
        raw_out: &mut [u8],
    ) -> Result<ProcessResult>;

    fn cleanup(&mut self) -> Result<()>;

    fn query(&self, _param: EngineParam) -> Option<u32> {
        None
    }

    /// Engines that can pause themselves override this
    fn set_paused(&mut self, _paused: bool) {}
}

type Factory = Box<dyn Fn() -> Box<dyn DecoderCapability> + Send + Sync>;

/// Named decoder capabilities available to sessions
pub struct CapabilityRegistry {
    factories: HashMap<String, Factory>,
}

impl CapabilityRegistry {
    /// Empty registry, every lookup fails and sessions run in pass-through
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in pass-through engine
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(PassthroughDecoder::NAME, || {
            Box::new(PassthroughDecoder::new())
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn DecoderCapability> + Send + Sync + 'static,
    {
        debug!("Registered decoder capability: {}", name);
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Create a fresh engine instance for `name`
    pub fn resolve(&self, name: &str) -> Result<Box<dyn DecoderCapability>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| PatchError::CapabilityNotFound(name.to_string()))
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("names", &self.names())
            .finish()
    }
}
