//! Trivial engine that emits silence of the right length and copies the bitstream

use super::{DecoderCapability, EngineFamily, EngineParam, PcmInfo, ProcessResult};
use crate::audio::Codec;
use crate::error::{PatchError, Result};
use crate::parser::parse_frame;
use tracing::debug;

/// Deterministic stand-in for a proprietary engine
///
/// Each frame decodes to `samples_per_frame` frames of silence at the
/// frame's own sample rate and channel count.
#[derive(Debug, Default)]
pub struct PassthroughDecoder {
    family: Option<EngineFamily>,
    raw_output: bool,
    paused: bool,
    last_info: PcmInfo,
    frames: u32,
}

impl PassthroughDecoder {
    pub const NAME: &'static str = "passthrough";

    pub fn new() -> Self {
        Self::default()
    }
}

impl DecoderCapability for PassthroughDecoder {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn init(&mut self, family: EngineFamily, raw_output: bool) -> Result<()> {
        debug!("Passthrough engine init: family={} raw={}", family, raw_output);
        self.family = Some(family);
        self.raw_output = raw_output;
        self.frames = 0;
        Ok(())
    }

    fn process(
        &mut self,
        input: &[u8],
        pcm_out: &mut [u8],
        raw_out: &mut [u8],
    ) -> Result<ProcessResult> {
        let codec = match self.family {
            Some(EngineFamily::Dolby) => Codec::Ac3,
            Some(EngineFamily::Dts) => Codec::Dts,
            None => return Err(PatchError::engine_process(Self::NAME, "not initialized")),
        };
        let frame = parse_frame(codec, input)
            .map_err(|e| PatchError::engine_process(Self::NAME, e.to_string()))?;

        let used = frame.frame_size_bytes.min(input.len());
        let pcm_len = if self.paused {
            0
        } else {
            let decoded = frame.samples_per_frame as usize * frame.channel_count as usize * 2;
            decoded.min(pcm_out.len())
        };
        pcm_out[..pcm_len].fill(0);

        let raw_len = if self.raw_output {
            let n = used.min(raw_out.len());
            raw_out[..n].copy_from_slice(&input[..n]);
            n
        } else {
            0
        };

        self.last_info = PcmInfo {
            sample_rate: frame.sample_rate,
            channels: frame.channel_count,
        };
        self.frames += 1;

        Ok(ProcessResult {
            used,
            pcm_len,
            raw_len,
            pcm_info: self.last_info,
        })
    }

    fn cleanup(&mut self) -> Result<()> {
        debug!("Passthrough engine cleanup after {} frames", self.frames);
        self.family = None;
        Ok(())
    }

    fn query(&self, param: EngineParam) -> Option<u32> {
        match param {
            EngineParam::SampleRate => Some(self.last_info.sample_rate),
            EngineParam::Channels => Some(self.last_info.channels as u32),
            EngineParam::DecodedFrames => Some(self.frames),
        }
    }

    fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ac3::tests::ac3_header;

    #[test]
    fn test_process_one_frame() {
        let mut engine = PassthroughDecoder::new();
        engine.init(EngineFamily::Dolby, true).unwrap();

        let mut frame = ac3_header(0, 8, 2);
        frame.resize(256, 0x11);
        let mut pcm = vec![0xFFu8; 8192];
        let mut raw = vec![0u8; 8192];
        let result = engine.process(&frame, &mut pcm, &mut raw).unwrap();

        assert_eq!(result.used, 256);
        assert_eq!(result.pcm_len, 1536 * 2 * 2);
        assert_eq!(result.raw_len, 256);
        assert_eq!(&raw[..256], &frame[..]);
        assert!(pcm[..result.pcm_len].iter().all(|&b| b == 0));
        assert_eq!(result.pcm_info.sample_rate, 48_000);
        assert_eq!(engine.query(EngineParam::DecodedFrames), Some(1));
    }

    #[test]
    fn test_uninitialized_engine_fails() {
        let mut engine = PassthroughDecoder::new();
        let result = engine.process(&[0; 16], &mut [0; 16], &mut [0; 16]);
        assert!(matches!(result, Err(PatchError::EngineProcess { .. })));
    }
}
