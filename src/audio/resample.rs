//! Streaming sample rate conversion for decoded PCM using rubato

use crate::error::{PatchError, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoResampler};
use tracing::debug;

/// Input frames handed to rubato per process call
pub const RESAMPLER_CHUNK_FRAMES: usize = 1024;

/// Converts interleaved 16-bit LE PCM from one rate to another
///
/// Input is collected into planar chunks of a fixed size; frames that don't
/// fill a whole chunk wait for the next call.
pub struct Resampler {
    input_rate: u32,
    output_rate: u32,
    channels: usize,
    inner: FastFixedIn<f32>,
    pending: Vec<Vec<f32>>,
}

impl Resampler {
    pub fn new(input_rate: u32, output_rate: u32, channels: u16) -> Result<Self> {
        let channels = channels.max(1) as usize;
        debug!(
            "Creating resampler {}Hz -> {}Hz ({}ch)",
            input_rate, output_rate, channels
        );
        let inner = FastFixedIn::<f32>::new(
            output_rate as f64 / input_rate as f64,
            1.0,
            PolynomialDegree::Septic,
            RESAMPLER_CHUNK_FRAMES,
            channels,
        )
        .map_err(|e| PatchError::Resample(format!("failed to create resampler: {}", e)))?;

        Ok(Self {
            input_rate,
            output_rate,
            channels,
            inner,
            pending: vec![Vec::with_capacity(RESAMPLER_CHUNK_FRAMES); channels],
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Input frames waiting for a full chunk
    pub fn buffered_frames(&self) -> usize {
        self.pending[0].len()
    }

    /// Convert `input` and append the result to `output`
    pub fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        let frame_bytes = self.channels * 2;
        for frame in input.chunks_exact(frame_bytes) {
            for (ch, sample) in frame.chunks_exact(2).enumerate() {
                let value = i16::from_le_bytes([sample[0], sample[1]]);
                self.pending[ch].push(value as f32 / 32768.0);
            }
        }

        while self.pending[0].len() >= self.inner.input_frames_next() {
            let needed = self.inner.input_frames_next();
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|channel| channel.drain(..needed).collect())
                .collect();
            let planar = self
                .inner
                .process(&chunk, None)
                .map_err(|e| PatchError::Resample(e.to_string()))?;
            interleave_into(&planar, output);
        }
        Ok(())
    }

    /// Forget buffered input and filter state, used when the stream restarts
    pub fn reset(&mut self) {
        self.inner.reset();
        for channel in &mut self.pending {
            channel.clear();
        }
    }
}

/// Append planar f32 channels to `output` as interleaved 16-bit LE samples
fn interleave_into(planar: &[Vec<f32>], output: &mut Vec<u8>) {
    let frames = planar.first().map_or(0, |c| c.len());
    output.reserve(frames * planar.len() * 2);
    for i in 0..frames {
        for channel in planar {
            let value = (channel[i] * 32768.0).round().clamp(-32768.0, 32767.0) as i16;
            output.extend_from_slice(&value.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(frames: usize, value: i16) -> Vec<u8> {
        let mut v = Vec::new();
        for _ in 0..frames {
            v.extend_from_slice(&value.to_le_bytes());
            v.extend_from_slice(&value.to_le_bytes());
        }
        v
    }

    #[test]
    fn test_upsample_ratio() {
        let mut resampler = Resampler::new(32_000, 48_000, 2).unwrap();
        let mut out = Vec::new();
        for _ in 0..12 {
            resampler.process(&pcm(256, 1000), &mut out).unwrap();
        }
        // 3072 input frames is three whole chunks, about 4608 frames at 48k
        assert_eq!(resampler.buffered_frames(), 0);
        let frames = out.len() / 4;
        assert!((4590..=4620).contains(&frames), "got {} frames", frames);

        // Past the filter's start-up the level is preserved
        let tail: Vec<i16> = out[out.len() / 2..]
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert!(tail.iter().all(|&s| (s - 1000).abs() <= 2));
    }

    #[test]
    fn test_partial_chunk_waits() {
        let mut resampler = Resampler::new(44_100, 48_000, 2).unwrap();
        let mut out = Vec::new();
        resampler.process(&pcm(100, 0), &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(resampler.buffered_frames(), 100);

        resampler.reset();
        assert_eq!(resampler.buffered_frames(), 0);
    }

    #[test]
    fn test_interleave_into() {
        let planar = vec![vec![0.5, -1.0], vec![0.0, 1.0]];
        let mut out = Vec::new();
        interleave_into(&planar, &mut out);
        let samples: Vec<i16> = out
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![16384, 0, -32768, 32767]);
    }
}
