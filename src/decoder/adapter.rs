//! Frame-aligned driver around one decoder capability

use super::{CapabilityRegistry, DecoderCapability, EngineFamily, EngineParam, PcmInfo};
use crate::audio::{Codec, CompressedFrame, Resampler, TARGET_SAMPLE_RATE};
use crate::classify::{pack_burst, StreamFormat, DTSHD_PERIOD_SIZE, EAC3_PERIOD_SIZE};
use crate::error::PatchError;
use crate::parser::{ac3, dts, parse_frame, swap_pairs, AC3_HEADER_BYTES, DTS_HEADER_BYTES};
use tracing::{debug, info, trace, warn};

/// Largest compressed frame the adapter accepts
pub const MAX_FRAME_BYTES: usize = 32_768;

/// Raw scratch holds a couple of worst-case frames
const RAW_SCRATCH_BYTES: usize = 2 * MAX_FRAME_BYTES;

/// PCM scratch holds one 6144-sample frame of 8ch 16-bit audio with headroom
const PCM_SCRATCH_BYTES: usize = 4 * MAX_FRAME_BYTES;

/// Samples per E-AC-3 burst period
const EAC3_BURST_SAMPLES: u32 = 6144;

/// Where one decoded frame's output begins within a `DecodeOutput`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpan {
    /// Input bytes from the frame's first byte to the end of everything fed
    pub input_back: usize,
    pub pcm_start: usize,
    pub raw_start: usize,
    /// Coded rate of the frame
    pub sample_rate: u32,
}

/// Everything produced by one `feed` call
#[derive(Debug, Default, Clone)]
pub struct DecodeOutput {
    /// 48 kHz stereo 16-bit LE PCM
    pub pcm: Vec<u8>,
    /// Re-packaged bitstream bursts
    pub raw: Vec<u8>,
    pub frames: usize,
    /// Bytes of whole frames consumed, excluding skipped garbage
    pub consumed: usize,
    /// One entry per decoded frame, in stream order
    pub spans: Vec<FrameSpan>,
    pub last_frame: Option<CompressedFrame>,
}

/// Drives an engine one frame at a time and owns its scratch buffers
///
/// Without an engine the adapter runs in pass-through mode and only
/// forwards re-packaged frames.
pub struct DecodeEngineAdapter {
    family: EngineFamily,
    engine: Option<Box<dyn DecoderCapability>>,
    raw_output: bool,
    pending: Vec<u8>,
    pcm_scratch: Vec<u8>,
    raw_scratch: Vec<u8>,
    eac3_group: Vec<u8>,
    eac3_group_samples: u32,
    resampler: Option<Resampler>,
    total_consumed: u64,
    total_frames: u64,
    skipped: u64,
    engine_errors: u64,
}

impl DecodeEngineAdapter {
    /// Create an adapter with no engine attached
    pub fn new(family: EngineFamily) -> Self {
        Self {
            family,
            engine: None,
            raw_output: false,
            pending: Vec::new(),
            pcm_scratch: Vec::new(),
            raw_scratch: Vec::new(),
            eac3_group: Vec::new(),
            eac3_group_samples: 0,
            resampler: None,
            total_consumed: 0,
            total_frames: 0,
            skipped: 0,
            engine_errors: 0,
        }
    }

    /// Resolve and initialize the named engine
    ///
    /// Returns false when the engine is unavailable; the adapter then stays
    /// in pass-through mode.
    pub fn init(&mut self, registry: &CapabilityRegistry, name: &str, raw_output: bool) -> bool {
        self.release();
        self.raw_output = raw_output;

        let resolved = registry.resolve(name).and_then(|mut engine| {
            engine.init(self.family, raw_output)?;
            Ok(engine)
        });

        match resolved {
            Ok(engine) => {
                self.pcm_scratch = vec![0u8; PCM_SCRATCH_BYTES];
                self.raw_scratch = vec![0u8; RAW_SCRATCH_BYTES];
                info!(
                    "Decoder '{}' opened for {} (raw output: {})",
                    engine.name(),
                    self.family,
                    raw_output
                );
                self.engine = Some(engine);
                true
            }
            Err(e) => {
                warn!(
                    "Decoder '{}' unavailable for {}: {}, using pass-through",
                    name, self.family, e
                );
                false
            }
        }
    }

    pub fn family(&self) -> EngineFamily {
        self.family
    }

    pub fn is_passthrough(&self) -> bool {
        self.engine.is_none()
    }

    pub fn engine_name(&self) -> Option<&str> {
        self.engine.as_ref().map(|e| e.name())
    }

    /// Bytes of whole frames consumed since init
    pub fn total_consumed(&self) -> u64 {
        self.total_consumed
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Bytes discarded while resynchronizing
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }

    pub fn engine_errors(&self) -> u64 {
        self.engine_errors
    }

    /// Bytes cached waiting for the rest of a frame
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    pub fn set_paused(&mut self, paused: bool) {
        if let Some(engine) = self.engine.as_mut() {
            engine.set_paused(paused);
        }
    }

    /// Append compressed bytes and decode every whole frame now available
    pub fn feed(&mut self, bytes: &[u8]) -> DecodeOutput {
        let mut out = DecodeOutput::default();
        self.pending.extend_from_slice(bytes);

        let (codec, header_bytes) = match self.family {
            EngineFamily::Dolby => (Codec::Ac3, AC3_HEADER_BYTES),
            EngineFamily::Dts => (Codec::Dts, DTS_HEADER_BYTES),
        };

        loop {
            let sync = match self.family {
                EngineFamily::Dolby => ac3::find_sync(&self.pending).map(|(o, _)| o),
                EngineFamily::Dts => dts::find_sync(&self.pending).map(|(o, _)| o),
            };
            let Some(offset) = sync else {
                let keep = self.pending.len().min(header_bytes - 1);
                self.skip(self.pending.len() - keep);
                break;
            };
            self.skip(offset);

            let frame = match parse_frame(codec, &self.pending) {
                Ok(frame) => frame,
                Err(PatchError::NeedMoreData { .. }) => break,
                Err(e) => {
                    trace!("Resync after header error: {}", e);
                    self.skip(1);
                    continue;
                }
            };

            let size = frame.frame_size_bytes;
            if size == 0 || size > MAX_FRAME_BYTES {
                debug!("Rejecting frame size {}", size);
                self.skip(1);
                continue;
            }
            if self.pending.len() < size {
                break;
            }

            out.spans.push(FrameSpan {
                input_back: self.pending.len(),
                pcm_start: out.pcm.len(),
                raw_start: out.raw.len(),
                sample_rate: frame.sample_rate,
            });
            let mut frame_bytes: Vec<u8> = self.pending.drain(..size).collect();
            if !frame.is_big_endian_on_wire {
                swap_pairs(&mut frame_bytes);
            }
            self.decode_frame(&frame, &frame_bytes, &mut out);

            out.frames += 1;
            out.consumed += size;
            out.last_frame = Some(frame);
            self.total_frames += 1;
            self.total_consumed += size as u64;
        }

        out
    }

    fn decode_frame(&mut self, frame: &CompressedFrame, bytes: &[u8], out: &mut DecodeOutput) {
        let Some(engine) = self.engine.as_mut() else {
            self.push_raw(frame, bytes, out);
            return;
        };

        let result = engine.process(bytes, &mut self.pcm_scratch, &mut self.raw_scratch);
        match result {
            Ok(result) => {
                if result.used != bytes.len() {
                    trace!(
                        "Engine used {} of {} frame bytes",
                        result.used,
                        bytes.len()
                    );
                }
                if self.raw_output && result.raw_len > 0 {
                    let raw = self.raw_scratch[..result.raw_len].to_vec();
                    self.push_raw(frame, &raw, out);
                }
                if result.pcm_len > 0 {
                    let pcm = self.pcm_scratch[..result.pcm_len].to_vec();
                    let info = self.reported_info(result.pcm_info);
                    self.push_pcm(&pcm, info, out);
                }
            }
            Err(e) => {
                self.engine_errors += 1;
                warn!("Engine failed on {} byte frame: {}", bytes.len(), e);
            }
        }
    }

    /// Fill fields a `process` call left at 0 from the engine's own report
    fn reported_info(&self, mut info: PcmInfo) -> PcmInfo {
        let Some(engine) = self.engine.as_ref() else {
            return info;
        };
        if info.sample_rate == 0 {
            info.sample_rate = engine.query(EngineParam::SampleRate).unwrap_or(0);
        }
        if info.channels == 0 {
            let channels = engine.query(EngineParam::Channels).unwrap_or(0);
            info.channels = u16::try_from(channels).unwrap_or(0);
        }
        info
    }

    fn push_pcm(&mut self, pcm: &[u8], info: PcmInfo, out: &mut DecodeOutput) {
        let stereo = to_stereo(pcm, info.channels);
        let rate = if info.sample_rate == 0 {
            TARGET_SAMPLE_RATE
        } else {
            info.sample_rate
        };

        if rate == TARGET_SAMPLE_RATE {
            if self.resampler.take().is_some() {
                debug!("Decoder output back at {}Hz, dropping resampler", rate);
            }
            out.pcm.extend_from_slice(&stereo);
            return;
        }

        if self.resampler.as_ref().map(|r| r.input_rate()) != Some(rate) {
            match Resampler::new(rate, TARGET_SAMPLE_RATE, 2) {
                Ok(resampler) => self.resampler = Some(resampler),
                Err(e) => {
                    warn!("Dropping {}Hz PCM: {}", rate, e);
                    self.resampler = None;
                    return;
                }
            }
        }
        if let Some(resampler) = self.resampler.as_mut() {
            if let Err(e) = resampler.process(&stereo, &mut out.pcm) {
                warn!("{}", e);
                resampler.reset();
            }
        }
    }

    fn push_raw(&mut self, frame: &CompressedFrame, bytes: &[u8], out: &mut DecodeOutput) {
        let (format, period) = match frame.codec {
            Codec::Ac3 => (StreamFormat::Ac3, frame.samples_per_frame as usize * 4),
            Codec::Eac3 => {
                self.eac3_group.extend_from_slice(bytes);
                self.eac3_group_samples += frame.samples_per_frame;
                if self.eac3_group_samples < EAC3_BURST_SAMPLES {
                    return;
                }
                let group = std::mem::take(&mut self.eac3_group);
                self.eac3_group_samples = 0;
                append_burst(StreamFormat::Eac3, &group, EAC3_PERIOD_SIZE, out);
                return;
            }
            Codec::Dts => (StreamFormat::Dts, frame.samples_per_frame as usize * 4),
            Codec::DtsHd => (StreamFormat::DtsHd, DTSHD_PERIOD_SIZE),
            Codec::Pcm | Codec::TrueHd => {
                out.raw.extend_from_slice(bytes);
                return;
            }
        };
        append_burst(format, bytes, period, out);
    }

    /// Drop cached partial data, used on stream restart
    pub fn flush(&mut self) {
        self.pending.clear();
        self.eac3_group.clear();
        self.eac3_group_samples = 0;
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }

    /// Clean up the engine and return to pass-through
    pub fn release(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            if let Err(e) = engine.cleanup() {
                warn!("Decoder '{}' cleanup failed: {}", engine.name(), e);
            }
            debug!(
                "Decoder '{}' released after {} frames",
                engine.name(),
                self.total_frames
            );
        }
        self.flush();
        self.resampler = None;
        self.pcm_scratch = Vec::new();
        self.raw_scratch = Vec::new();
        self.total_consumed = 0;
        self.total_frames = 0;
        self.skipped = 0;
        self.engine_errors = 0;
    }

    fn skip(&mut self, count: usize) {
        if count > 0 {
            self.pending.drain(..count);
            self.skipped += count as u64;
        }
    }
}

impl Drop for DecodeEngineAdapter {
    fn drop(&mut self) {
        self.release();
    }
}

fn append_burst(format: StreamFormat, payload: &[u8], period: usize, out: &mut DecodeOutput) {
    match pack_burst(format, payload, period) {
        Some(burst) => out.raw.extend_from_slice(&burst),
        None => out.raw.extend_from_slice(payload),
    }
}

/// Collapse any channel layout to interleaved stereo
fn to_stereo(pcm: &[u8], channels: u16) -> Vec<u8> {
    match channels {
        0 | 2 => pcm.to_vec(),
        1 => {
            let mut out = Vec::with_capacity(pcm.len() * 2);
            for s in pcm.chunks_exact(2) {
                out.extend_from_slice(s);
                out.extend_from_slice(s);
            }
            out
        }
        n => {
            let frame = n as usize * 2;
            let mut out = Vec::with_capacity(pcm.len() / frame * 4);
            for f in pcm.chunks_exact(frame) {
                out.extend_from_slice(&f[..4]);
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify, AC3_PERIOD_SIZE};
    use crate::decoder::ProcessResult;
    use crate::error::Result;
    use crate::parser::ac3::tests::{ac3_header, eac3_header};
    use crate::parser::dts::tests::dts_core_header;

    fn ac3_frame(fscod: u8, frmsizecod: u8) -> Vec<u8> {
        let mut frame = ac3_header(fscod, frmsizecod, 2);
        let size = parse_frame(Codec::Ac3, &frame).unwrap().frame_size_bytes;
        frame.resize(size, 0x5A);
        frame
    }

    fn passthrough_adapter(family: EngineFamily, raw: bool) -> DecodeEngineAdapter {
        let mut adapter = DecodeEngineAdapter::new(family);
        assert!(adapter.init(&CapabilityRegistry::with_builtins(), "passthrough", raw));
        adapter
    }

    #[test]
    fn test_whole_frames_consumed_exactly() {
        let mut adapter = passthrough_adapter(EngineFamily::Dolby, false);
        let frame = ac3_frame(0, 12);
        let mut stream = Vec::new();
        for _ in 0..5 {
            stream.extend_from_slice(&frame);
        }

        let out = adapter.feed(&stream);
        assert_eq!(out.frames, 5);
        assert_eq!(out.consumed, 5 * frame.len());
        assert_eq!(adapter.pending_bytes(), 0);
        assert_eq!(out.pcm.len(), 5 * 1536 * 4);
        assert!(out.raw.is_empty());
    }

    #[test]
    fn test_split_feeds_do_not_leak_bytes() {
        let mut adapter = passthrough_adapter(EngineFamily::Dolby, false);
        let frame = ac3_frame(0, 20);
        let mut stream = Vec::new();
        for _ in 0..4 {
            stream.extend_from_slice(&frame);
        }

        let mut frames = 0;
        let mut consumed = 0;
        for chunk in stream.chunks(333) {
            let out = adapter.feed(chunk);
            frames += out.frames;
            consumed += out.consumed;
        }
        assert_eq!(frames, 4);
        assert_eq!(consumed, stream.len());
        assert_eq!(adapter.skipped_bytes(), 0);
    }

    #[test]
    fn test_garbage_is_skipped_not_consumed() {
        let mut adapter = passthrough_adapter(EngineFamily::Dolby, false);
        let frame = ac3_frame(0, 8);
        let mut stream = vec![0x42; 10];
        stream.extend_from_slice(&frame);

        let out = adapter.feed(&stream);
        assert_eq!(out.frames, 1);
        assert_eq!(out.consumed, frame.len());
        assert_eq!(adapter.skipped_bytes(), 10);
    }

    #[test]
    fn test_byte_swapped_frames_decode() {
        let mut adapter = passthrough_adapter(EngineFamily::Dolby, false);
        let mut frame = ac3_frame(0, 8);
        swap_pairs(&mut frame);
        let out = adapter.feed(&frame);
        assert_eq!(out.frames, 1);
        assert!(!out.last_frame.unwrap().is_big_endian_on_wire);
    }

    #[test]
    fn test_resamples_non_48k_output() {
        let mut adapter = passthrough_adapter(EngineFamily::Dolby, false);
        let frame = ac3_frame(2, 8);
        let mut pcm_frames = 0;
        for _ in 0..10 {
            pcm_frames += adapter.feed(&frame).pcm.len() / 4;
        }
        // 10 * 1536 samples at 32 kHz is 15 resampler chunks, about 23040 at 48 kHz
        assert!((22990..=23060).contains(&pcm_frames), "got {}", pcm_frames);
    }

    #[test]
    fn test_raw_output_is_burst_packed() {
        let mut adapter = passthrough_adapter(EngineFamily::Dolby, true);
        let out = adapter.feed(&ac3_frame(0, 8));
        assert_eq!(out.raw.len(), AC3_PERIOD_SIZE);
        assert_eq!(classify(&out.raw), (StreamFormat::Ac3, AC3_PERIOD_SIZE));
    }

    #[test]
    fn test_eac3_bursts_group_frames() {
        let mut adapter = passthrough_adapter(EngineFamily::Dolby, true);
        // numblkscod 3 gives 1536 samples, four frames fill one burst
        let mut frame = eac3_header(0, 255, 0, 2);
        frame.resize(512, 0);
        let mut raw = 0;
        for i in 0..4 {
            let out = adapter.feed(&frame);
            raw += out.raw.len();
            if i < 3 {
                assert!(out.raw.is_empty());
            }
        }
        assert_eq!(raw, EAC3_PERIOD_SIZE);
    }

    #[test]
    fn test_missing_engine_falls_back_to_passthrough() {
        let mut adapter = DecodeEngineAdapter::new(EngineFamily::Dolby);
        assert!(!adapter.init(&CapabilityRegistry::empty(), "dolby-ms12", false));
        assert!(adapter.is_passthrough());

        let out = adapter.feed(&ac3_frame(0, 8));
        assert_eq!(out.frames, 1);
        assert!(out.pcm.is_empty());
        assert_eq!(out.raw.len(), AC3_PERIOD_SIZE);
    }

    #[test]
    fn test_dts_frames() {
        let mut adapter = passthrough_adapter(EngineFamily::Dts, false);
        let mut frame = dts_core_header(1023, 15);
        frame.resize(1024, 0);
        let mut stream = frame.clone();
        stream.extend_from_slice(&frame);

        let out = adapter.feed(&stream);
        assert_eq!(out.frames, 2);
        assert_eq!(out.consumed, 2048);
        assert_eq!(out.pcm.len(), 2 * 512 * 4);
    }

    struct FailingEngine;

    impl DecoderCapability for FailingEngine {
        fn name(&self) -> &str {
            "failing"
        }
        fn init(&mut self, _family: EngineFamily, _raw: bool) -> Result<()> {
            Ok(())
        }
        fn process(&mut self, _: &[u8], _: &mut [u8], _: &mut [u8]) -> Result<ProcessResult> {
            Err(PatchError::engine_process("failing", "corrupt"))
        }
        fn cleanup(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_engine_errors_still_advance() {
        let mut registry = CapabilityRegistry::empty();
        registry.register("failing", || Box::new(FailingEngine));
        let mut adapter = DecodeEngineAdapter::new(EngineFamily::Dolby);
        assert!(adapter.init(&registry, "failing", false));

        let frame = ac3_frame(0, 8);
        let out = adapter.feed(&frame);
        assert_eq!(out.frames, 1);
        assert_eq!(out.consumed, frame.len());
        assert!(out.pcm.is_empty());
        assert_eq!(adapter.engine_errors(), 1);
    }

    /// Writes 1536 frames of 32 kHz stereo without filling in `pcm_info`
    struct QuietEngine;

    impl DecoderCapability for QuietEngine {
        fn name(&self) -> &str {
            "quiet"
        }
        fn init(&mut self, _family: EngineFamily, _raw: bool) -> Result<()> {
            Ok(())
        }
        fn process(&mut self, input: &[u8], pcm: &mut [u8], _: &mut [u8]) -> Result<ProcessResult> {
            let pcm_len = 1536 * 4;
            pcm[..pcm_len].fill(0);
            Ok(ProcessResult {
                used: input.len(),
                pcm_len,
                raw_len: 0,
                pcm_info: PcmInfo::default(),
            })
        }
        fn cleanup(&mut self) -> Result<()> {
            Ok(())
        }
        fn query(&self, param: EngineParam) -> Option<u32> {
            match param {
                EngineParam::SampleRate => Some(32_000),
                EngineParam::Channels => Some(2),
                EngineParam::DecodedFrames => None,
            }
        }
    }

    #[test]
    fn test_queried_rate_drives_resampling() {
        let mut registry = CapabilityRegistry::empty();
        registry.register("quiet", || Box::new(QuietEngine));
        let mut adapter = DecodeEngineAdapter::new(EngineFamily::Dolby);
        assert!(adapter.init(&registry, "quiet", false));

        let frame = ac3_frame(0, 8);
        let mut pcm_frames = 0;
        for _ in 0..10 {
            pcm_frames += adapter.feed(&frame).pcm.len() / 4;
        }
        // Left at 0 by process, the queried 32 kHz is converted up
        assert!((22990..=23060).contains(&pcm_frames), "got {}", pcm_frames);
    }

    #[test]
    fn test_spans_locate_each_frame() {
        let mut adapter = passthrough_adapter(EngineFamily::Dolby, false);
        let frame = ac3_frame(0, 8);
        let mut stream = vec![0x42; 6];
        for _ in 0..3 {
            stream.extend_from_slice(&frame);
        }
        stream.extend_from_slice(&frame[..100]);

        let out = adapter.feed(&stream);
        assert_eq!(out.spans.len(), 3);
        let backs: Vec<usize> = out.spans.iter().map(|s| s.input_back).collect();
        assert_eq!(backs, vec![3 * 256 + 100, 2 * 256 + 100, 256 + 100]);
        let starts: Vec<usize> = out.spans.iter().map(|s| s.pcm_start).collect();
        assert_eq!(starts, vec![0, 1536 * 4, 2 * 1536 * 4]);
        assert!(out.spans.iter().all(|s| s.sample_rate == 48_000));
    }

    #[test]
    fn test_to_stereo_layouts() {
        assert_eq!(to_stereo(&[1, 0, 2, 0], 1), vec![1, 0, 1, 0, 2, 0, 2, 0]);
        let six: Vec<u8> = (0..12).collect();
        assert_eq!(to_stereo(&six, 6), vec![0, 1, 2, 3]);
    }
}
