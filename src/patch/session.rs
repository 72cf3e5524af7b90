//! Patch session: command-driven input and output threads around a ring buffer

use super::command::{Command, CommandQueue, CommandSender};
use crate::audio::{
    AudioFormat, Codec, RenderSink, RingBuffer, TunerSource, WriteStatus, OUTPUT_FRAME_BYTES,
    TARGET_SAMPLE_RATE,
};
use crate::classify::{
    pack_burst, BurstDeframer, BurstPayload, DetectedFormat, FormatTracker, StreamFormat,
    DEFAULT_HYSTERESIS_PERIODS, PCM_PERIOD_SIZE, TRUEHD_PERIOD_SIZE,
};
use crate::decoder::{CapabilityRegistry, DecodeEngineAdapter, DecodeOutput, EngineFamily};
use crate::error::{PatchError, Result};
use crate::sync::{ClockSource, PtsSynchronizer, SyncThresholds};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Sleep between polls when there is nothing to do
const IDLE_POLL: Duration = Duration::from_millis(5);

/// How long the output thread waits for data before zero-filling
const UNDERRUN_WAIT: Duration = Duration::from_millis(10);

/// Largest chunk the output thread drains at once
const MAX_OUTPUT_CHUNK: usize = TRUEHD_PERIOD_SIZE;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no stream running
    Init,
    Running,
    Paused,
    /// Released, terminal
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "INIT",
            SessionState::Running => "RUNNING",
            SessionState::Paused => "PAUSE",
            SessionState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Runtime configuration for one session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Ring buffer size in milliseconds of 48 kHz stereo output
    pub ring_buffer_ms: u32,
    /// Bytes requested from the tuner per read
    pub read_chunk_bytes: usize,
    /// Codec of a bare elementary stream, `None` to detect from bursts
    pub codec: Option<Codec>,
    pub dolby_decoder: String,
    pub dts_decoder: String,
    /// Render re-packaged bitstream instead of PCM
    pub raw_passthrough: bool,
    pub thresholds: SyncThresholds,
    pub hysteresis_periods: usize,
    /// Producer wait budget when the ring buffer is full
    pub write_timeout: Duration,
    /// Wait this long for video to start before starting audio
    pub av_start_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ring_buffer_ms: 500,
            read_chunk_bytes: PCM_PERIOD_SIZE,
            codec: None,
            dolby_decoder: "passthrough".to_string(),
            dts_decoder: "passthrough".to_string(),
            raw_passthrough: false,
            thresholds: SyncThresholds::default(),
            hysteresis_periods: DEFAULT_HYSTERESIS_PERIODS,
            write_timeout: Duration::from_secs(1),
            av_start_timeout: None,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ring_buffer_ms == 0 {
            return Err(PatchError::InvalidConfig("ring buffer size is zero".into()));
        }
        if self.read_chunk_bytes == 0 {
            return Err(PatchError::InvalidConfig("read chunk size is zero".into()));
        }
        if self.thresholds.soft > self.thresholds.discontinuity {
            return Err(PatchError::InvalidConfig(format!(
                "soft threshold {} above discontinuity threshold {}",
                self.thresholds.soft, self.thresholds.discontinuity
            )));
        }
        if let Some(codec) = self.codec {
            if codec != Codec::Pcm && EngineFamily::for_codec(codec).is_none() {
                return Err(PatchError::InvalidConfig(format!(
                    "{} elementary streams are not decodable",
                    codec
                )));
            }
        }
        Ok(())
    }

    fn decoder_for(&self, family: EngineFamily) -> &str {
        match family {
            EngineFamily::Dolby => &self.dolby_decoder,
            EngineFamily::Dts => &self.dts_decoder,
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub state: SessionState,
    pub format: StreamFormat,
    /// Codec of the last decoded frame
    pub codec: Option<Codec>,
    pub engine: Option<String>,
    pub passthrough: bool,
    pub decoder_offset: u64,
    pub bytes_read: u64,
    /// Bytes queued into the ring buffer
    pub bytes_queued: u64,
    /// Bytes handed to the render sink, silence excluded
    pub bytes_rendered: u64,
    pub silence_bytes: u64,
    pub bytes_dropped: u64,
    pub frames_decoded: u64,
    pub ring_queued: usize,
    pub last_pts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    decoder_offset: AtomicU64,
    bytes_read: AtomicU64,
    bytes_queued: AtomicU64,
    bytes_rendered: AtomicU64,
    silence_bytes: AtomicU64,
    bytes_dropped: AtomicU64,
    frames_decoded: AtomicU64,
    last_pts: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        for counter in [
            &self.decoder_offset,
            &self.bytes_read,
            &self.bytes_queued,
            &self.bytes_rendered,
            &self.silence_bytes,
            &self.bytes_dropped,
            &self.frames_decoded,
            &self.last_pts,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
    }

    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Default, Clone)]
struct StreamInfo {
    codec: Option<Codec>,
    engine: Option<String>,
    passthrough: bool,
}

/// Where a run of queued output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutputOrigin {
    /// Input offset the clock lookup is made with
    input_offset: u64,
    /// Rate the bytes are rendered at
    sample_rate: u32,
}

#[derive(Debug, Clone, Copy)]
struct OutputMark {
    /// Ring stream position of the run's first byte
    start: u64,
    origin: OutputOrigin,
}

/// Origins of the bytes in the ring, oldest first
///
/// Positions count every byte handed to the ring since the last reset,
/// evicted ones included.
#[derive(Debug, Default)]
struct OutputMarks {
    queued: u64,
    marks: VecDeque<OutputMark>,
}

impl OutputMarks {
    fn push(&mut self, len: usize, origin: OutputOrigin) {
        self.marks.push_back(OutputMark {
            start: self.queued,
            origin,
        });
        self.queued += len as u64;
    }

    /// Undo the last `push` after a failed write
    fn cancel_last(&mut self) {
        if let Some(mark) = self.marks.pop_back() {
            self.queued = mark.start;
        }
    }

    /// Origin of the byte at `position` and how far into its run it is
    fn locate(&mut self, position: u64) -> Option<(OutputOrigin, u64)> {
        while self.marks.get(1).is_some_and(|next| next.start <= position) {
            self.marks.pop_front();
        }
        let mark = self.marks.front()?;
        (mark.start <= position).then(|| (mark.origin, position - mark.start))
    }

    fn clear(&mut self) {
        self.queued = 0;
        self.marks.clear();
    }
}

/// Decoder state, locked across header parse, engine call and offset update
#[derive(Default)]
struct DecoderState {
    adapter: Option<DecodeEngineAdapter>,
    paused: bool,
}

struct Shared {
    config: SessionConfig,
    registry: CapabilityRegistry,
    clock: Arc<dyn ClockSource>,
    ring: RingBuffer,
    commands: CommandQueue,
    state: Mutex<SessionState>,
    decoder: Mutex<DecoderState>,
    stream: Mutex<StreamInfo>,
    sink: Mutex<Box<dyn RenderSink>>,
    marks: Mutex<OutputMarks>,
    detected: Arc<DetectedFormat>,
    /// Detection comes from an external monitor instead of the input thread
    monitored: bool,
    counters: Counters,
    exit: AtomicBool,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        if *current != state {
            info!("Session state {} -> {}", *current, state);
            *current = state;
        }
    }

    fn is_exiting(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }
}

/// Decrements the live thread count when its thread ends
struct ThreadGuard(Arc<AtomicUsize>);

impl ThreadGuard {
    fn enter(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count.clone())
    }
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One broadcast audio patch from tuner source to render sink
pub struct PatchSession {
    shared: Arc<Shared>,
    commands: CommandSender,
    live_threads: Arc<AtomicUsize>,
    input_handle: Option<JoinHandle<()>>,
}

impl PatchSession {
    /// Create the session and its input thread, in `Init` state
    pub fn create(
        config: SessionConfig,
        source: Box<dyn TunerSource>,
        sink: Box<dyn RenderSink>,
        clock: Arc<dyn ClockSource>,
        registry: CapabilityRegistry,
    ) -> Result<Self> {
        Self::spawn(config, source, sink, clock, registry, None)
    }

    /// Like `create`, taking stream format from a running `FormatMonitor`
    ///
    /// Burst streams are routed by what `detected` reports instead of by
    /// scanning the input. Elementary streams with a configured codec ignore it.
    pub fn create_monitored(
        config: SessionConfig,
        source: Box<dyn TunerSource>,
        sink: Box<dyn RenderSink>,
        clock: Arc<dyn ClockSource>,
        registry: CapabilityRegistry,
        detected: Arc<DetectedFormat>,
    ) -> Result<Self> {
        Self::spawn(config, source, sink, clock, registry, Some(detected))
    }

    fn spawn(
        config: SessionConfig,
        source: Box<dyn TunerSource>,
        sink: Box<dyn RenderSink>,
        clock: Arc<dyn ClockSource>,
        registry: CapabilityRegistry,
        monitor: Option<Arc<DetectedFormat>>,
    ) -> Result<Self> {
        config.validate()?;

        let ring_bytes = AudioFormat::render_default().buffer_size_for_ms(config.ring_buffer_ms);
        let commands = CommandQueue::default();
        let sender = commands.sender();
        debug!(
            "Creating patch session: ring={} bytes, codec={:?}, raw={}, monitored={}",
            ring_bytes,
            config.codec,
            config.raw_passthrough,
            monitor.is_some()
        );
        let monitored = monitor.is_some();

        let shared = Arc::new(Shared {
            config,
            registry,
            clock,
            ring: RingBuffer::with_overwrite(ring_bytes),
            commands,
            state: Mutex::new(SessionState::Init),
            decoder: Mutex::new(DecoderState::default()),
            stream: Mutex::new(StreamInfo::default()),
            sink: Mutex::new(sink),
            marks: Mutex::new(OutputMarks::default()),
            detected: monitor.unwrap_or_default(),
            monitored,
            counters: Counters::default(),
            exit: AtomicBool::new(false),
        });

        let live_threads = Arc::new(AtomicUsize::new(0));
        let guard = ThreadGuard::enter(&live_threads);
        let input_shared = shared.clone();
        let threads = live_threads.clone();
        let input_handle = thread::Builder::new()
            .name("patch-input".into())
            .spawn(move || {
                let _guard = guard;
                input_thread(input_shared, source, threads)
            })
            .map_err(|_| PatchError::ThreadSpawn("input"))?;

        Ok(Self {
            shared,
            commands: sender,
            live_threads,
            input_handle: Some(input_handle),
        })
    }

    /// Queue a lifecycle command, dropped when the queue is full
    pub fn submit_command(&self, command: Command) -> bool {
        self.commands.submit(command)
    }

    /// Submit handle usable from other threads
    pub fn commands(&self) -> CommandSender {
        self.commands.clone()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Number of session threads currently alive
    pub fn live_threads(&self) -> usize {
        self.live_threads.load(Ordering::SeqCst)
    }

    /// Shared live thread counter, still readable after release
    pub fn thread_counter(&self) -> Arc<AtomicUsize> {
        self.live_threads.clone()
    }

    pub fn stats(&self) -> SessionStats {
        let counters = &self.shared.counters;
        let stream = self.shared.stream.lock().clone();
        SessionStats {
            state: self.shared.state(),
            format: self.shared.detected.format(),
            codec: stream.codec,
            engine: stream.engine,
            passthrough: stream.passthrough,
            decoder_offset: counters.decoder_offset.load(Ordering::Relaxed),
            bytes_read: counters.bytes_read.load(Ordering::Relaxed),
            bytes_queued: counters.bytes_queued.load(Ordering::Relaxed),
            bytes_rendered: counters.bytes_rendered.load(Ordering::Relaxed),
            silence_bytes: counters.silence_bytes.load(Ordering::Relaxed),
            bytes_dropped: counters.bytes_dropped.load(Ordering::Relaxed)
                + self.shared.ring.evicted_bytes(),
            frames_decoded: counters.frames_decoded.load(Ordering::Relaxed),
            ring_queued: self.shared.ring.available(),
            last_pts: counters.last_pts.load(Ordering::Relaxed),
        }
    }

    /// Stop both threads and free the session
    ///
    /// Blocks until the threads have joined; must not be called from a
    /// session thread.
    pub fn release(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.input_handle.take() else {
            return;
        };
        info!("Releasing patch session");
        self.shared.commands.close();
        self.shared.exit.store(true, Ordering::Release);
        self.shared.ring.wake_all();
        if handle.join().is_err() {
            error!("Input thread panicked");
        }
    }
}

impl Drop for PatchSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct OutputThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Input side state that lives for the whole session
struct InputPipeline {
    tracker: FormatTracker,
    deframer: BurstDeframer,
}

impl InputPipeline {
    fn reset(&mut self) {
        self.tracker.reset();
        self.deframer.reset();
    }
}

fn input_thread(shared: Arc<Shared>, mut source: Box<dyn TunerSource>, threads: Arc<AtomicUsize>) {
    info!("Input thread started");

    let mut pipeline = InputPipeline {
        tracker: FormatTracker::new(shared.config.hysteresis_periods),
        deframer: BurstDeframer::new(),
    };
    let mut output: Option<OutputThread> = None;
    let mut chunk = vec![0u8; shared.config.read_chunk_bytes];

    while !shared.is_exiting() {
        while let Some(command) = shared.commands.try_pop() {
            handle_command(&shared, command, &mut pipeline, &mut output, &threads);
        }

        let state = shared.state();
        if !matches!(state, SessionState::Running | SessionState::Paused) {
            thread::sleep(IDLE_POLL);
            continue;
        }

        match source.read(&mut chunk) {
            Ok(0) => thread::sleep(IDLE_POLL),
            Ok(n) => {
                Counters::add(&shared.counters.bytes_read, n);
                process_chunk(
                    &shared,
                    &mut pipeline,
                    &chunk[..n],
                    state == SessionState::Paused,
                );
            }
            Err(e) => {
                warn!("Tuner read error: {}", e);
                thread::sleep(Duration::from_millis(10));
            }
        }
    }

    stop_output(&shared, &mut output);
    close_decoder(&shared, &mut shared.decoder.lock());
    if let Err(e) = shared.sink.lock().flush() {
        warn!("Render sink flush failed: {}", e);
    }
    shared.set_state(SessionState::Stopped);
    info!("Input thread stopped");
}

fn handle_command(
    shared: &Arc<Shared>,
    command: Command,
    pipeline: &mut InputPipeline,
    output: &mut Option<OutputThread>,
    threads: &Arc<AtomicUsize>,
) {
    let state = shared.state();
    debug!("Command {} in state {}", command, state);

    match (state, command) {
        (SessionState::Init, Command::Start) => start_stream(shared, pipeline, output, threads),
        (SessionState::Running, Command::Pause) => {
            let mut decoder = shared.decoder.lock();
            decoder.paused = true;
            if let Some(adapter) = decoder.adapter.as_mut() {
                adapter.set_paused(true);
            }
            shared.set_state(SessionState::Paused);
        }
        (SessionState::Paused, Command::Resume) => {
            let mut decoder = shared.decoder.lock();
            decoder.paused = false;
            if let Some(adapter) = decoder.adapter.as_mut() {
                adapter.set_paused(false);
            }
            shared.set_state(SessionState::Running);
        }
        (SessionState::Running | SessionState::Paused, Command::Stop) => {
            stop_output(shared, output);
            shared.ring.reset();
            shared.marks.lock().clear();
            close_decoder(shared, &mut shared.decoder.lock());
            pipeline.reset();
            shared.set_state(SessionState::Init);
        }
        (state, command) => debug!("Ignoring {} in state {}", command, state),
    }
}

fn start_stream(
    shared: &Arc<Shared>,
    pipeline: &mut InputPipeline,
    output: &mut Option<OutputThread>,
    threads: &Arc<AtomicUsize>,
) {
    shared.counters.reset();
    shared.ring.reset();
    shared.marks.lock().clear();
    pipeline.reset();
    if !shared.monitored {
        shared.detected.publish(StreamFormat::Pcm, PCM_PERIOD_SIZE);
    }

    {
        let mut decoder = shared.decoder.lock();
        close_decoder(shared, &mut decoder);
        decoder.paused = false;
        if let Some(family) = shared.config.codec.and_then(EngineFamily::for_codec) {
            open_decoder(shared, &mut decoder, family);
        }
    }

    if output.is_none() {
        match spawn_output(shared, threads) {
            Ok(thread) => *output = Some(thread),
            Err(e) => {
                error!("Cannot start stream: {}", e);
                close_decoder(shared, &mut shared.decoder.lock());
                return;
            }
        }
    }
    shared.set_state(SessionState::Running);
}

fn spawn_output(shared: &Arc<Shared>, threads: &Arc<AtomicUsize>) -> Result<OutputThread> {
    let stop = Arc::new(AtomicBool::new(false));
    let guard = ThreadGuard::enter(threads);
    let thread_shared = shared.clone();
    let thread_stop = stop.clone();
    let handle = thread::Builder::new()
        .name("patch-output".into())
        .spawn(move || {
            let _guard = guard;
            output_thread(thread_shared, thread_stop)
        })
        .map_err(|_| PatchError::ThreadSpawn("output"))?;
    Ok(OutputThread { stop, handle })
}

fn stop_output(shared: &Shared, output: &mut Option<OutputThread>) {
    if let Some(thread) = output.take() {
        thread.stop.store(true, Ordering::Release);
        shared.ring.wake_all();
        if thread.handle.join().is_err() {
            error!("Output thread panicked");
        }
    }
}

fn open_decoder(shared: &Shared, decoder: &mut DecoderState, family: EngineFamily) {
    let mut adapter = DecodeEngineAdapter::new(family);
    let name = shared.config.decoder_for(family);
    adapter.init(&shared.registry, name, shared.config.raw_passthrough);
    adapter.set_paused(decoder.paused);

    let mut stream = shared.stream.lock();
    stream.engine = adapter.engine_name().map(str::to_string);
    stream.passthrough = adapter.is_passthrough();
    decoder.adapter = Some(adapter);
}

fn close_decoder(shared: &Shared, decoder: &mut DecoderState) {
    if let Some(mut adapter) = decoder.adapter.take() {
        Counters::add(
            &shared.counters.bytes_dropped,
            adapter.skipped_bytes() as usize,
        );
        adapter.release();
    }
    *shared.stream.lock() = StreamInfo::default();
}

/// Input span of the chunk being processed
#[derive(Debug, Clone, Copy)]
struct ChunkPosition {
    start: u64,
    end: u64,
    paused: bool,
}

impl ChunkPosition {
    fn origin(&self) -> OutputOrigin {
        OutputOrigin {
            input_offset: self.start,
            sample_rate: TARGET_SAMPLE_RATE,
        }
    }
}

fn process_chunk(shared: &Shared, pipeline: &mut InputPipeline, data: &[u8], paused: bool) {
    let mut decoder = shared.decoder.lock();
    let start = shared.counters.decoder_offset.load(Ordering::Relaxed);
    let chunk = ChunkPosition {
        start,
        end: start + data.len() as u64,
        paused,
    };

    match shared.config.codec.and_then(EngineFamily::for_codec) {
        Some(family) => {
            let out = feed_decoder(shared, &mut decoder, family, data);
            emit_decoded(shared, &decoder, out, chunk);
        }
        None => {
            let (format, bare) = if shared.monitored {
                (shared.detected.format(), shared.detected.is_bare())
            } else {
                pipeline.tracker.observe(data);
                shared.detected.publish_from(&pipeline.tracker);
                (pipeline.tracker.format(), pipeline.tracker.is_bare())
            };

            if format == StreamFormat::Pcm {
                if pipeline.deframer.pending_bytes() > 0 {
                    pipeline.deframer.reset();
                }
                queue_output(shared, data, chunk.paused, chunk.origin());
            } else if bare {
                let out = feed_decoder(shared, &mut decoder, EngineFamily::Dts, data);
                emit_decoded(shared, &decoder, out, chunk);
            } else {
                for payload in pipeline.deframer.push(data) {
                    handle_payload(shared, &mut decoder, payload, chunk);
                }
            }
        }
    }

    Counters::add(&shared.counters.decoder_offset, data.len());
}

fn handle_payload(
    shared: &Shared,
    decoder: &mut DecoderState,
    payload: BurstPayload,
    chunk: ChunkPosition,
) {
    if let Some(family) = payload.format.codec().and_then(EngineFamily::for_codec) {
        let out = feed_decoder(shared, decoder, family, &payload.data);
        emit_decoded(shared, decoder, out, chunk);
        return;
    }

    match payload.format {
        StreamFormat::Mute | StreamFormat::Pause => {
            trace!("{} burst, zero-filling {} bytes", payload.format, payload.period_size);
            let silence = vec![0u8; payload.period_size];
            queue_output(shared, &silence, chunk.paused, chunk.origin());
        }
        format if shared.config.raw_passthrough => {
            match pack_burst(format, &payload.data, payload.period_size) {
                Some(burst) => queue_output(shared, &burst, chunk.paused, chunk.origin()),
                None => Counters::add(&shared.counters.bytes_dropped, payload.data.len()),
            }
        }
        format => {
            trace!("No decoder for {}, dropping {} bytes", format, payload.data.len());
            Counters::add(&shared.counters.bytes_dropped, payload.data.len());
        }
    }
}

fn feed_decoder(
    shared: &Shared,
    decoder: &mut DecoderState,
    family: EngineFamily,
    bytes: &[u8],
) -> DecodeOutput {
    if decoder.adapter.as_ref().map(|a| a.family()) != Some(family) {
        close_decoder(shared, decoder);
        open_decoder(shared, decoder, family);
    }
    match decoder.adapter.as_mut() {
        Some(adapter) => adapter.feed(bytes),
        None => DecodeOutput::default(),
    }
}

/// Queue decoded output one frame at a time, each tagged with its input offset
fn emit_decoded(shared: &Shared, decoder: &DecoderState, out: DecodeOutput, chunk: ChunkPosition) {
    if out.frames == 0 {
        return;
    }
    Counters::add(&shared.counters.frames_decoded, out.frames);
    if let Some(frame) = &out.last_frame {
        shared.stream.lock().codec = Some(frame.codec);
    }

    let passthrough = decoder
        .adapter
        .as_ref()
        .map_or(true, DecodeEngineAdapter::is_passthrough);
    let raw = shared.config.raw_passthrough || passthrough;
    let bytes = if raw { &out.raw } else { &out.pcm };

    // Bursts play at the coded rate, decoded PCM is always converted to 48 kHz
    let mut runs: Vec<(usize, OutputOrigin)> = Vec::with_capacity(out.spans.len());
    for span in &out.spans {
        let start = if raw { span.raw_start } else { span.pcm_start };
        if runs.last().is_some_and(|&(previous, _)| previous >= start) {
            continue;
        }
        let sample_rate = if raw {
            span.sample_rate
        } else {
            TARGET_SAMPLE_RATE
        };
        let origin = OutputOrigin {
            input_offset: chunk.end.saturating_sub(span.input_back as u64),
            sample_rate,
        };
        runs.push((start, origin));
    }

    let Some(&(first, _)) = runs.first() else {
        queue_output(shared, bytes, chunk.paused, chunk.origin());
        return;
    };
    if first > 0 {
        queue_output(shared, &bytes[..first.min(bytes.len())], chunk.paused, chunk.origin());
    }
    for (i, &(start, origin)) in runs.iter().enumerate() {
        let end = runs.get(i + 1).map_or(bytes.len(), |&(next, _)| next);
        if let Some(run) = bytes.get(start..end) {
            queue_output(shared, run, chunk.paused, origin);
        }
    }
}

fn queue_output(shared: &Shared, bytes: &[u8], paused: bool, origin: OutputOrigin) {
    if bytes.is_empty() {
        return;
    }
    if paused {
        Counters::add(&shared.counters.bytes_dropped, bytes.len());
        return;
    }

    // Marked before the write so the reader never sees bytes without an origin
    shared.marks.lock().push(bytes.len(), origin);
    match shared
        .ring
        .write_timeout(bytes, shared.config.write_timeout, &shared.exit)
    {
        WriteStatus::Written(n) => Counters::add(&shared.counters.bytes_queued, n),
        WriteStatus::NoSpace => {
            shared.marks.lock().cancel_last();
            debug!("Ring buffer full, dropping {} bytes", bytes.len());
            Counters::add(&shared.counters.bytes_dropped, bytes.len());
        }
        WriteStatus::Exiting => shared.marks.lock().cancel_last(),
    }
}

fn output_thread(shared: Arc<Shared>, stop: Arc<AtomicBool>) {
    info!("Output thread started");

    let format = AudioFormat::render_default();
    let silence_frames = format.bytes_to_frames(format.buffer_size_for_ms(10));
    let running = || !stop.load(Ordering::Acquire) && !shared.is_exiting();
    let mut sync = PtsSynchronizer::new(shared.config.thresholds);
    let mut chunk = vec![0u8; MAX_OUTPUT_CHUNK];
    // Ring stream bytes taken by this thread
    let mut drained: u64 = 0;

    if let Some(timeout) = shared.config.av_start_timeout {
        wait_for_video(&shared, &running, timeout, silence_frames);
    }

    while running() {
        let want = shared
            .detected
            .period_size()
            .clamp(OUTPUT_FRAME_BYTES, MAX_OUTPUT_CHUNK);
        let n = shared.ring.read_timeout(&mut chunk[..want], UNDERRUN_WAIT);

        if n == 0 {
            write_silence(&shared, silence_frames);
            continue;
        }
        drained += n as u64;

        match shared.sink.lock().write(&chunk[..n]) {
            Ok(written) => Counters::add(&shared.counters.bytes_rendered, written),
            Err(e) => {
                warn!("Render sink write failed: {}", e);
                thread::sleep(Duration::from_millis(10));
                continue;
            }
        }

        // Clock bookkeeping is frozen while paused
        if shared.state() == SessionState::Paused {
            continue;
        }
        // PTS of the chunk's first sample, from the input that produced it
        let position = (drained - n as u64) + shared.ring.evicted_bytes();
        let located = shared.marks.lock().locate(position);
        let pts = match located {
            Some((origin, played)) => {
                sync.set_sample_rate(origin.sample_rate);
                sync.compute_pts_after(shared.clock.as_ref(), origin.input_offset, played)
            }
            None => {
                let offset = shared.counters.decoder_offset.load(Ordering::Relaxed);
                sync.compute_pts(shared.clock.as_ref(), offset)
            }
        };
        sync.record_output(n);
        if pts == 0 {
            continue;
        }
        shared.counters.last_pts.store(pts, Ordering::Relaxed);
        sync.reconcile(shared.clock.as_ref(), pts);
    }

    if let Err(e) = shared.sink.lock().flush() {
        warn!("Render sink flush failed: {}", e);
    }
    info!("Output thread stopped");
}

fn write_silence(shared: &Shared, frames: u32) {
    match shared.sink.lock().write_silence(frames) {
        Ok(written) => Counters::add(&shared.counters.silence_bytes, written),
        Err(e) => trace!("Silence write failed: {}", e),
    }
}

/// Zero-fill until video has a timestamp or `timeout` passes
fn wait_for_video(
    shared: &Shared,
    running: &dyn Fn() -> bool,
    timeout: Duration,
    silence_frames: u32,
) {
    let deadline = Instant::now() + timeout;
    info!("Waiting up to {:?} for video to start", timeout);
    while running() {
        match shared.clock.video_pts() {
            Ok(pts) if pts > 0 => {
                info!("Video started at PTS {:#x}", pts);
                return;
            }
            Ok(_) => {}
            Err(e) => trace!("Video clock unavailable: {}", e),
        }
        if Instant::now() >= deadline {
            warn!("No video after {:?}, starting audio anyway", timeout);
            return;
        }
        write_silence(shared, silence_frames);
        thread::sleep(UNDERRUN_WAIT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{MemorySink, ReaderSource};
    use crate::classify::AC3_PERIOD_SIZE;
    use crate::parser::ac3::tests::ac3_header;
    use crate::sync::{ClockEvent, MemoryClock};
    use std::io::Cursor;

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn ac3_frame() -> Vec<u8> {
        // 48 kHz, frmsizecod 8 is 256 bytes
        let mut frame = ac3_header(0, 8, 2);
        frame.resize(256, 0x33);
        frame
    }

    fn session_with(
        config: SessionConfig,
        input: Vec<u8>,
    ) -> (PatchSession, MemorySink, MemoryClock) {
        let sink = MemorySink::new();
        let clock = MemoryClock::new();
        let session = PatchSession::create(
            config,
            Box::new(ReaderSource::new(Cursor::new(input))),
            Box::new(sink.clone()),
            Arc::new(clock.clone()),
            CapabilityRegistry::with_builtins(),
        )
        .unwrap();
        (session, sink, clock)
    }

    #[test]
    fn test_start_stop_cycles_reset_counters() {
        let pcm = vec![0x10u8; 4 * 4096];
        let (session, _sink, _clock) = session_with(SessionConfig::default(), pcm.clone());
        let threads = session.thread_counter();
        let baseline = session.live_threads();
        assert_eq!(baseline, 1);
        assert_eq!(session.state(), SessionState::Init);

        assert!(session.submit_command(Command::Start));
        assert!(wait_for(|| session.state() == SessionState::Running));
        assert_eq!(session.live_threads(), 2);
        assert!(wait_for(|| session.stats().bytes_rendered == pcm.len() as u64));
        assert_eq!(session.stats().bytes_read, pcm.len() as u64);

        assert!(session.submit_command(Command::Stop));
        assert!(wait_for(|| session.state() == SessionState::Init));
        assert!(wait_for(|| session.live_threads() == baseline));

        assert!(session.submit_command(Command::Start));
        assert!(wait_for(|| session.state() == SessionState::Running));
        let stats = session.stats();
        // Source is exhausted, so nothing new arrived after the reset
        assert_eq!(stats.bytes_read, 0);
        assert_eq!(stats.bytes_rendered, 0);
        assert_eq!(stats.decoder_offset, 0);

        assert!(session.submit_command(Command::Stop));
        assert!(wait_for(|| session.state() == SessionState::Init));
        assert!(wait_for(|| session.live_threads() == baseline));

        session.release();
        assert_eq!(threads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_burst_stream_decodes_to_pcm() {
        let frames = 6;
        let mut input = Vec::new();
        for _ in 0..frames {
            input.extend(pack_burst(StreamFormat::Ac3, &ac3_frame(), AC3_PERIOD_SIZE).unwrap());
        }
        let (session, sink, _clock) = session_with(SessionConfig::default(), input);

        session.submit_command(Command::Start);
        let expected = (frames * 1536 * OUTPUT_FRAME_BYTES) as u64;
        assert!(wait_for(|| session.stats().bytes_rendered == expected));

        let stats = session.stats();
        assert_eq!(stats.frames_decoded, frames as u64);
        assert_eq!(stats.format, StreamFormat::Ac3);
        assert_eq!(stats.codec, Some(Codec::Ac3));
        assert_eq!(stats.engine.as_deref(), Some("passthrough"));
        assert!(!stats.passthrough);
        assert!(sink.len() as u64 >= expected);
        session.release();
    }

    #[test]
    fn test_elementary_stream_with_clock() {
        let frames = 8;
        let mut input = Vec::new();
        for _ in 0..frames {
            input.extend_from_slice(&ac3_frame());
        }
        let config = SessionConfig {
            codec: Some(Codec::Ac3),
            ..SessionConfig::default()
        };
        let (session, _sink, clock) = session_with(config, input);
        clock.checkin(0, 90_000);

        session.submit_command(Command::Start);
        let expected = (frames * 1536 * OUTPUT_FRAME_BYTES) as u64;
        assert!(wait_for(|| session.stats().bytes_rendered == expected));
        assert!(wait_for(|| !clock.events().is_empty()));

        assert_eq!(clock.events()[0], ClockEvent::AudioStart(90_000));
        assert!(session.stats().last_pts >= 90_000);
        session.release();
    }

    /// Renders at eight times real time and runs the play clock from its own output
    struct PacedSink {
        clock: MemoryClock,
        start_pts: u64,
        rendered: u64,
    }

    impl RenderSink for PacedSink {
        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            let micros = buf.len() as u64 * 1_000_000 / (192_000 * 8);
            thread::sleep(Duration::from_micros(micros));
            // Play clock reads the PTS of the first sample being played
            let frames = self.rendered / OUTPUT_FRAME_BYTES as u64;
            self.clock
                .advance_play_clock(self.start_pts + frames * 90_000 / 48_000);
            self.rendered += buf.len() as u64;
            Ok(buf.len())
        }

        fn write_silence(&mut self, frames: u32) -> Result<usize> {
            Ok(frames as usize * OUTPUT_FRAME_BYTES)
        }
    }

    #[test]
    fn test_pts_follows_rendered_audio() {
        let frames = 200u64;
        let clock = MemoryClock::new();
        let mut input = Vec::new();
        for i in 0..frames {
            // 1536 samples at 48 kHz is 2880 ticks per frame
            clock.checkin(i * 256, 90_000 + i * 2880);
            input.extend_from_slice(&ac3_frame());
        }
        let config = SessionConfig {
            codec: Some(Codec::Ac3),
            ..SessionConfig::default()
        };
        let sink = PacedSink {
            clock: clock.clone(),
            start_pts: 90_000,
            rendered: 0,
        };
        let session = PatchSession::create(
            config,
            Box::new(ReaderSource::new(Cursor::new(input))),
            Box::new(sink),
            Arc::new(clock.clone()),
            CapabilityRegistry::with_builtins(),
        )
        .unwrap();

        session.submit_command(Command::Start);
        let expected = frames * 1536 * OUTPUT_FRAME_BYTES as u64;
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut max_queued = 0;
        while session.stats().bytes_rendered < expected && Instant::now() < deadline {
            max_queued = max_queued.max(session.stats().ring_queued);
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(session.stats().bytes_rendered, expected);
        // Input ran well ahead of the sink
        assert!(max_queued >= 48_000, "ring peaked at {} bytes", max_queued);

        // Last 4096 byte chunk starts 1920 ticks before the end of the stream
        let last_chunk_pts = 90_000 + frames * 2880 - 1920;
        assert!(wait_for(|| session.stats().last_pts.abs_diff(last_chunk_pts) < 900));

        // Every chunk stayed inside the soft threshold of the play clock
        assert_eq!(clock.events(), vec![ClockEvent::AudioStart(90_000)]);
        assert_eq!(clock.play_writes(), 0);
        session.release();
    }

    #[test]
    fn test_monitored_session_polls_external_format() {
        let mut bursts = Vec::new();
        for _ in 0..4 {
            bursts.extend(pack_burst(StreamFormat::Ac3, &ac3_frame(), AC3_PERIOD_SIZE).unwrap());
        }

        let open = |detected: Arc<DetectedFormat>| {
            let session = PatchSession::create_monitored(
                SessionConfig::default(),
                Box::new(ReaderSource::new(Cursor::new(bursts.clone()))),
                Box::new(MemorySink::new()),
                Arc::new(MemoryClock::new()),
                CapabilityRegistry::with_builtins(),
                detected,
            )
            .unwrap();
            session.submit_command(Command::Start);
            session
        };

        // The monitor says PCM, so bursts are rendered as they are
        let detected = Arc::new(DetectedFormat::new());
        let session = open(detected.clone());
        assert!(wait_for(|| session.stats().bytes_rendered == bursts.len() as u64));
        assert_eq!(session.stats().frames_decoded, 0);
        session.release();

        detected.publish(StreamFormat::Ac3, AC3_PERIOD_SIZE);
        let session = open(detected.clone());
        let decoded = (4 * 1536 * OUTPUT_FRAME_BYTES) as u64;
        assert!(wait_for(|| session.stats().bytes_rendered == decoded));
        let stats = session.stats();
        assert_eq!(stats.frames_decoded, 4);
        assert_eq!(stats.format, StreamFormat::Ac3);
        session.release();
        // Start does not overwrite what the monitor published
        assert_eq!(detected.format(), StreamFormat::Ac3);
    }

    #[test]
    fn test_output_marks_locate_runs() {
        let origin = |input_offset| OutputOrigin {
            input_offset,
            sample_rate: TARGET_SAMPLE_RATE,
        };
        let mut marks = OutputMarks::default();
        assert_eq!(marks.locate(10), None);

        marks.push(100, origin(0));
        marks.push(100, origin(256));
        marks.push(50, origin(512));
        marks.cancel_last();
        assert_eq!(marks.queued, 200);

        assert_eq!(marks.locate(0), Some((origin(0), 0)));
        assert_eq!(marks.locate(40), Some((origin(0), 40)));
        assert_eq!(marks.locate(100), Some((origin(256), 0)));
        assert_eq!(marks.locate(150), Some((origin(256), 50)));
        // Older runs are gone once passed
        assert_eq!(marks.marks.len(), 1);

        marks.clear();
        assert_eq!(marks.locate(150), None);
    }

    #[test]
    fn test_raw_passthrough_without_engine() {
        let config = SessionConfig {
            codec: Some(Codec::Ac3),
            dolby_decoder: "missing-engine".to_string(),
            ..SessionConfig::default()
        };
        let (session, _sink, _clock) = session_with(config, ac3_frame());

        session.submit_command(Command::Start);
        assert!(wait_for(|| session.stats().bytes_rendered == AC3_PERIOD_SIZE as u64));
        let stats = session.stats();
        assert!(stats.passthrough);
        assert_eq!(stats.engine, None);
        session.release();
    }

    #[test]
    fn test_pause_resume() {
        let (session, _sink, _clock) = session_with(SessionConfig::default(), Vec::new());
        session.submit_command(Command::Start);
        assert!(wait_for(|| session.state() == SessionState::Running));

        session.submit_command(Command::Pause);
        assert!(wait_for(|| session.state() == SessionState::Paused));
        // Output keeps running while paused
        assert_eq!(session.live_threads(), 2);

        session.submit_command(Command::Resume);
        assert!(wait_for(|| session.state() == SessionState::Running));

        // Resume outside pause is ignored
        session.submit_command(Command::Resume);
        session.submit_command(Command::Stop);
        assert!(wait_for(|| session.state() == SessionState::Init));
        session.release();
    }

    #[test]
    fn test_commands_dropped_after_release() {
        let (session, _sink, _clock) = session_with(SessionConfig::default(), Vec::new());
        let sender = session.commands();
        session.release();
        assert!(!sender.submit(Command::Start));
    }

    #[test]
    fn test_underrun_zero_fills() {
        let (session, sink, _clock) = session_with(SessionConfig::default(), Vec::new());
        session.submit_command(Command::Start);
        assert!(wait_for(|| session.stats().silence_bytes > 0));
        assert!(sink.contents().iter().all(|&b| b == 0));
        session.release();
    }

    #[test]
    fn test_av_gate_times_out() {
        let config = SessionConfig {
            av_start_timeout: Some(Duration::from_millis(30)),
            ..SessionConfig::default()
        };
        let pcm = vec![0x22u8; 8192];
        let (session, _sink, _clock) = session_with(config, pcm.clone());
        session.submit_command(Command::Start);
        assert!(wait_for(|| session.stats().bytes_rendered == pcm.len() as u64));
        session.release();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SessionConfig {
            read_chunk_bytes: 0,
            ..SessionConfig::default()
        };
        let result = PatchSession::create(
            config,
            Box::new(ReaderSource::new(Cursor::new(Vec::new()))),
            Box::new(MemorySink::new()),
            Arc::new(MemoryClock::new()),
            CapabilityRegistry::empty(),
        );
        assert!(matches!(result, Err(PatchError::InvalidConfig(_))));

        let config = SessionConfig {
            codec: Some(Codec::TrueHd),
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
