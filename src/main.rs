//! tunerpath - Broadcast tuner audio path CLI

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tunerpath::audio::{Codec, NullSink, ReaderSource, RenderSink, TunerSource, WriterSink};
use tunerpath::classify::{BurstDeframer, FormatMonitor, FormatTracker, CAPTURE_WINDOW_BYTES};
use tunerpath::config::args::{Args, Command};
use tunerpath::config::{parse_codec, PipelineConfig};
use tunerpath::decoder::CapabilityRegistry;
use tunerpath::parser::{self, ac3, dts};
use tunerpath::patch::{Command as SessionCommand, PatchSession, SessionStats};
use tunerpath::sync::{ClockSource, MemoryClock, RegisterClock};

/// Polls with no new input and an empty ring before a file run is finished
const IDLE_POLLS: u32 = 5;

fn main() -> Result<()> {
    let args = Args::parse();

    match &args.command {
        Command::Run {
            input,
            output,
            codec,
            config,
            registers,
            raw,
            monitor,
        } => {
            let mut pipeline = match config {
                Some(path) => PipelineConfig::load(path)?,
                None => PipelineConfig::load_default()?,
            };
            if let Some(codec) = codec {
                pipeline.codec = codec.clone();
            }
            if let Some(dir) = registers {
                pipeline.clock.register_dir = dir.to_string_lossy().to_string();
            }
            pipeline.raw_passthrough |= *raw;

            init_logging(&args, Some(&pipeline))?;
            cmd_run(input, output.as_deref(), monitor.as_deref(), &pipeline)
        }
        Command::Inspect {
            input,
            codec,
            frames,
        } => {
            init_logging(&args, None)?;
            cmd_inspect(input, codec.as_deref(), *frames)
        }
        Command::SampleConfig => {
            print!("{}", PipelineConfig::sample_config());
            Ok(())
        }
    }
}

fn init_logging(args: &Args, config: Option<&PipelineConfig>) -> Result<()> {
    // Flags win over the config file
    let level = match config {
        Some(c) if args.verbose == 0 && !args.quiet && !c.log_level.is_empty() => {
            c.log_level.clone()
        }
        _ => args.log_level().to_string(),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let log_file = args
        .log
        .clone()
        .or_else(|| config.map(|c| c.log_file.clone()).filter(|f| !f.is_empty()));

    if let Some(log_file) = log_file {
        let file = std::fs::File::create(&log_file)
            .with_context(|| format!("Failed to create log file '{}'", log_file))?;
        subscriber.with_writer(file).init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Run a patch session until the input is drained or Ctrl+C
fn cmd_run(
    input: &str,
    output: Option<&Path>,
    monitor: Option<&Path>,
    pipeline: &PipelineConfig,
) -> Result<()> {
    let session_config = pipeline.to_session_config()?;

    let source: Box<dyn TunerSource> = if input == "-" {
        Box::new(ReaderSource::new(std::io::stdin()))
    } else {
        Box::new(ReaderSource::open(input)?)
    };

    let sink: Box<dyn RenderSink> = match output {
        Some(path) => Box::new(WriterSink::create(path)?),
        None => Box::new(NullSink::new()),
    };

    let clock: Arc<dyn ClockSource> = match pipeline.clock.register_paths() {
        Some(paths) => {
            info!("Using clock registers in {}", pipeline.clock.register_dir);
            Arc::new(RegisterClock::new(paths))
        }
        None => Arc::new(MemoryClock::new()),
    };

    let registry = CapabilityRegistry::with_builtins();
    let mut format_monitor = match monitor {
        Some(path) => {
            let capture = ReaderSource::open(path)?;
            let hysteresis = session_config.hysteresis_periods;
            info!("Classifying {} on a monitor thread", path.display());
            Some(FormatMonitor::spawn(Box::new(capture), hysteresis)?)
        }
        None => None,
    };
    let session = match &format_monitor {
        Some(m) => PatchSession::create_monitored(
            session_config,
            source,
            sink,
            clock,
            registry,
            m.detected(),
        )?,
        None => PatchSession::create(session_config, source, sink, clock, registry)?,
    };

    // Setup Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, stopping...");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to install Ctrl+C handler: {}", e);
    }

    if !session.submit_command(SessionCommand::Start) {
        error!("Session rejected START");
        bail!("failed to start patch session");
    }
    println!("Patch session running. Press Ctrl+C to stop.\n");

    let mut last_read = 0;
    let mut idle = 0;
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
        let stats = session.stats();
        if stats.bytes_read == last_read && stats.bytes_read > 0 && stats.ring_queued == 0 {
            idle += 1;
            if idle >= IDLE_POLLS {
                info!("Input drained after {} bytes", stats.bytes_read);
                break;
            }
        } else {
            idle = 0;
        }
        last_read = stats.bytes_read;
    }

    session.submit_command(SessionCommand::Stop);
    // Give the session loop a chance to run STOP before the final snapshot
    std::thread::sleep(Duration::from_millis(50));
    let stats = session.stats();
    session.release();
    if let Some(m) = format_monitor.as_mut() {
        m.stop();
    }

    print_stats(&stats);
    println!("Stopped.");
    Ok(())
}

fn print_stats(stats: &SessionStats) {
    println!("Session summary:\n");
    println!("  Format:       {}", stats.format);
    if let Some(codec) = stats.codec {
        println!("  Codec:        {}", codec);
    }
    if let Some(engine) = &stats.engine {
        let mode = if stats.passthrough { " (pass-through)" } else { "" };
        println!("  Engine:       {}{}", engine, mode);
    }
    println!("  Frames:       {}", stats.frames_decoded);
    println!("  Read:         {} bytes", stats.bytes_read);
    println!("  Rendered:     {} bytes", stats.bytes_rendered);
    println!("  Silence:      {} bytes", stats.silence_bytes);
    println!("  Dropped:      {} bytes", stats.bytes_dropped);
    println!("  Last PTS:     {:#x}", stats.last_pts);
    println!();
}

/// Classify a capture file and list its frame headers
fn cmd_inspect(input: &Path, codec: Option<&str>, max_frames: usize) -> Result<()> {
    let data = std::fs::read(input)
        .with_context(|| format!("Failed to read capture '{}'", input.display()))?;

    let codec = match codec {
        Some(name) => match parse_codec(name) {
            Some(codec) => codec,
            None => bail!("unknown codec '{}'", name),
        },
        None => None,
    };

    println!("Capture: {} ({} bytes)\n", input.display(), data.len());

    let mut tracker = FormatTracker::default();
    let mut current = None;
    for (index, window) in data.chunks(CAPTURE_WINDOW_BYTES).enumerate() {
        let format = tracker.observe(window);
        if current != Some(format) {
            println!(
                "  @{:<10} {} (period {} bytes)",
                index * CAPTURE_WINDOW_BYTES,
                format,
                tracker.period_size()
            );
            current = Some(format);
        }
    }
    println!();

    let listed = match codec {
        Some(codec) if codec.is_dolby() || codec.is_dts() => {
            list_elementary_frames(&data, codec, max_frames)
        }
        Some(codec) => {
            println!("No frame headers for {}", codec);
            0
        }
        None => list_burst_frames(&data, max_frames),
    };
    println!("\n{} frame(s) listed", listed);
    Ok(())
}

fn list_elementary_frames(data: &[u8], codec: Codec, max_frames: usize) -> usize {
    let mut offset = 0;
    let mut shown = 0;
    while offset < data.len() && shown < max_frames {
        let sync = if codec.is_dolby() {
            ac3::find_sync(&data[offset..]).map(|(pos, _)| pos)
        } else {
            dts::find_sync(&data[offset..]).map(|(pos, _)| pos)
        };
        let Some(pos) = sync else { break };
        let start = offset + pos;
        match parser::parse_frame(codec, &data[start..]) {
            Ok(frame) => {
                print_frame(start, &frame);
                shown += 1;
                offset = start + frame.frame_size_bytes.max(1);
            }
            Err(_) => offset = start + 1,
        }
    }
    shown
}

fn list_burst_frames(data: &[u8], max_frames: usize) -> usize {
    let mut deframer = BurstDeframer::new();
    let mut shown = 0;
    for payload in deframer.push(data) {
        if shown >= max_frames {
            break;
        }
        let Some(codec) = payload.format.codec() else {
            continue;
        };
        if !(codec.is_dolby() || codec.is_dts()) {
            continue;
        }
        if let Ok(frame) = parser::parse_frame(codec, &payload.data) {
            print_frame(shown, &frame);
            shown += 1;
        }
    }
    shown
}

fn print_frame(position: usize, frame: &tunerpath::audio::CompressedFrame) {
    let order = if frame.is_big_endian_on_wire { "BE" } else { "LE" };
    println!(
        "  #{:<8} {:<7} {:>6}Hz {}ch {:>5} bytes {:>5} samples {}",
        position,
        frame.codec,
        frame.sample_rate,
        frame.channel_count,
        frame.frame_size_bytes,
        frame.samples_per_frame,
        order
    );
}
