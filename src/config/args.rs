//! CLI argument parsing using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// tunerpath - Broadcast tuner audio path
///
/// Classify, decode and PTS-sync compressed audio from a tuner stream
#[derive(Parser, Debug)]
#[command(name = "tunerpath")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode - only show errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log output to file
    #[arg(long, global = true)]
    pub log: Option<String>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a patch session from a capture file or stdin
    Run {
        /// Tuner capture file ("-" for stdin)
        input: String,

        /// Render output file (omit to discard output)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Codec of a bare elementary stream (ac3, eac3, dts, dtshd, pcm)
        #[arg(short, long)]
        codec: Option<String>,

        /// Pipeline config file (default: search standard locations)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory of clock registers, overrides the config file
        #[arg(long)]
        registers: Option<PathBuf>,

        /// Render re-packaged bitstream instead of PCM
        #[arg(long)]
        raw: bool,

        /// Auxiliary capture to classify on a monitor thread
        #[arg(long)]
        monitor: Option<PathBuf>,
    },

    /// Classify a capture file and list the frames found in it
    Inspect {
        /// Tuner capture file
        input: PathBuf,

        /// Codec of a bare elementary stream to list frames for
        #[arg(short, long)]
        codec: Option<String>,

        /// Maximum frame headers to print
        #[arg(long, default_value = "20")]
        frames: usize,
    },

    /// Print a commented sample config file
    SampleConfig,
}

impl Args {
    /// Get the log level based on verbose/quiet flags
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else {
            match self.verbose {
                0 => tracing::Level::INFO,
                1 => tracing::Level::DEBUG,
                _ => tracing::Level::TRACE,
            }
        }
    }
}
