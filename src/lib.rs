//! tunerpath - Broadcast tuner audio path
//!
//! Classifies the audio leaving a tuner demultiplexer, decodes or re-packages
//! compressed frames through pluggable engine capabilities, and keeps the
//! rendered audio in step with the presentation clock.

pub mod audio;
pub mod classify;
pub mod config;
pub mod decoder;
pub mod error;
pub mod parser;
pub mod patch;
pub mod sync;

pub use error::{PatchError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
