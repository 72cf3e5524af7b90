//! Render sinks receiving decoded PCM or re-packaged bitstream

use crate::error::Result;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Downstream renderer at the fixed 48 kHz stereo 16-bit configuration
pub trait RenderSink: Send {
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Write `frames` stereo frames of silence
    fn write_silence(&mut self, frames: u32) -> Result<usize> {
        let zeros = vec![0u8; frames as usize * crate::audio::OUTPUT_FRAME_BYTES];
        self.write(&zeros)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Sink writing to any `Write` implementation
pub struct WriterSink<W: Write + Send> {
    writer: BufWriter<W>,
    written: u64,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

impl WriterSink<File> {
    /// Create (or truncate) an output file
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        debug!("Render output file: {}", path.as_ref().display());
        Ok(Self::new(file))
    }
}

impl<W: Write + Send> RenderSink for WriterSink<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.writer.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Sink that discards audio and counts bytes
#[derive(Debug, Default)]
pub struct NullSink {
    written: u64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

impl RenderSink for NullSink {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.written += buf.len() as u64;
        Ok(buf.len())
    }
}

/// Sink collecting output in shared memory, useful for probing and tests
#[derive(Clone, Default)]
pub struct MemorySink {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

impl RenderSink for MemorySink {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.data.lock().extend_from_slice(buf);
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_is_zero_frames() {
        let mut sink = MemorySink::new();
        let handle = sink.clone();
        sink.write_silence(480).unwrap();
        assert_eq!(handle.len(), 1920);
        assert!(handle.contents().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_writer_sink_counts() {
        let mut sink = WriterSink::new(Vec::new());
        sink.write(&[1, 2, 3]).unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.bytes_written(), 3);
    }
}
