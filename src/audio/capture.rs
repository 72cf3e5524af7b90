//! Pull-style byte sources feeding the pipeline from a tuner or capture device

use crate::error::Result;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tracing::debug;

/// Byte stream from a demultiplexer or PCM capture device
///
/// `read` returns 0 when no data is available right now; the caller decides
/// whether to sleep and retry.
pub trait TunerSource: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Adapts any `Read` into a tuner source
pub struct ReaderSource<R> {
    reader: R,
    total: u64,
    at_eof: bool,
}

impl<R: Read + Send> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            total: 0,
            at_eof: false,
        }
    }

    /// Total bytes delivered so far
    pub fn total_read(&self) -> u64 {
        self.total
    }

    /// Whether the underlying reader has reported end of stream
    pub fn is_eof(&self) -> bool {
        self.at_eof
    }
}

impl ReaderSource<File> {
    /// Open a capture file as a tuner source
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        debug!("Opened tuner capture file: {}", path.as_ref().display());
        Ok(Self::new(file))
    }
}

impl<R: Read + Send> TunerSource for ReaderSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.reader.read(buf) {
                Ok(0) => {
                    if !self.at_eof {
                        debug!("Tuner source reached end after {} bytes", self.total);
                        self.at_eof = true;
                    }
                    return Ok(0);
                }
                Ok(n) => {
                    self.total += n as u64;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) => return Err(e.into()),
            }
        }
    }
}
