//! MSB-first bit reader over a byte slice

use crate::error::{PatchError, Result};
use bitstream_io::{BigEndian, BitRead, BitReader as StreamReader};
use std::fmt;
use std::io::{self, Cursor, SeekFrom};

/// Reads big-endian bit fields, crossing 16-bit word boundaries freely
pub struct BitReader<'a> {
    bs: StreamReader<Cursor<&'a [u8]>, BigEndian>,
    len_bytes: usize,
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            bs: StreamReader::new(Cursor::new(data)),
            len_bytes: data.len(),
            bit_pos: 0,
        }
    }

    /// Current position in bits from the start of the slice
    pub fn position(&self) -> usize {
        self.bit_pos
    }

    pub fn remaining_bits(&self) -> usize {
        (self.len_bytes * 8).saturating_sub(self.bit_pos)
    }

    /// Read `n` bits (at most 32) as an unsigned value
    pub fn read(&mut self, n: u32) -> Result<u32> {
        debug_assert!(n <= 32);
        self.ensure(n as usize)?;
        if n == 0 {
            return Ok(0);
        }
        let value = self
            .bs
            .read_unsigned_var::<u32>(n)
            .map_err(|e| self.map_io(e, n as usize))?;
        self.bit_pos += n as usize;
        Ok(value)
    }

    /// Read a single bit as a flag
    pub fn read_bool(&mut self) -> Result<bool> {
        self.ensure(1)?;
        let bit = self.bs.read_bit().map_err(|e| self.map_io(e, 1))?;
        self.bit_pos += 1;
        Ok(bit)
    }

    /// Return the next `n` bits without advancing
    pub fn peek(&mut self, n: u32) -> Result<u32> {
        let start = self.bit_pos;
        let value = self.read(n)?;
        self.bs
            .seek_bits(SeekFrom::Start(start as u64))
            .map_err(|e| self.map_io(e, 0))?;
        self.bit_pos = start;
        Ok(value)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.ensure(n)?;
        let mut left = n;
        while left > 0 {
            let step = left.min(u32::MAX as usize) as u32;
            self.bs.skip(step).map_err(|e| self.map_io(e, left))?;
            left -= step as usize;
        }
        self.bit_pos += n;
        Ok(())
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if n > self.remaining_bits() {
            return Err(self.need_more(n));
        }
        Ok(())
    }

    fn need_more(&self, n: usize) -> PatchError {
        PatchError::NeedMoreData {
            have: self.len_bytes,
            need: (self.bit_pos + n).div_ceil(8),
        }
    }

    fn map_io(&self, e: io::Error, n: usize) -> PatchError {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => self.need_more(n),
            _ => PatchError::Io(e),
        }
    }
}

impl fmt::Debug for BitReader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitReader")
            .field("position", &self.bit_pos)
            .field("len_bytes", &self.len_bytes)
            .finish()
    }
}
