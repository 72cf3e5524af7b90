//! Bit-level frame header parsing for compressed audio

pub mod ac3;
mod bits;
pub mod dts;

pub use ac3::{parse_header, Ac3Header, AC3_HEADER_BYTES};
pub use bits::BitReader;
pub use dts::{parse_dts_header, DtsHeader, DtsPacking, DTS_HEADER_BYTES};

use crate::audio::{Codec, CompressedFrame};
use crate::error::{PatchError, Result};

/// Swap the two bytes of every 16-bit word in place
///
/// A trailing odd byte is left untouched.
pub fn swap_pairs(buf: &mut [u8]) {
    for pair in buf.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

/// Parse a frame header for the given codec family
pub fn parse_frame(codec: Codec, bytes: &[u8]) -> Result<CompressedFrame> {
    match codec {
        Codec::Ac3 | Codec::Eac3 => parse_header(bytes).map(|h| h.to_frame()),
        Codec::Dts | Codec::DtsHd => parse_dts_header(bytes).map(|h| h.to_frame()),
        other => Err(PatchError::UnsupportedStream(format!(
            "no frame header for {}",
            other
        ))),
    }
}
