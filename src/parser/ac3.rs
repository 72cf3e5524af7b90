//! AC-3 / Enhanced AC-3 sync frame header parsing

use super::bits::BitReader;
use super::swap_pairs;
use crate::audio::{Codec, CompressedFrame};
use crate::error::{PatchError, Result};
use tracing::trace;

/// Sync word at the start of every AC-3 and E-AC-3 frame
pub const AC3_SYNC: u16 = 0x0B77;

/// Bytes needed to reach every header field either variant reads
pub const AC3_HEADER_BYTES: usize = 8;

/// Samples carried by one classic AC-3 frame
pub const AC3_SAMPLES_PER_FRAME: u32 = 1536;

const SAMPLE_RATES: [u32; 3] = [48_000, 44_100, 32_000];

type FrameSizeTable = [[u16; 38]; 3];

/// Frame sizes in bytes, indexed by [fscod][frmsizecod]
const FRAME_SIZE_BYTES: FrameSizeTable = [
    [
        128, 128, 160, 160, 192, 192, 224, 224, 256, 256, 320, 320, 384, 384, 448, 448, 512, 512,
        640, 640, 768, 768, 896, 896, 1024, 1024, 1280, 1280, 1536, 1536, 1792, 1792, 2048, 2048,
        2304, 2304, 2560, 2560,
    ],
    [
        138, 140, 174, 176, 208, 210, 242, 244, 278, 280, 348, 350, 416, 418, 486, 488, 556, 558,
        696, 698, 834, 836, 974, 976, 1114, 1116, 1392, 1394, 1670, 1672, 1950, 1952, 2228, 2230,
        2506, 2508, 2786, 2788,
    ],
    [
        192, 192, 240, 240, 288, 288, 336, 336, 384, 384, 480, 480, 576, 576, 672, 672, 768, 768,
        960, 960, 1152, 1152, 1344, 1344, 1536, 1536, 1920, 1920, 2304, 2304, 2688, 2688, 3072,
        3072, 3456, 3456, 3840, 3840,
    ],
];

/// Frame size that downstream decoders expect one byte shorter
const PATCHED_FRAME_SIZE: (usize, usize) = (2013, 2012);

const EAC3_BLOCKS: [u32; 4] = [1, 2, 3, 6];

/// Decoded fields of an AC-3 family header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ac3Header {
    pub sample_rate: u32,
    pub frame_size_bytes: usize,
    pub channel_count: u16,
    pub is_enhanced: bool,
    pub bsid: u8,
    pub samples_per_frame: u32,
    /// Input had its 16-bit words byte-swapped and was corrected
    pub byte_swapped: bool,
}

impl Ac3Header {
    pub fn to_frame(&self) -> CompressedFrame {
        CompressedFrame {
            codec: if self.is_enhanced {
                Codec::Eac3
            } else {
                Codec::Ac3
            },
            sample_rate: self.sample_rate,
            frame_size_bytes: self.frame_size_bytes,
            channel_count: self.channel_count,
            samples_per_frame: self.samples_per_frame,
            is_big_endian_on_wire: !self.byte_swapped,
        }
    }
}

/// Apply the fixed correction to a looked-up frame size
pub fn patch_frame_size(bytes: usize) -> usize {
    if bytes == PATCHED_FRAME_SIZE.0 {
        PATCHED_FRAME_SIZE.1
    } else {
        bytes
    }
}

/// Table lookup with the fixed correction applied
fn lookup_frame_size(table: &FrameSizeTable, fscod: usize, frmsizecod: usize) -> usize {
    patch_frame_size(table[fscod][frmsizecod] as usize)
}

/// Check whether `bytes` starts with the sync word in either byte order
///
/// Returns `Some(true)` when the words are byte-swapped.
pub fn sync_at(bytes: &[u8]) -> Option<bool> {
    match bytes {
        [0x0B, 0x77, ..] => Some(false),
        [0x77, 0x0B, ..] => Some(true),
        _ => None,
    }
}

/// Find the first sync word at any byte offset
pub fn find_sync(bytes: &[u8]) -> Option<(usize, bool)> {
    (0..bytes.len().saturating_sub(1))
        .find_map(|i| sync_at(&bytes[i..]).map(|swapped| (i, swapped)))
}

/// Parse the header at the start of `bytes`
pub fn parse_header(bytes: &[u8]) -> Result<Ac3Header> {
    if bytes.len() < AC3_HEADER_BYTES {
        return Err(PatchError::NeedMoreData {
            have: bytes.len(),
            need: AC3_HEADER_BYTES,
        });
    }

    let mut header = [0u8; AC3_HEADER_BYTES];
    header.copy_from_slice(&bytes[..AC3_HEADER_BYTES]);
    let byte_swapped = match sync_at(&header) {
        Some(swapped) => swapped,
        None => {
            let word = u16::from_be_bytes([header[0], header[1]]);
            return Err(PatchError::InvalidSync(word as u32));
        }
    };
    if byte_swapped {
        swap_pairs(&mut header);
    }

    let mut bits = BitReader::new(&header);
    bits.skip(16)?;

    // bsid sits at bit 40 in both layouts
    let bsid = {
        let mut lookahead = BitReader::new(&header);
        lookahead.skip(40)?;
        lookahead.read(5)? as u8
    };

    let mut parsed = if bsid <= 8 {
        parse_classic(&mut bits, bsid)?
    } else if bsid <= 16 {
        parse_enhanced(&mut bits, bsid)?
    } else {
        return Err(PatchError::UnsupportedStream(format!("bsid {}", bsid)));
    };

    if parsed.frame_size_bytes <= AC3_HEADER_BYTES {
        return Err(PatchError::InvalidFrameSize(parsed.frame_size_bytes as u32));
    }

    parsed.byte_swapped = byte_swapped;
    trace!(
        "AC-3 header: bsid={} rate={} size={} ch={} swapped={}",
        parsed.bsid,
        parsed.sample_rate,
        parsed.frame_size_bytes,
        parsed.channel_count,
        byte_swapped
    );
    Ok(parsed)
}

fn parse_classic(bits: &mut BitReader<'_>, bsid: u8) -> Result<Ac3Header> {
    bits.skip(16)?; // crc1
    let fscod = bits.read(2)? as u8;
    let frmsizecod = bits.read(6)? as usize;
    if fscod == 3 {
        return Err(PatchError::InvalidSampleRate(fscod));
    }
    if frmsizecod >= FRAME_SIZE_BYTES[0].len() {
        return Err(PatchError::InvalidFrameSize(frmsizecod as u32));
    }
    bits.skip(5 + 3)?; // bsid, bsmod
    let acmod = bits.read(3)?;

    let frame_size_bytes =
        lookup_frame_size(&FRAME_SIZE_BYTES, fscod as usize, frmsizecod);

    Ok(Ac3Header {
        sample_rate: SAMPLE_RATES[fscod as usize],
        frame_size_bytes,
        channel_count: channels_for_acmod(acmod),
        is_enhanced: false,
        bsid,
        samples_per_frame: AC3_SAMPLES_PER_FRAME,
        byte_swapped: false,
    })
}

fn parse_enhanced(bits: &mut BitReader<'_>, bsid: u8) -> Result<Ac3Header> {
    let strmtyp = bits.read(2)?;
    // 0 = independent, 2 = converted from AC-3 and decodable on its own
    if strmtyp != 0 && strmtyp != 2 {
        return Err(PatchError::UnsupportedStream(format!(
            "E-AC-3 stream type {}",
            strmtyp
        )));
    }
    bits.skip(3)?; // substreamid
    let frmsiz = bits.read(11)? as usize;
    let fscod = bits.read(2)? as u8;
    if fscod == 3 {
        return Err(PatchError::UnsupportedStream(
            "E-AC-3 half sample rate".to_string(),
        ));
    }
    let numblkscod = bits.read(2)? as usize;
    let acmod = bits.read(3)?;

    Ok(Ac3Header {
        sample_rate: SAMPLE_RATES[fscod as usize],
        frame_size_bytes: 2 * (frmsiz + 1),
        channel_count: channels_for_acmod(acmod),
        is_enhanced: true,
        bsid,
        samples_per_frame: EAC3_BLOCKS[numblkscod] * 256,
        byte_swapped: false,
    })
}

/// Mono stays mono, everything else renders as stereo
fn channels_for_acmod(acmod: u32) -> u16 {
    if acmod == 1 {
        1
    } else {
        2
    }
}
