//! DTS core and DTS-HD substream frame boundary detection

use super::bits::BitReader;
use super::swap_pairs;
use crate::audio::{Codec, CompressedFrame};
use crate::error::{PatchError, Result};
use tracing::trace;

/// Bytes needed to parse a core header in any packing
pub const DTS_HEADER_BYTES: usize = 16;

const CORE_SYNC_BE: [u8; 4] = [0x7F, 0xFE, 0x80, 0x01];
const CORE_SYNC_LE: [u8; 4] = [0xFE, 0x7F, 0x01, 0x80];
const CORE_SYNC_14_BE: [u8; 6] = [0x1F, 0xFF, 0xE8, 0x00, 0x07, 0xF0];
const CORE_SYNC_14_LE: [u8; 6] = [0xFF, 0x1F, 0x00, 0xE8, 0xF0, 0x07];
const SUBSTREAM_SYNC: [u8; 4] = [0x64, 0x58, 0x20, 0x25];

const SAMPLE_RATES: [u32; 16] = [
    0, 8000, 16000, 32000, 0, 0, 11025, 22050, 44100, 0, 0, 12000, 24000, 48000, 0, 0,
];

/// Smallest FSIZE field a valid core frame may carry
const MIN_FSIZE: u32 = 95;

/// How a DTS stream is packed into 16-bit words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtsPacking {
    /// 16-bit words, big-endian
    Be16,
    /// 16-bit words, little-endian
    Le16,
    /// 14 bits per 16-bit word, big-endian (DTS-CD)
    Be14,
    /// 14 bits per 16-bit word, little-endian (DTS-CD)
    Le14,
    /// DTS-HD extension substream
    Substream,
}

impl DtsPacking {
    fn is_14bit(&self) -> bool {
        matches!(self, DtsPacking::Be14 | DtsPacking::Le14)
    }
}

/// Decoded fields of a DTS frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtsHeader {
    pub sample_rate: u32,
    /// Size of the frame as it appears on the wire
    pub frame_size_bytes: usize,
    pub channel_count: u16,
    pub samples_per_frame: u32,
    pub packing: DtsPacking,
}

impl DtsHeader {
    pub fn to_frame(&self) -> CompressedFrame {
        CompressedFrame {
            codec: if self.packing == DtsPacking::Substream {
                Codec::DtsHd
            } else {
                Codec::Dts
            },
            sample_rate: self.sample_rate,
            frame_size_bytes: self.frame_size_bytes,
            channel_count: self.channel_count,
            samples_per_frame: self.samples_per_frame,
            is_big_endian_on_wire: matches!(
                self.packing,
                DtsPacking::Be16 | DtsPacking::Be14 | DtsPacking::Substream
            ),
        }
    }
}

/// Identify the packing of a sync word at the start of `bytes`
pub fn sync_at(bytes: &[u8]) -> Option<DtsPacking> {
    if bytes.starts_with(&CORE_SYNC_BE) {
        Some(DtsPacking::Be16)
    } else if bytes.starts_with(&CORE_SYNC_LE) {
        Some(DtsPacking::Le16)
    } else if bytes.starts_with(&SUBSTREAM_SYNC) {
        Some(DtsPacking::Substream)
    } else if bytes.len() >= 6
        && bytes[..5] == CORE_SYNC_14_BE[..5]
        && bytes[5] & 0xF0 == CORE_SYNC_14_BE[5]
    {
        Some(DtsPacking::Be14)
    } else if bytes.len() >= 6
        && bytes[..4] == CORE_SYNC_14_LE[..4]
        && bytes[4] & 0xF0 == CORE_SYNC_14_LE[4]
        && bytes[5] == CORE_SYNC_14_LE[5]
    {
        Some(DtsPacking::Le14)
    } else {
        None
    }
}

/// Find the first DTS sync word at any byte offset
pub fn find_sync(bytes: &[u8]) -> Option<(usize, DtsPacking)> {
    (0..bytes.len().saturating_sub(3))
        .find_map(|i| sync_at(&bytes[i..]).map(|packing| (i, packing)))
}

/// Convert a 14-bit packed region into a contiguous big-endian bit stream
fn unpack_14bit(bytes: &[u8], little_endian: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut acc: u32 = 0;
    let mut acc_bits = 0;
    for pair in bytes.chunks_exact(2) {
        let word = if little_endian {
            u16::from_le_bytes([pair[0], pair[1]])
        } else {
            u16::from_be_bytes([pair[0], pair[1]])
        };
        acc = (acc << 14) | (word as u32 & 0x3FFF);
        acc_bits += 14;
        while acc_bits >= 8 {
            acc_bits -= 8;
            out.push((acc >> acc_bits) as u8);
        }
        acc &= (1 << acc_bits) - 1;
    }
    out
}

/// Parse the DTS header at the start of `bytes`
pub fn parse_dts_header(bytes: &[u8]) -> Result<DtsHeader> {
    if bytes.len() < DTS_HEADER_BYTES {
        return Err(PatchError::NeedMoreData {
            have: bytes.len(),
            need: DTS_HEADER_BYTES,
        });
    }
    let packing = sync_at(bytes).ok_or_else(|| {
        PatchError::InvalidSync(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    })?;

    let header: Vec<u8> = match packing {
        DtsPacking::Substream => return parse_substream(bytes),
        DtsPacking::Be16 => bytes[..DTS_HEADER_BYTES].to_vec(),
        DtsPacking::Le16 => {
            let mut h = bytes[..DTS_HEADER_BYTES].to_vec();
            swap_pairs(&mut h);
            h
        }
        DtsPacking::Be14 => unpack_14bit(&bytes[..DTS_HEADER_BYTES], false),
        DtsPacking::Le14 => unpack_14bit(&bytes[..DTS_HEADER_BYTES], true),
    };

    let mut bits = BitReader::new(&header);
    bits.skip(32)?; // sync
    bits.skip(1 + 5 + 1)?; // ftype, short, cpf
    let nblks = bits.read(7)?;
    let fsize = bits.read(14)?;
    let amode = bits.read(6)?;
    let sfreq = bits.read(4)? as u8;

    if nblks < 5 {
        return Err(PatchError::UnsupportedStream(format!(
            "DTS block count {}",
            nblks + 1
        )));
    }
    if fsize < MIN_FSIZE {
        return Err(PatchError::InvalidFrameSize(fsize + 1));
    }
    let sample_rate = SAMPLE_RATES[sfreq as usize];
    if sample_rate == 0 {
        return Err(PatchError::InvalidSampleRate(sfreq));
    }

    let mut frame_size_bytes = fsize as usize + 1;
    if packing.is_14bit() {
        frame_size_bytes = frame_size_bytes * 16 / 14;
    }

    let parsed = DtsHeader {
        sample_rate,
        frame_size_bytes,
        channel_count: if amode == 0 { 1 } else { 2 },
        samples_per_frame: (nblks + 1) * 32,
        packing,
    };
    trace!(
        "DTS header: rate={} size={} samples={} packing={:?}",
        parsed.sample_rate,
        parsed.frame_size_bytes,
        parsed.samples_per_frame,
        packing
    );
    Ok(parsed)
}

fn parse_substream(bytes: &[u8]) -> Result<DtsHeader> {
    let mut bits = BitReader::new(bytes);
    bits.skip(32 + 8 + 2)?; // sync, user bits, substream index
    let wide = bits.read_bool()?;
    let (header_bits, size_bits) = if wide { (12, 20) } else { (8, 16) };
    let header_size = bits.read(header_bits)? as usize + 1;
    let frame_size_bytes = bits.read(size_bits)? as usize + 1;
    if frame_size_bytes < header_size {
        return Err(PatchError::InvalidFrameSize(frame_size_bytes as u32));
    }
    Ok(DtsHeader {
        sample_rate: 48_000,
        frame_size_bytes,
        channel_count: 2,
        samples_per_frame: 512,
        packing: DtsPacking::Substream,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a 16-bit big-endian core header with 48 kHz rate
    pub(crate) fn dts_core_header(fsize: u16, nblks: u8) -> Vec<u8> {
        // Fields after sync: ftype(1) short(5) cpf(1) nblks(7) fsize(14) amode(6) sfreq(4)
        let mut value: u64 = 1;
        value = (value << 5) | 31;
        value <<= 1;
        value = (value << 7) | nblks as u64;
        value = (value << 14) | fsize as u64;
        value = (value << 6) | 9;
        value = (value << 4) | 13;
        // 38 bits, left-align into 48
        value <<= 10;
        let mut out = CORE_SYNC_BE.to_vec();
        out.extend_from_slice(&value.to_be_bytes()[2..]);
        out.resize(DTS_HEADER_BYTES, 0);
        out
    }

    #[test]
    fn test_core_header_be() {
        let header = parse_dts_header(&dts_core_header(2012, 15)).unwrap();
        assert_eq!(header.sample_rate, 48_000);
        assert_eq!(header.frame_size_bytes, 2013);
        assert_eq!(header.samples_per_frame, 512);
        assert_eq!(header.channel_count, 2);
        assert_eq!(header.packing, DtsPacking::Be16);
        assert_eq!(header.to_frame().codec, Codec::Dts);
    }

    #[test]
    fn test_core_header_le_matches_be() {
        let be = dts_core_header(1023, 15);
        let mut le = be.clone();
        swap_pairs(&mut le);
        let a = parse_dts_header(&be).unwrap();
        let b = parse_dts_header(&le).unwrap();
        assert_eq!(b.packing, DtsPacking::Le16);
        assert_eq!(a.frame_size_bytes, b.frame_size_bytes);
        assert_eq!(a.sample_rate, b.sample_rate);
        assert!(!b.to_frame().is_big_endian_on_wire);
    }

    #[test]
    fn test_rejects_small_frames() {
        assert!(matches!(
            parse_dts_header(&dts_core_header(50, 15)),
            Err(PatchError::InvalidFrameSize(51))
        ));
        assert!(matches!(
            parse_dts_header(&dts_core_header(1023, 2)),
            Err(PatchError::UnsupportedStream(_))
        ));
    }

    #[test]
    fn test_14bit_sync_detection() {
        let be14 = [0x1F, 0xFF, 0xE8, 0x00, 0x07, 0xF1, 0, 0];
        let le14 = [0xFF, 0x1F, 0x00, 0xE8, 0xF1, 0x07, 0, 0];
        assert_eq!(sync_at(&be14), Some(DtsPacking::Be14));
        assert_eq!(sync_at(&le14), Some(DtsPacking::Le14));
        assert_eq!(find_sync(&[0, 0, 0x7F, 0xFE, 0x80, 0x01]), Some((2, DtsPacking::Be16)));
    }

    #[test]
    fn test_substream_header() {
        // user bits 0, index 0, narrow header, header size 15, frame size 999
        let mut data = SUBSTREAM_SYNC.to_vec();
        let fields: u64 = ((15u64 << 16) | 999) << (64 - 8 - 2 - 1 - 8 - 16);
        data.extend_from_slice(&fields.to_be_bytes());
        data.resize(DTS_HEADER_BYTES, 0);
        let header = parse_dts_header(&data).unwrap();
        assert_eq!(header.packing, DtsPacking::Substream);
        assert_eq!(header.frame_size_bytes, 1000);
        assert_eq!(header.to_frame().codec, Codec::DtsHd);
    }
}
