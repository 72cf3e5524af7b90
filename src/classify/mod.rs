//! Live format detection for burst-wrapped and bare compressed streams

mod deframe;
mod monitor;
mod tracker;

pub use deframe::{burst_data_type, pack_burst, BurstDeframer, BurstPayload};
pub use monitor::{DetectedFormat, FormatMonitor, CAPTURE_WINDOW_BYTES};
pub use tracker::{FormatTracker, DEFAULT_HYSTERESIS_PERIODS};

use crate::audio::Codec;

/// Burst preamble Pa/Pb with 16-bit words in little-endian byte order
const BURST_SYNC_LE: [u8; 4] = [0x72, 0xF8, 0x1F, 0x4E];
/// Burst preamble Pa/Pb with 16-bit words in big-endian byte order
const BURST_SYNC_BE: [u8; 4] = [0xF8, 0x72, 0x4E, 0x1F];

const DTS_CD_SYNC_LE: [u8; 6] = [0xFF, 0x1F, 0x00, 0xE8, 0xF1, 0x07];
const DTS_CD_SYNC_BE: [u8; 6] = [0x1F, 0xFF, 0xE8, 0x00, 0x07, 0xF1];

/// Size of Pa, Pb, Pc and Pd together
pub const BURST_HEADER_BYTES: usize = 8;

// Period sizes are in bytes of the 16-bit stereo transport
pub const PCM_PERIOD_SIZE: usize = 1024 * 4;
pub const AC3_PERIOD_SIZE: usize = 1536 * 4;
pub const EAC3_PERIOD_SIZE: usize = 6144 * 4;
pub const DTS1_PERIOD_SIZE: usize = 512 * 4;
pub const DTS2_PERIOD_SIZE: usize = 1024 * 4;
pub const DTS3_PERIOD_SIZE: usize = 2048 * 4;
pub const DTSHD_PERIOD_SIZE: usize = 512 * 4;
pub const TRUEHD_PERIOD_SIZE: usize = 15360 * 4;

// Pc data-type codes
const TYPE_NULL: u16 = 0x00;
const TYPE_AC3: u16 = 0x01;
const TYPE_PAUSE: u16 = 0x03;
const TYPE_DTS1: u16 = 0x0B;
const TYPE_DTS2: u16 = 0x0C;
const TYPE_DTS3: u16 = 0x0D;
const TYPE_DTSHD: u16 = 0x11;
const TYPE_EAC3: u16 = 0x15;
const TYPE_TRUEHD: u16 = 0x16;

/// Format tag for the incoming byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamFormat {
    Pcm = 0,
    Ac3 = 1,
    Eac3 = 2,
    Dts = 3,
    DtsHd = 4,
    TrueHd = 5,
    Mute = 6,
    Pause = 7,
}

impl StreamFormat {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => StreamFormat::Ac3,
            2 => StreamFormat::Eac3,
            3 => StreamFormat::Dts,
            4 => StreamFormat::DtsHd,
            5 => StreamFormat::TrueHd,
            6 => StreamFormat::Mute,
            7 => StreamFormat::Pause,
            _ => StreamFormat::Pcm,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Codec of the payload, if the format carries audio
    pub fn codec(self) -> Option<Codec> {
        match self {
            StreamFormat::Pcm => Some(Codec::Pcm),
            StreamFormat::Ac3 => Some(Codec::Ac3),
            StreamFormat::Eac3 => Some(Codec::Eac3),
            StreamFormat::Dts => Some(Codec::Dts),
            StreamFormat::DtsHd => Some(Codec::DtsHd),
            StreamFormat::TrueHd => Some(Codec::TrueHd),
            StreamFormat::Mute | StreamFormat::Pause => None,
        }
    }

    pub fn is_compressed(self) -> bool {
        !matches!(self, StreamFormat::Pcm)
    }
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.codec() {
            Some(codec) => write!(f, "{}", codec),
            None if *self == StreamFormat::Mute => f.write_str("MUTE"),
            None => f.write_str("PAUSE"),
        }
    }
}

/// Burst header found inside one capture window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstEnvelope {
    pub preamble_offset: usize,
    /// Raw Pc word
    pub payload_type: u16,
    /// Raw Pd word
    pub payload_length: u16,
    pub big_endian: bool,
}

impl BurstEnvelope {
    /// Five-bit data type from Pc
    pub fn data_type(&self) -> u16 {
        self.payload_type & 0x1F
    }

    /// Format and period size the data type maps to
    pub fn format(&self) -> Option<(StreamFormat, usize)> {
        let mapped = match self.data_type() {
            TYPE_AC3 => (StreamFormat::Ac3, AC3_PERIOD_SIZE),
            TYPE_EAC3 => (StreamFormat::Eac3, EAC3_PERIOD_SIZE),
            TYPE_DTS1 => (StreamFormat::Dts, DTS1_PERIOD_SIZE),
            TYPE_DTS2 => (StreamFormat::Dts, DTS2_PERIOD_SIZE),
            TYPE_DTS3 => (StreamFormat::Dts, DTS3_PERIOD_SIZE),
            TYPE_DTSHD => {
                let shift = (self.payload_type >> 8) & 0x07;
                (StreamFormat::DtsHd, DTSHD_PERIOD_SIZE << shift)
            }
            TYPE_TRUEHD => (StreamFormat::TrueHd, TRUEHD_PERIOD_SIZE),
            TYPE_NULL => (StreamFormat::Mute, PCM_PERIOD_SIZE),
            TYPE_PAUSE => (StreamFormat::Pause, PCM_PERIOD_SIZE),
            _ => return None,
        };
        Some(mapped)
    }

    /// Payload length in bytes, Pd counts bits for the older data types
    pub fn payload_bytes(&self) -> usize {
        let pd = self.payload_length as usize;
        match self.data_type() {
            TYPE_EAC3 | TYPE_TRUEHD | TYPE_DTSHD => pd,
            TYPE_NULL => 0,
            _ => pd.div_ceil(8),
        }
    }
}

/// Result of scanning one capture window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub format: StreamFormat,
    pub period_size: usize,
    pub offset: usize,
    pub envelope: Option<BurstEnvelope>,
}

/// Locate a burst preamble in either byte order
///
/// Returns the offset and whether the words are big-endian.
pub fn seek_burst_sync(buffer: &[u8]) -> Option<(usize, bool)> {
    if buffer.len() < BURST_SYNC_LE.len() {
        return None;
    }
    buffer.windows(4).enumerate().find_map(|(i, w)| {
        if w == BURST_SYNC_LE {
            Some((i, false))
        } else if w == BURST_SYNC_BE {
            Some((i, true))
        } else {
            None
        }
    })
}

/// Locate the bare 14-bit DTS sync pattern in either byte order
pub fn seek_dts_cd_sync(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < DTS_CD_SYNC_LE.len() {
        return None;
    }
    buffer
        .windows(6)
        .position(|w| w == DTS_CD_SYNC_LE || w == DTS_CD_SYNC_BE)
}

/// Read the burst header at `offset`, if the window holds all of it
pub fn read_envelope(buffer: &[u8], offset: usize, big_endian: bool) -> Option<BurstEnvelope> {
    let header = buffer.get(offset..offset + BURST_HEADER_BYTES)?;
    let word = |i: usize| {
        if big_endian {
            u16::from_be_bytes([header[i], header[i + 1]])
        } else {
            u16::from_le_bytes([header[i], header[i + 1]])
        }
    };
    Some(BurstEnvelope {
        preamble_offset: offset,
        payload_type: word(4),
        payload_length: word(6),
        big_endian,
    })
}

/// Scan a capture window for any compressed sync
pub fn scan(buffer: &[u8]) -> Option<Detection> {
    let mut start = 0;
    while let Some((rel, big_endian)) = seek_burst_sync(&buffer[start..]) {
        let offset = start + rel;
        if let Some(envelope) = read_envelope(buffer, offset, big_endian) {
            if let Some((format, period_size)) = envelope.format() {
                return Some(Detection {
                    format,
                    period_size,
                    offset,
                    envelope: Some(envelope),
                });
            }
        }
        start = offset + 1;
    }

    seek_dts_cd_sync(buffer).map(|offset| Detection {
        format: StreamFormat::Dts,
        period_size: DTS1_PERIOD_SIZE,
        offset,
        envelope: None,
    })
}

/// Classify a capture window, falling back to PCM when nothing matches
pub fn classify(buffer: &[u8]) -> (StreamFormat, usize) {
    scan(buffer)
        .map(|d| (d.format, d.period_size))
        .unwrap_or((StreamFormat::Pcm, PCM_PERIOD_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ac3_window() -> Vec<u8> {
        let mut window = vec![0x72, 0xF8, 0x1F, 0x4E, 0x01, 0x00, 0x00, 0x06];
        window.resize(16, 0);
        window
    }

    #[test]
    fn test_ac3_burst_window() {
        assert_eq!(classify(&ac3_window()), (StreamFormat::Ac3, AC3_PERIOD_SIZE));
    }

    #[test]
    fn test_classify_is_idempotent() {
        let window = ac3_window();
        let first = classify(&window);
        for _ in 0..10 {
            assert_eq!(classify(&window), first);
        }
    }

    #[test]
    fn test_big_endian_preamble() {
        let mut window = vec![0u8; 3];
        window.extend_from_slice(&[0xF8, 0x72, 0x4E, 0x1F, 0x00, 0x15, 0x60, 0x00]);
        let detection = scan(&window).unwrap();
        assert_eq!(detection.format, StreamFormat::Eac3);
        assert_eq!(detection.offset, 3);
        let envelope = detection.envelope.unwrap();
        assert!(envelope.big_endian);
        assert_eq!(envelope.payload_bytes(), 0x6000);
    }

    #[test]
    fn test_dts_variants() {
        for (code, period) in [
            (0x0B, DTS1_PERIOD_SIZE),
            (0x0C, DTS2_PERIOD_SIZE),
            (0x0D, DTS3_PERIOD_SIZE),
        ] {
            let window = [0x72, 0xF8, 0x1F, 0x4E, code, 0x00, 0x00, 0x10];
            assert_eq!(classify(&window), (StreamFormat::Dts, period));
        }
        // DTS-HD with subtype 3 in Pc bits 8..10
        let window = [0x72, 0xF8, 0x1F, 0x4E, 0x11, 0x03, 0x00, 0x10];
        assert_eq!(classify(&window), (StreamFormat::DtsHd, DTSHD_PERIOD_SIZE << 3));
    }

    #[test]
    fn test_pause_and_null_bursts() {
        let pause = [0x72, 0xF8, 0x1F, 0x4E, 0x03, 0x00, 0x20, 0x00];
        assert_eq!(classify(&pause).0, StreamFormat::Pause);
        let null = [0x72, 0xF8, 0x1F, 0x4E, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(classify(&null).0, StreamFormat::Mute);
    }

    #[test]
    fn test_dts_cd_without_burst() {
        let mut window = vec![0x11; 5];
        window.extend_from_slice(&DTS_CD_SYNC_BE);
        assert_eq!(classify(&window), (StreamFormat::Dts, DTS1_PERIOD_SIZE));
        assert_eq!(seek_dts_cd_sync(&DTS_CD_SYNC_LE), Some(0));
    }

    #[test]
    fn test_short_windows_are_not_found() {
        assert_eq!(seek_burst_sync(&[0x72, 0xF8, 0x1F]), None);
        assert_eq!(seek_dts_cd_sync(&[0xFF, 0x1F, 0x00, 0xE8, 0xF1]), None);
        assert_eq!(classify(&[]), (StreamFormat::Pcm, PCM_PERIOD_SIZE));
    }

    #[test]
    fn test_unknown_type_keeps_scanning() {
        let mut window = vec![0x72, 0xF8, 0x1F, 0x4E, 0x1E, 0x00, 0x00, 0x00];
        window.extend_from_slice(&[0x72, 0xF8, 0x1F, 0x4E, 0x01, 0x00, 0x00, 0x06]);
        let detection = scan(&window).unwrap();
        assert_eq!(detection.format, StreamFormat::Ac3);
        assert_eq!(detection.offset, 8);
    }

    #[test]
    fn test_format_codes_round_trip() {
        for format in [StreamFormat::Ac3, StreamFormat::DtsHd, StreamFormat::Pause] {
            assert_eq!(StreamFormat::from_code(format.code()), format);
        }
    }
}
