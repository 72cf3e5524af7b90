//! Extraction of compressed payloads from burst-mode transport

use super::{
    read_envelope, seek_burst_sync, StreamFormat, BURST_HEADER_BYTES, DTS1_PERIOD_SIZE,
    DTS2_PERIOD_SIZE, DTS3_PERIOD_SIZE, DTSHD_PERIOD_SIZE, TYPE_AC3, TYPE_DTS1, TYPE_DTS2,
    TYPE_DTS3, TYPE_DTSHD, TYPE_EAC3, TYPE_NULL, TYPE_PAUSE, TYPE_TRUEHD,
};
use crate::parser::swap_pairs;
use tracing::{trace, warn};

/// Largest payload a single burst may carry
const MAX_BURST_PAYLOAD: usize = 65_536;

/// One compressed payload with the burst header stripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurstPayload {
    pub format: StreamFormat,
    pub period_size: usize,
    /// Payload bytes in big-endian 16-bit word order
    pub data: Vec<u8>,
}

/// Reassembles burst payloads that straddle read boundaries
#[derive(Debug, Default)]
pub struct BurstDeframer {
    pending: Vec<u8>,
    skipped: u64,
}

impl BurstDeframer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes discarded while hunting for a preamble
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Append transport bytes and return every payload now complete
    pub fn push(&mut self, bytes: &[u8]) -> Vec<BurstPayload> {
        self.pending.extend_from_slice(bytes);
        let mut payloads = Vec::new();

        loop {
            let Some((offset, big_endian)) = seek_burst_sync(&self.pending) else {
                // Keep a possible partial preamble
                let keep = self.pending.len().min(3);
                let drop = self.pending.len() - keep;
                self.discard(drop);
                break;
            };
            self.discard(offset);

            let Some(envelope) = read_envelope(&self.pending, 0, big_endian) else {
                break;
            };
            let Some((format, period_size)) = envelope.format() else {
                trace!("Unknown burst data type {:#x}", envelope.data_type());
                self.discard(1);
                continue;
            };

            let length = envelope.payload_bytes();
            if length > MAX_BURST_PAYLOAD {
                warn!("Burst payload length {} out of range, resyncing", length);
                self.discard(1);
                continue;
            }
            let padded = length + (length & 1);
            if self.pending.len() < BURST_HEADER_BYTES + padded {
                break;
            }

            let mut data = self.pending[BURST_HEADER_BYTES..BURST_HEADER_BYTES + padded].to_vec();
            if !big_endian {
                swap_pairs(&mut data);
            }
            data.truncate(length);
            self.pending.drain(..BURST_HEADER_BYTES + padded);

            trace!("Burst payload: {} {} bytes", format, data.len());
            payloads.push(BurstPayload {
                format,
                period_size,
                data,
            });
        }

        payloads
    }

    fn discard(&mut self, count: usize) {
        if count > 0 {
            self.pending.drain(..count);
            self.skipped += count as u64;
        }
    }
}

/// Pc data type that carries `format` at the given period
pub fn burst_data_type(format: StreamFormat, period_size: usize) -> Option<u16> {
    let data_type = match format {
        StreamFormat::Ac3 => TYPE_AC3,
        StreamFormat::Eac3 => TYPE_EAC3,
        StreamFormat::TrueHd => TYPE_TRUEHD,
        StreamFormat::Mute => TYPE_NULL,
        StreamFormat::Pause => TYPE_PAUSE,
        StreamFormat::Dts => match period_size {
            DTS1_PERIOD_SIZE => TYPE_DTS1,
            DTS2_PERIOD_SIZE => TYPE_DTS2,
            DTS3_PERIOD_SIZE => TYPE_DTS3,
            _ => return None,
        },
        StreamFormat::DtsHd => {
            let ratio = period_size / DTSHD_PERIOD_SIZE;
            if ratio == 0 || !ratio.is_power_of_two() || ratio > 1 << 7 {
                return None;
            }
            TYPE_DTSHD | ((ratio.trailing_zeros() as u16) << 8)
        }
        StreamFormat::Pcm => return None,
    };
    Some(data_type)
}

/// Wrap a big-endian payload in a little-endian burst padded to `period_size`
///
/// Returns `None` when the format has no burst representation.
pub fn pack_burst(format: StreamFormat, payload: &[u8], period_size: usize) -> Option<Vec<u8>> {
    let data_type = burst_data_type(format, period_size)?;
    let pd = match data_type & 0x1F {
        TYPE_EAC3 | TYPE_TRUEHD | TYPE_DTSHD => payload.len(),
        _ => payload.len() * 8,
    };
    let pd = u16::try_from(pd).ok()?;

    let padded = payload.len() + (payload.len() & 1);
    let total = period_size.max(BURST_HEADER_BYTES + padded);
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&[0x72, 0xF8, 0x1F, 0x4E]);
    out.extend_from_slice(&data_type.to_le_bytes());
    out.extend_from_slice(&pd.to_le_bytes());
    let body_start = out.len();
    out.extend_from_slice(payload);
    out.resize(body_start + padded, 0);
    swap_pairs(&mut out[body_start..]);
    out.resize(total, 0);
    Some(out)
}
