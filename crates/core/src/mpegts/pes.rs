//! Packetized Elementary Stream units (ISO/IEC 13818-1 §2.4.3.6).
//!
//! ```text
//! packet_start_code_prefix(24)=0x000001  stream_id(8)  PES_packet_length(16)
//! '10' scrambling(2) priority(1) data_alignment(1) copyright(1) original(1)
//! PTS_DTS_flags(2) ...(6)  PES_header_data_length(8)
//! PTS(40) [DTS(40)]
//! payload
//! ```

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::media::{AudioConfig, VideoConfig, length_prefixed_to_annex_b};

pub const AUDIO_STREAM_ID: u8 = 0xC0;
pub const VIDEO_STREAM_ID: u8 = 0xE0;

/// PTS/DTS clock rate.
pub const CLOCK_RATE: u64 = 90_000;

const TIMESTAMP_MASK: u64 = (1 << 33) - 1;

const FIXED_HEADER_LEN: usize = 9;
const TIMESTAMP_LEN: usize = 5;

/// Presentation time in 90 kHz ticks, wrapped to 33 bits.
pub fn ticks(time: Duration) -> u64 {
    ((time.as_nanos() * CLOCK_RATE as u128 / 1_000_000_000) as u64) & TIMESTAMP_MASK
}

/// One access unit with its timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pes {
    pub stream_id: u8,
    pub pts: u64,
    pub dts: Option<u64>,
    pub payload: Bytes,
}

impl Pes {
    /// Wrap one audio frame behind its ADTS / Opus header.
    pub fn audio(config: &AudioConfig, frame: &[u8], pts: Duration) -> Self {
        let mut payload = BytesMut::with_capacity(frame.len() + 16);
        config.write_frame_header(frame.len(), &mut payload);
        payload.put_slice(frame);
        Self {
            stream_id: AUDIO_STREAM_ID,
            pts: ticks(pts),
            dts: None,
            payload: payload.freeze(),
        }
    }

    /// Wrap one length-prefixed picture as Annex B.
    ///
    /// Random-access pictures are preceded by the codec's parameter sets so
    /// a receiver can join at any keyframe.
    pub fn video(
        config: &VideoConfig,
        unit: &[u8],
        pts: Duration,
        dts: Option<Duration>,
        random_access: bool,
    ) -> Result<Self> {
        let mut payload = BytesMut::with_capacity(unit.len() + 128);
        payload.put_slice(config.access_unit_delimiter());
        if random_access {
            config.write_parameter_sets(&mut payload);
        }
        length_prefixed_to_annex_b(unit, config.nal_length_size(), &mut payload)?;

        let pts = ticks(pts);
        let dts = dts.map(ticks).filter(|dts| *dts != pts);
        Ok(Self {
            stream_id: VIDEO_STREAM_ID,
            pts,
            dts,
            payload: payload.freeze(),
        })
    }

    /// Serialize header and payload.
    ///
    /// Video units leave `PES_packet_length` at 0 (unbounded); audio units
    /// carry their length unless it overflows 16 bits.
    pub fn encode(&self) -> Bytes {
        let header_data_len = TIMESTAMP_LEN * if self.dts.is_some() { 2 } else { 1 };
        let mut out = BytesMut::with_capacity(FIXED_HEADER_LEN + header_data_len + self.payload.len());

        out.put_slice(&[0x00, 0x00, 0x01, self.stream_id]);
        let length = 3 + header_data_len + self.payload.len();
        let length = if self.stream_id == VIDEO_STREAM_ID || length > u16::MAX as usize {
            0
        } else {
            length as u16
        };
        out.put_u16(length);
        out.put_u8(0x84); // marker bits, data_alignment_indicator
        match self.dts {
            Some(dts) => {
                out.put_u8(0xC0);
                out.put_u8(header_data_len as u8);
                put_timestamp(&mut out, 0x3, self.pts);
                put_timestamp(&mut out, 0x1, dts);
            }
            None => {
                out.put_u8(0x80);
                out.put_u8(header_data_len as u8);
                put_timestamp(&mut out, 0x2, self.pts);
            }
        }
        out.put_slice(&self.payload);
        out.freeze()
    }
}

fn put_timestamp(out: &mut BytesMut, prefix: u8, ts: u64) {
    out.put_u8((prefix << 4) | (((ts >> 29) & 0x0E) as u8) | 1);
    out.put_u8((ts >> 22) as u8);
    out.put_u8((((ts >> 14) & 0xFE) as u8) | 1);
    out.put_u8((ts >> 7) as u8);
    out.put_u8((((ts << 1) & 0xFE) as u8) | 1);
}

/// Decode a 5-byte PTS/DTS field.
pub fn read_timestamp(field: &[u8]) -> u64 {
    (((field[0] as u64) >> 1) & 0x07) << 30
        | (field[1] as u64) << 22
        | ((field[2] as u64) >> 1) << 15
        | (field[3] as u64) << 7
        | (field[4] as u64) >> 1
}
