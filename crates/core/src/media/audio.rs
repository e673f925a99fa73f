//! Audio configuration and per-frame headers.
//!
//! AAC frames travel in the transport stream behind a 7-byte ADTS header
//! (ISO/IEC 13818-7 §6.2, no CRC):
//!
//! ```text
//! syncword(12)=0xFFF  ID(1)  layer(2)  protection_absent(1)=1
//! profile(2)  sampling_frequency_index(4)  private(1)  channel_configuration(3)
//! original(1)  home(1)  copyright_id(2)  frame_length(13)
//! adts_buffer_fullness(11)=0x7FF  number_of_raw_data_blocks(2)=0
//! ```
//!
//! Opus frames are preceded by an `opus_control_header` (ETSI TS 102 366
//! Annex / Opus-in-TS): `0x7FE0` followed by the frame size written as a
//! run of `0xFF` bytes plus a final remainder byte.

use bytes::{BufMut, Bytes, BytesMut};

use super::{AudioFormat, FourCc};
use crate::error::{Error, Result};

/// ADTS sampling frequency table, indexed by `sampling_frequency_index`.
const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

pub const ADTS_HEADER_LEN: usize = 7;

/// Validated audio codec configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioConfig {
    Aac {
        /// ADTS profile (`object_type - 1`).
        profile: u8,
        frequency_index: u8,
        channels: u8,
    },
    Opus {
        channels: u8,
    },
}

impl AudioConfig {
    /// Validate an encoder format description.
    pub fn from_format(format: &AudioFormat) -> Result<Self> {
        match format.codec {
            FourCc::AAC => {
                let frequency_index = SAMPLE_RATES
                    .iter()
                    .position(|rate| *rate == format.sample_rate)
                    .ok_or(Error::UnsupportedSampleRate(format.sample_rate))?
                    as u8;
                Ok(Self::Aac {
                    profile: format.object_type.clamp(1, 4) - 1,
                    frequency_index,
                    channels: format.channels & 0x07,
                })
            }
            FourCc::OPUS => Ok(Self::Opus {
                channels: format.channels,
            }),
            other => Err(Error::UnsupportedAudioCodec(other)),
        }
    }

    /// Write the framing header for a frame of `frame_len` payload bytes.
    pub fn write_frame_header(&self, frame_len: usize, out: &mut BytesMut) {
        match *self {
            Self::Aac {
                profile,
                frequency_index,
                channels,
            } => {
                let length = frame_len + ADTS_HEADER_LEN;
                out.put_u8(0xFF);
                out.put_u8(0xF1);
                out.put_u8((profile << 6) | (frequency_index << 2) | (channels >> 2));
                out.put_u8(((channels & 0x03) << 6) | ((length >> 11) & 0x03) as u8);
                out.put_u8(((length >> 3) & 0xFF) as u8);
                out.put_u8((((length & 0x07) << 5) as u8) | 0x1F);
                out.put_u8(0xFC);
            }
            Self::Opus { .. } => {
                out.put_u8(0x7F);
                out.put_u8(0xE0);
                let mut remaining = frame_len;
                while remaining >= 0xFF {
                    out.put_u8(0xFF);
                    remaining -= 0xFF;
                }
                out.put_u8(remaining as u8);
            }
        }
    }

    /// PMT elementary stream descriptors for this codec.
    ///
    /// Opus is carried as private PES data and needs a registration
    /// descriptor (`Opus`) plus the DVB extension descriptor carrying the
    /// channel configuration.
    pub fn descriptors(&self) -> Bytes {
        match *self {
            Self::Aac { .. } => Bytes::new(),
            Self::Opus { channels } => Bytes::from(vec![
                0x05, 0x04, b'O', b'p', b'u', b's', 0x7F, 0x02, 0x80, channels,
            ]),
        }
    }

    pub fn codec_name(&self) -> &'static str {
        match self {
            Self::Aac { .. } => "AAC",
            Self::Opus { .. } => "Opus",
        }
    }
}
