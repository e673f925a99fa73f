//! Codec metadata and access-unit framing.
//!
//! Encoders are external collaborators. They hand the core two kinds of
//! input:
//!
//! - **Format descriptions** ([`AudioFormat`], [`VideoFormat`]) whenever a
//!   codec is (re)configured. These are validated into an [`AudioConfig`]
//!   or a [`VideoConfig`] before the muxer accepts them.
//! - **Access units**: one encoded audio frame, or one encoded video picture
//!   in length-prefixed (AVCC / HVCC) form.
//!
//! ## Supported codecs
//!
//! | Codec | FourCC | Module | Transport stream type |
//! |-------|--------|--------|-----------------------|
//! | H.264 | `avc1` | [`h264`] | 0x1B |
//! | H.265 | `hvc1`, `hev1` | [`h265`] | 0x24 |
//! | AAC | `mp4a` | [`audio`] | 0x0F (ADTS) |
//! | Opus | `Opus` | [`audio`] | 0x06 (private PES) |

pub mod audio;
pub mod h264;
pub mod h265;

use std::fmt;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub use audio::AudioConfig;
pub use h264::AvcConfig;
pub use h265::HevcConfig;

/// Four-character codec identifier, as reported by platform encoders.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const AAC: FourCc = FourCc(*b"mp4a");
    pub const OPUS: FourCc = FourCc(*b"Opus");
    pub const AVC: FourCc = FourCc(*b"avc1");
    pub const HEVC: FourCc = FourCc(*b"hvc1");
    pub const HEVC_INBAND: FourCc = FourCc(*b"hev1");
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            for b in self.0 {
                write!(f, "{}", b as char)?;
            }
            Ok(())
        } else {
            write!(f, "0x{:08X}", u32::from_be_bytes(self.0))
        }
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({self})")
    }
}

/// Audio encoder output format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    pub codec: FourCc,
    pub sample_rate: u32,
    pub channels: u8,
    /// MPEG-4 audio object type (2 = AAC-LC). Ignored for Opus.
    pub object_type: u8,
}

impl AudioFormat {
    /// AAC-LC with the given rate and channel count.
    pub fn aac(sample_rate: u32, channels: u8) -> Self {
        Self {
            codec: FourCc::AAC,
            sample_rate,
            channels,
            object_type: 2,
        }
    }

    pub fn opus(sample_rate: u32, channels: u8) -> Self {
        Self {
            codec: FourCc::OPUS,
            sample_rate,
            channels,
            object_type: 0,
        }
    }
}

/// Video encoder output format: codec plus its ISO BMFF decoder
/// configuration record (`avcC` for H.264, `hvcC` for H.265).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormat {
    pub codec: FourCc,
    pub decoder_config: Bytes,
}

/// Validated video codec configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoConfig {
    Avc(AvcConfig),
    Hevc(HevcConfig),
}

impl VideoConfig {
    /// Validate an encoder format description.
    pub fn from_format(format: &VideoFormat) -> Result<Self> {
        match format.codec {
            FourCc::AVC => Ok(Self::Avc(AvcConfig::parse(&format.decoder_config)?)),
            FourCc::HEVC | FourCc::HEVC_INBAND => {
                Ok(Self::Hevc(HevcConfig::parse(&format.decoder_config)?))
            }
            other => Err(Error::UnsupportedVideoCodec(other)),
        }
    }

    /// Bytes of each NAL length prefix in the encoder's access units.
    pub fn nal_length_size(&self) -> usize {
        match self {
            Self::Avc(avc) => avc.nal_length_size,
            Self::Hevc(hevc) => hevc.nal_length_size,
        }
    }

    /// Annex B access unit delimiter that opens every video PES payload.
    pub fn access_unit_delimiter(&self) -> &'static [u8] {
        match self {
            Self::Avc(_) => h264::ACCESS_UNIT_DELIMITER,
            Self::Hevc(_) => h265::ACCESS_UNIT_DELIMITER,
        }
    }

    /// Append every parameter set in Annex B form.
    pub fn write_parameter_sets(&self, out: &mut BytesMut) {
        match self {
            Self::Avc(avc) => avc.write_parameter_sets(out),
            Self::Hevc(hevc) => hevc.write_parameter_sets(out),
        }
    }

    pub fn codec_name(&self) -> &'static str {
        match self {
            Self::Avc(_) => "H264",
            Self::Hevc(_) => "H265",
        }
    }
}

/// Encoder-facing interface: anything that consumes encoded media.
///
/// Units that arrive before both formats are installed are expected and
/// may be discarded by the implementation.
pub trait MediaSink {
    /// Audio codec (re)configured.
    fn set_audio_format(&mut self, format: &AudioFormat);

    /// Video codec (re)configured.
    fn set_video_format(&mut self, format: &VideoFormat);

    /// One encoded audio frame (raw AAC or Opus, no framing).
    fn on_encoded_audio(&mut self, data: &[u8], pts: Duration);

    /// One encoded picture in length-prefixed NAL form.
    ///
    /// `dts` is only carried when it differs from `pts`.
    fn on_encoded_video(
        &mut self,
        data: &[u8],
        pts: Duration,
        dts: Option<Duration>,
        random_access: bool,
    );
}

pub(crate) const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Append `nal` preceded by a 4-byte start code.
pub(crate) fn put_annex_b(out: &mut BytesMut, nal: &[u8]) {
    out.put_slice(&START_CODE);
    out.put_slice(nal);
}

/// Convert a length-prefixed access unit to Annex B.
///
/// Each NAL unit is preceded by a big-endian length of `length_size`
/// bytes; the output replaces every prefix with a 4-byte start code.
pub fn length_prefixed_to_annex_b(
    data: &[u8],
    length_size: usize,
    out: &mut BytesMut,
) -> Result<()> {
    let mut offset = 0;
    while offset < data.len() {
        if offset + length_size > data.len() {
            return Err(Error::MalformedAccessUnit {
                offset,
                length: length_size,
                available: data.len() - offset,
            });
        }
        let length = data[offset..offset + length_size]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        offset += length_size;
        let available = data.len() - offset;
        if length > available {
            return Err(Error::MalformedAccessUnit {
                offset,
                length,
                available,
            });
        }
        put_annex_b(out, &data[offset..offset + length]);
        offset += length;
    }
    Ok(())
}

/// Read `n` bytes from the front of `buf`, failing when it is too short.
pub(crate) fn take<'a>(buf: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
    if buf.len() < n {
        return None;
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Some(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_display() {
        assert_eq!(FourCc::AAC.to_string(), "mp4a");
        assert_eq!(FourCc([0, 0, 0, 1]).to_string(), "0x00000001");
    }

    #[test]
    fn annex_b_conversion() {
        let data = [0, 0, 0, 2, 0x65, 0xAA, 0, 0, 0, 1, 0x41];
        let mut out = BytesMut::new();
        length_prefixed_to_annex_b(&data, 4, &mut out).unwrap();
        assert_eq!(&out[..], &[0, 0, 0, 1, 0x65, 0xAA, 0, 0, 0, 1, 0x41]);
    }

    #[test]
    fn annex_b_two_byte_lengths() {
        let data = [0, 1, 0x09, 0, 2, 0x65, 0x88];
        let mut out = BytesMut::new();
        length_prefixed_to_annex_b(&data, 2, &mut out).unwrap();
        assert_eq!(&out[..], &[0, 0, 0, 1, 0x09, 0, 0, 0, 1, 0x65, 0x88]);
    }

    #[test]
    fn annex_b_overrun_rejected() {
        let data = [0, 0, 0, 9, 0x65];
        let mut out = BytesMut::new();
        let err = length_prefixed_to_annex_b(&data, 4, &mut out).unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedAccessUnit {
                offset: 4,
                length: 9,
                available: 1
            }
        ));
    }

    #[test]
    fn unsupported_video_codec() {
        let format = VideoFormat {
            codec: FourCc(*b"vp09"),
            decoder_config: Bytes::new(),
        };
        assert!(matches!(
            VideoConfig::from_format(&format),
            Err(Error::UnsupportedVideoCodec(_))
        ));
    }
}
