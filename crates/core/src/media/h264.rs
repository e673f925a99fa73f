use bytes::{Bytes, BytesMut};

use super::{put_annex_b, take};
use crate::error::{ConfigErrorKind, Error, Result};

/// Access unit delimiter NAL (type 9, `primary_pic_type` = any) with start code.
pub const ACCESS_UNIT_DELIMITER: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x09, 0xF0];

/// H.264 parameter sets extracted from an `avcC` record (ISO/IEC 14496-15 §5.3.3.1).
///
/// ```text
/// configurationVersion          (1 byte, = 1)
/// AVCProfileIndication          (1 byte)
/// profile_compatibility         (1 byte)
/// AVCLevelIndication            (1 byte)
/// 111111 | lengthSizeMinusOne   (1 byte)
/// 111    | numOfSPS             (1 byte)
///   { u16 length, SPS NAL }*
/// numOfPPS                      (1 byte)
///   { u16 length, PPS NAL }*
/// ```
///
/// Any trailing high-profile extension bytes are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcConfig {
    pub profile: u8,
    pub level: u8,
    /// Size of the NAL length prefix in access units (1, 2 or 4).
    pub nal_length_size: usize,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvcConfig {
    pub fn parse(record: &[u8]) -> Result<Self> {
        let truncated = || invalid(ConfigErrorKind::Truncated);
        let mut buf = record;

        let header = take(&mut buf, 6).ok_or_else(truncated)?;
        if header[0] != 1 {
            return Err(invalid(ConfigErrorKind::UnknownVersion(header[0])));
        }
        let profile = header[1];
        let level = header[3];
        let nal_length_size = (header[4] & 0x03) as usize + 1;

        let sps_count = (header[5] & 0x1F) as usize;
        let sps = read_nal_list(&mut buf, sps_count).ok_or_else(truncated)?;

        let pps_count = take(&mut buf, 1).ok_or_else(truncated)?[0] as usize;
        let pps = read_nal_list(&mut buf, pps_count).ok_or_else(truncated)?;

        if sps.is_empty() {
            return Err(invalid(ConfigErrorKind::MissingSps));
        }
        if pps.is_empty() {
            return Err(invalid(ConfigErrorKind::MissingPps));
        }

        tracing::debug!(
            profile,
            level,
            nal_length_size,
            sps = sps.len(),
            pps = pps.len(),
            "parsed avcC"
        );

        Ok(Self {
            profile,
            level,
            nal_length_size,
            sps,
            pps,
        })
    }

    /// SPS then PPS, each with a start code.
    pub fn write_parameter_sets(&self, out: &mut BytesMut) {
        for nal in self.sps.iter().chain(&self.pps) {
            put_annex_b(out, nal);
        }
    }
}

/// Read `count` entries of `{ u16 length, bytes }`.
pub(crate) fn read_nal_list(buf: &mut &[u8], count: usize) -> Option<Vec<Bytes>> {
    let mut nals = Vec::with_capacity(count);
    for _ in 0..count {
        let len = take(buf, 2)?;
        let len = u16::from_be_bytes([len[0], len[1]]) as usize;
        nals.push(Bytes::copy_from_slice(take(buf, len)?));
    }
    Some(nals)
}

fn invalid(kind: ConfigErrorKind) -> Error {
    Error::InvalidDecoderConfig { codec: "avcC", kind }
}
