//! H.265 (HEVC) decoder configuration — ISO/IEC 14496-15 §8.3.3.1.
//!
//! Key differences from H.264:
//!
//! - **2-byte NAL unit header**; the NAL type sits in bits 1..6 of the
//!   first byte.
//! - **Three parameter set kinds**: VPS (32), SPS (33), PPS (34), grouped
//!   into typed arrays inside `hvcC` after a fixed 22-byte header.

use bytes::{Bytes, BytesMut};

use super::h264::read_nal_list;
use super::{put_annex_b, take};
use crate::error::{ConfigErrorKind, Error, Result};

/// Access unit delimiter NAL (type 35, `pic_type` = 2) with start code.
pub const ACCESS_UNIT_DELIMITER: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x46, 0x01, 0x50];

const NAL_VPS: u8 = 32;
const NAL_SPS: u8 = 33;
const NAL_PPS: u8 = 34;

const FIXED_HEADER_LEN: usize = 22;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HevcConfig {
    pub nal_length_size: usize,
    pub vps: Vec<Bytes>,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl HevcConfig {
    pub fn parse(record: &[u8]) -> Result<Self> {
        let truncated = || invalid(ConfigErrorKind::Truncated);
        let mut buf = record;

        let header = take(&mut buf, FIXED_HEADER_LEN).ok_or_else(truncated)?;
        if header[0] != 1 {
            return Err(invalid(ConfigErrorKind::UnknownVersion(header[0])));
        }
        let nal_length_size = (header[21] & 0x03) as usize + 1;

        let array_count = take(&mut buf, 1).ok_or_else(truncated)?[0];
        let mut config = Self {
            nal_length_size,
            vps: Vec::new(),
            sps: Vec::new(),
            pps: Vec::new(),
        };

        for _ in 0..array_count {
            let head = take(&mut buf, 3).ok_or_else(truncated)?;
            let nal_type = head[0] & 0x3F;
            let count = u16::from_be_bytes([head[1], head[2]]) as usize;
            let nals = read_nal_list(&mut buf, count).ok_or_else(truncated)?;
            match nal_type {
                NAL_VPS => config.vps.extend(nals),
                NAL_SPS => config.sps.extend(nals),
                NAL_PPS => config.pps.extend(nals),
                // SEI arrays and the like are not repeated in-band.
                _ => tracing::trace!(nal_type, "skipping hvcC array"),
            }
        }

        if config.sps.is_empty() {
            return Err(invalid(ConfigErrorKind::MissingSps));
        }
        if config.pps.is_empty() {
            return Err(invalid(ConfigErrorKind::MissingPps));
        }

        tracing::debug!(
            nal_length_size,
            vps = config.vps.len(),
            sps = config.sps.len(),
            pps = config.pps.len(),
            "parsed hvcC"
        );

        Ok(config)
    }

    /// VPS, SPS, then PPS, each with a start code.
    pub fn write_parameter_sets(&self, out: &mut BytesMut) {
        for nal in self.vps.iter().chain(&self.sps).chain(&self.pps) {
            put_annex_b(out, nal);
        }
    }
}

fn invalid(kind: ConfigErrorKind) -> Error {
    Error::InvalidDecoderConfig { codec: "hvcC", kind }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const VPS: &[u8] = &[0x40, 0x01, 0x0C, 0x01];
    pub const SPS: &[u8] = &[0x42, 0x01, 0x01, 0x01, 0x60];
    pub const PPS: &[u8] = &[0x44, 0x01, 0xC1, 0x72];

    fn array(nal_type: u8, nal: &[u8]) -> Vec<u8> {
        let mut out = vec![0x80 | nal_type, 0, 1];
        out.extend_from_slice(&(nal.len() as u16).to_be_bytes());
        out.extend_from_slice(nal);
        out
    }

    pub fn hvcc_record() -> Vec<u8> {
        let mut record = vec![0u8; FIXED_HEADER_LEN];
        record[0] = 1;
        record[21] = 0x0F;
        record.push(3);
        record.extend(array(NAL_VPS, VPS));
        record.extend(array(NAL_SPS, SPS));
        record.extend(array(NAL_PPS, PPS));
        record
    }

    #[test]
    fn parse_record() {
        let config = HevcConfig::parse(&hvcc_record()).unwrap();
        assert_eq!(config.nal_length_size, 4);
        assert_eq!(config.vps, vec![Bytes::from_static(VPS)]);
        assert_eq!(config.sps, vec![Bytes::from_static(SPS)]);
        assert_eq!(config.pps, vec![Bytes::from_static(PPS)]);
    }

    #[test]
    fn parameter_set_order() {
        let config = HevcConfig::parse(&hvcc_record()).unwrap();
        let mut out = BytesMut::new();
        config.write_parameter_sets(&mut out);
        let expected = [&[0, 0, 0, 1][..], VPS, &[0, 0, 0, 1], SPS, &[0, 0, 0, 1], PPS].concat();
        assert_eq!(&out[..], &expected[..]);
    }

    #[test]
    fn short_header_rejected() {
        assert!(matches!(
            HevcConfig::parse(&[1, 2, 3]),
            Err(Error::InvalidDecoderConfig {
                kind: ConfigErrorKind::Truncated,
                ..
            })
        ));
    }

    #[test]
    fn missing_sps() {
        let mut record = vec![0u8; FIXED_HEADER_LEN];
        record[0] = 1;
        record.push(1);
        record.extend(array(NAL_PPS, PPS));
        assert!(matches!(
            HevcConfig::parse(&record),
            Err(Error::InvalidDecoderConfig {
                kind: ConfigErrorKind::MissingSps,
                ..
            })
        ));
    }
}
