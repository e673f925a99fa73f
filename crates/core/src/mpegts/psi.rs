//! Program Specific Information: PAT and PMT sections.
//!
//! Both tables use the long section syntax:
//!
//! ```text
//! table_id(8)  section_syntax_indicator(1)=1 '0' reserved(2)  section_length(12)
//! table_id_extension(16)
//! reserved(2) version_number(5) current_next_indicator(1)
//! section_number(8)  last_section_number(8)
//! ... table body ...
//! CRC_32(32)
//! ```

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use super::PMT_PID;
use super::packet::TsPacket;

const TABLE_ID_PAT: u8 = 0x00;
const TABLE_ID_PMT: u8 = 0x02;
const TRANSPORT_STREAM_ID: u16 = 1;
const PROGRAM_NUMBER: u16 = 1;

/// CRC-32 polynomial used in MPEG-TS (ISO/IEC 13818-1 Annex A).
const CRC32_POLY: u32 = 0x04C1_1DB7;

static CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut j = 0;
        while j < 8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ CRC32_POLY;
            } else {
                crc <<= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// CRC-32/MPEG-2 over a PSI section.
pub fn crc32(data: &[u8]) -> u32 {
    data.iter().fold(0xFFFF_FFFF, |crc, &byte| {
        (crc << 8) ^ CRC32_TABLE[((crc >> 24) ^ byte as u32) as usize]
    })
}

/// Elementary stream types written into the PMT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamType {
    /// Private PES data; Opus with a registration descriptor.
    PrivateData = 0x06,
    AdtsAac = 0x0F,
    H264 = 0x1B,
    H265 = 0x24,
}

/// One PMT entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementaryStream {
    pub stream_type: StreamType,
    pub pid: u16,
    pub descriptors: Bytes,
}

/// Program Association Table: program number to PMT PID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramAssociation {
    pub programs: BTreeMap<u16, u16>,
}

impl Default for ProgramAssociation {
    /// A single program mapped to [`PMT_PID`].
    fn default() -> Self {
        Self {
            programs: BTreeMap::from([(PROGRAM_NUMBER, PMT_PID)]),
        }
    }
}

impl ProgramAssociation {
    pub fn section(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(self.programs.len() * 4);
        for (&number, &pid) in &self.programs {
            body.put_u16(number);
            body.put_u16(0xE000 | pid);
        }
        section(TABLE_ID_PAT, TRANSPORT_STREAM_ID, &body)
    }

    pub fn packet(&self, pid: u16) -> TsPacket {
        psi_packet(pid, &self.section())
    }
}

/// Program Map Table for the single program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramMapping {
    pub pcr_pid: u16,
    pub streams: Vec<ElementaryStream>,
}

impl Default for ProgramMapping {
    fn default() -> Self {
        Self {
            pcr_pid: 0x1FFF,
            streams: Vec::new(),
        }
    }
}

impl ProgramMapping {
    /// Insert a stream, replacing any existing entry for the same PID in place.
    pub fn upsert(&mut self, stream: ElementaryStream) {
        match self.streams.iter_mut().find(|s| s.pid == stream.pid) {
            Some(existing) => *existing = stream,
            None => self.streams.push(stream),
        }
    }

    pub fn section(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(4 + self.streams.len() * 5);
        body.put_u16(0xE000 | self.pcr_pid);
        body.put_u16(0xF000); // program_info_length = 0
        for stream in &self.streams {
            body.put_u8(stream.stream_type as u8);
            body.put_u16(0xE000 | stream.pid);
            body.put_u16(0xF000 | stream.descriptors.len() as u16);
            body.put_slice(&stream.descriptors);
        }
        section(TABLE_ID_PMT, PROGRAM_NUMBER, &body)
    }

    pub fn packet(&self, pid: u16) -> TsPacket {
        psi_packet(pid, &self.section())
    }
}

fn section(table_id: u8, extension: u16, body: &[u8]) -> Bytes {
    // extension + version + section numbers + body + CRC
    let length = 5 + body.len() + 4;
    let mut out = BytesMut::with_capacity(3 + length);
    out.put_u8(table_id);
    out.put_u16(0xB000 | length as u16);
    out.put_u16(extension);
    out.put_u8(0xC1); // version 0, current
    out.put_u8(0);
    out.put_u8(0);
    out.put_slice(body);
    let crc = crc32(&out);
    out.put_u32(crc);
    out.freeze()
}

fn psi_packet(pid: u16, section: &[u8]) -> TsPacket {
    let mut payload = BytesMut::with_capacity(1 + section.len());
    payload.put_u8(0); // pointer_field
    payload.put_slice(section);
    TsPacket {
        pid,
        payload_unit_start: true,
        continuity_counter: 0,
        adaptation: None,
        payload: payload.freeze(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpegts::{AUDIO_PID, VIDEO_PID};

    #[test]
    fn crc_check_value() {
        assert_eq!(crc32(b"123456789"), 0x0376_E6E7);
    }

    #[test]
    fn section_crc_verifies_to_zero() {
        // Running the CRC over a section including its own CRC yields 0.
        let pat = ProgramAssociation::default().section();
        assert_eq!(crc32(&pat), 0);
    }

    #[test]
    fn default_pat_maps_one_program() {
        let pat = ProgramAssociation::default().section();
        assert_eq!(pat[0], TABLE_ID_PAT);
        let length = (((pat[1] & 0x0F) as usize) << 8) | pat[2] as usize;
        assert_eq!(length, pat.len() - 3);
        assert_eq!(&pat[8..10], &[0x00, 0x01]);
        let pid = (((pat[10] & 0x1F) as u16) << 8) | pat[11] as u16;
        assert_eq!(pid, PMT_PID);
    }

    #[test]
    fn pmt_lists_streams() {
        let mut pmt = ProgramMapping {
            pcr_pid: AUDIO_PID,
            ..Default::default()
        };
        pmt.upsert(ElementaryStream {
            stream_type: StreamType::H264,
            pid: VIDEO_PID,
            descriptors: Bytes::new(),
        });
        pmt.upsert(ElementaryStream {
            stream_type: StreamType::AdtsAac,
            pid: AUDIO_PID,
            descriptors: Bytes::new(),
        });
        let section = pmt.section();
        assert_eq!(section[0], TABLE_ID_PMT);
        let pcr = (((section[8] & 0x1F) as u16) << 8) | section[9] as u16;
        assert_eq!(pcr, AUDIO_PID);
        assert_eq!(section[12], StreamType::H264 as u8);
        assert_eq!(section[17], StreamType::AdtsAac as u8);
        assert_eq!(crc32(&section), 0);
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut pmt = ProgramMapping::default();
        for stream_type in [StreamType::H264, StreamType::AdtsAac] {
            pmt.upsert(ElementaryStream {
                stream_type,
                pid: if stream_type == StreamType::H264 { VIDEO_PID } else { AUDIO_PID },
                descriptors: Bytes::new(),
            });
        }
        pmt.upsert(ElementaryStream {
            stream_type: StreamType::H265,
            pid: VIDEO_PID,
            descriptors: Bytes::new(),
        });
        assert_eq!(pmt.streams.len(), 2);
        assert_eq!(pmt.streams[0].stream_type, StreamType::H265);
        assert_eq!(pmt.streams[0].pid, VIDEO_PID);
    }

    #[test]
    fn psi_packet_layout() {
        let packet = ProgramAssociation::default().packet(0);
        assert!(packet.payload_unit_start);
        assert!(packet.adaptation.is_none());
        assert_eq!(packet.payload[0], 0);
    }
}
