use bytes::{BufMut, Bytes, BytesMut};

/// Size of one transport packet.
pub const PACKET_SIZE: usize = 188;

pub const SYNC_BYTE: u8 = 0x47;

const HEADER_SIZE: usize = 4;

/// Payload capacity of a packet without an adaptation field.
pub const MAX_PAYLOAD_SIZE: usize = PACKET_SIZE - HEADER_SIZE;

const PCR_SIZE: usize = 6;

/// Transport packet adaptation field (ISO/IEC 13818-1 §2.4.3.4).
///
/// `length` is the on-wire `adaptation_field_length`, i.e. everything after
/// the length byte. A length of 0 is a single stuffing byte with no flags;
/// anything larger carries the flags byte, the optional PCR and `0xFF`
/// stuffing up to `length`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdaptationField {
    pub random_access: bool,
    /// Program clock reference base in 90 kHz ticks; the extension is 0.
    pub pcr: Option<u64>,
    length: usize,
}

impl AdaptationField {
    /// Smallest field carrying the given flags.
    pub fn new(random_access: bool, pcr: Option<u64>) -> Self {
        Self {
            random_access,
            pcr,
            length: 1 + if pcr.is_some() { PCR_SIZE } else { 0 },
        }
    }

    /// Flag-less field occupying exactly `total` bytes (length byte included).
    pub fn stuffing(total: usize) -> Self {
        debug_assert!(total >= 1);
        Self {
            random_access: false,
            pcr: None,
            length: total - 1,
        }
    }

    /// Grow the field with stuffing so it occupies `total` bytes.
    pub fn pad_to(&mut self, total: usize) {
        debug_assert!(total > self.length);
        self.length = total - 1;
    }

    /// Bytes on the wire, length byte included.
    pub fn encoded_len(&self) -> usize {
        1 + self.length
    }

    fn encode_into(&self, out: &mut BytesMut) {
        out.put_u8(self.length as u8);
        if self.length == 0 {
            return;
        }
        let mut flags = 0u8;
        if self.random_access {
            flags |= 0x40;
        }
        if self.pcr.is_some() {
            flags |= 0x10;
        }
        out.put_u8(flags);
        let mut written = 1;
        if let Some(base) = self.pcr {
            out.put_u8((base >> 25) as u8);
            out.put_u8((base >> 17) as u8);
            out.put_u8((base >> 9) as u8);
            out.put_u8((base >> 1) as u8);
            // 6 reserved bits, 9-bit extension of zero.
            out.put_u8((((base & 1) as u8) << 7) | 0x7E);
            out.put_u8(0x00);
            written += PCR_SIZE;
        }
        out.put_bytes(0xFF, self.length - written);
    }
}

/// One 188-byte transport packet before serialization.
#[derive(Debug, Clone)]
pub struct TsPacket {
    pub pid: u16,
    pub payload_unit_start: bool,
    pub continuity_counter: u8,
    pub adaptation: Option<AdaptationField>,
    pub payload: Bytes,
}

impl TsPacket {
    /// Serialize exactly [`PACKET_SIZE`] bytes.
    ///
    /// Payloads shorter than the remaining space are followed by `0xFF`
    /// fill, which is how PSI sections are padded.
    pub fn encode_into(&self, out: &mut BytesMut) {
        let start = out.len();
        let control = match (&self.adaptation, self.payload.is_empty()) {
            (None, _) => 0x10,
            (Some(_), true) => 0x20,
            (Some(_), false) => 0x30,
        };
        out.put_u8(SYNC_BYTE);
        out.put_u8(((self.payload_unit_start as u8) << 6) | ((self.pid >> 8) as u8 & 0x1F));
        out.put_u8(self.pid as u8);
        out.put_u8(control | (self.continuity_counter & 0x0F));
        if let Some(adaptation) = &self.adaptation {
            adaptation.encode_into(out);
        }
        out.put_slice(&self.payload);
        let written = out.len() - start;
        debug_assert!(written <= PACKET_SIZE, "packet overflow: {written} bytes");
        out.put_bytes(0xFF, PACKET_SIZE - written);
    }
}

/// Split a PES unit into transport packets that exactly fill their payloads.
///
/// The first packet always carries an adaptation field so the
/// random-access flag and PCR have a home; the last packet is padded with
/// adaptation-field stuffing. Continuity counters are left at 0 for the
/// caller to assign.
pub fn packetize(pid: u16, pes: &Bytes, random_access: bool, pcr: Option<u64>) -> Vec<TsPacket> {
    let mut packets = Vec::with_capacity(pes.len() / MAX_PAYLOAD_SIZE + 1);

    let mut first = AdaptationField::new(random_access, pcr);
    let capacity = MAX_PAYLOAD_SIZE - first.encoded_len();
    let mut offset = capacity.min(pes.len());
    if offset < capacity {
        first.pad_to(MAX_PAYLOAD_SIZE - offset);
    }
    packets.push(TsPacket {
        pid,
        payload_unit_start: true,
        continuity_counter: 0,
        adaptation: Some(first),
        payload: pes.slice(..offset),
    });

    while offset < pes.len() {
        let remaining = pes.len() - offset;
        let (adaptation, take) = if remaining >= MAX_PAYLOAD_SIZE {
            (None, MAX_PAYLOAD_SIZE)
        } else {
            (
                Some(AdaptationField::stuffing(MAX_PAYLOAD_SIZE - remaining)),
                remaining,
            )
        };
        packets.push(TsPacket {
            pid,
            payload_unit_start: false,
            continuity_counter: 0,
            adaptation,
            payload: pes.slice(offset..offset + take),
        });
        offset += take;
    }

    packets
}

/// Read-only view of a serialized packet's header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub pid: u16,
    pub payload_unit_start: bool,
    pub continuity_counter: u8,
    pub random_access: bool,
    pub pcr: Option<u64>,
    /// Offset of the payload within the packet.
    pub payload_offset: usize,
}

impl PacketHeader {
    /// Parse the header of one packet. Returns `None` on a bad sync byte
    /// or a short slice.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < PACKET_SIZE || packet[0] != SYNC_BYTE {
            return None;
        }
        let pid = (((packet[1] & 0x1F) as u16) << 8) | packet[2] as u16;
        let control = (packet[3] >> 4) & 0x03;
        let mut header = Self {
            pid,
            payload_unit_start: packet[1] & 0x40 != 0,
            continuity_counter: packet[3] & 0x0F,
            random_access: false,
            pcr: None,
            payload_offset: HEADER_SIZE,
        };
        if control & 0x02 != 0 {
            let length = packet[4] as usize;
            header.payload_offset = HEADER_SIZE + 1 + length;
            if length > 0 {
                let flags = packet[5];
                header.random_access = flags & 0x40 != 0;
                if flags & 0x10 != 0 {
                    let p = &packet[6..12];
                    header.pcr = Some(
                        ((p[0] as u64) << 25)
                            | ((p[1] as u64) << 17)
                            | ((p[2] as u64) << 9)
                            | ((p[3] as u64) << 1)
                            | ((p[4] as u64) >> 7),
                    );
                }
            }
        }
        Some(header)
    }
}
