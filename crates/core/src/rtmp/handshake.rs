//! Simple (unsigned) RTMP handshake packets.
//!
//! ```text
//! C0/S0: version(8)
//! C1/S1: time(32) zero(32) random(1528 bytes)
//! C2/S2: time(32) time2(32) random echo(1528 bytes)
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Size of C1/S1/C2/S2.
pub const SIGNATURE_SIZE: usize = 1536;

pub const PROTOCOL_VERSION: u8 = 3;

const TIME_FIELDS_SIZE: usize = 8;

/// C0+C1: version byte, zero timestamp, zero field, 1528 random bytes.
pub fn initial_packet() -> Bytes {
    let mut packet = BytesMut::with_capacity(1 + SIGNATURE_SIZE);
    packet.put_u8(PROTOCOL_VERSION);
    packet.put_u32(0);
    packet.put_u32(0);
    for _ in TIME_FIELDS_SIZE..SIGNATURE_SIZE {
        packet.put_u8(rand::random());
    }
    packet.freeze()
}

/// C2 derived from the server's S0+S1.
///
/// Echoes S1's timestamp and random block with a zero `time2`. Only the
/// first `1 + SIGNATURE_SIZE` bytes of `inbound` are looked at.
pub fn response_packet(inbound: &[u8]) -> Result<Bytes> {
    let needed = 1 + SIGNATURE_SIZE;
    if inbound.len() < needed {
        return Err(Error::HandshakeTooShort {
            needed,
            got: inbound.len(),
        });
    }
    let s1 = &inbound[1..needed];

    let mut packet = BytesMut::with_capacity(SIGNATURE_SIZE);
    packet.put_slice(&s1[..4]);
    packet.put_u32(0);
    packet.put_slice(&s1[TIME_FIELDS_SIZE..]);
    Ok(packet.freeze())
}
