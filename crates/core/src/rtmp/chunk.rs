//! Outbound RTMP chunking.
//!
//! A message is written as one format-0 chunk followed by as many format-3
//! continuation chunks as the peer's maximum chunk size requires:
//!
//! ```text
//! fmt(2) csid(6)            [csid-64 (8) | csid-64 (16 LE)]
//! timestamp(24) length(24) type_id(8) stream_id(32 LE)   -- format 0 only
//! [extended timestamp(32)]                               -- timestamp >= 0xFFFFFF
//! payload (up to chunk size)
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Chunk size both directions start with.
pub const DEFAULT_CHUNK_SIZE: usize = 128;

const EXTENDED_TIMESTAMP: u32 = 0xFF_FFFF;
const MIN_CHUNK_STREAM_ID: u32 = 2;
const MAX_CHUNK_STREAM_ID: u32 = 65599;

/// One RTMP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub type_id: u8,
    pub stream_id: u32,
    pub timestamp: u32,
    pub payload: Bytes,
}

impl Message {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A message bound to a chunk stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    chunk_stream_id: u32,
    pub message: Message,
}

impl Chunk {
    pub fn new(chunk_stream_id: u32, message: Message) -> Result<Self> {
        if !(MIN_CHUNK_STREAM_ID..=MAX_CHUNK_STREAM_ID).contains(&chunk_stream_id) {
            return Err(Error::InvalidChunkStreamId(chunk_stream_id));
        }
        Ok(Self {
            chunk_stream_id,
            message,
        })
    }

    pub fn chunk_stream_id(&self) -> u32 {
        self.chunk_stream_id
    }

    /// Serialize into chunks carrying at most `max_size` payload bytes each.
    pub fn split(&self, max_size: usize) -> Vec<Bytes> {
        let max_size = max_size.max(1);
        let payload = &self.message.payload;
        let extended = self.message.timestamp >= EXTENDED_TIMESTAMP;
        let mut chunks = Vec::with_capacity(payload.len() / max_size + 1);

        let first_len = payload.len().min(max_size);
        let mut first = BytesMut::with_capacity(18 + first_len);
        self.put_basic_header(&mut first, 0);
        first.put_uint(self.message.timestamp.min(EXTENDED_TIMESTAMP) as u64, 3);
        first.put_uint(payload.len() as u64, 3);
        first.put_u8(self.message.type_id);
        first.put_u32_le(self.message.stream_id);
        if extended {
            first.put_u32(self.message.timestamp);
        }
        first.put_slice(&payload[..first_len]);
        chunks.push(first.freeze());

        let mut offset = first_len;
        while offset < payload.len() {
            let end = (offset + max_size).min(payload.len());
            let mut chunk = BytesMut::with_capacity(7 + end - offset);
            self.put_basic_header(&mut chunk, 3);
            if extended {
                chunk.put_u32(self.message.timestamp);
            }
            chunk.put_slice(&payload[offset..end]);
            chunks.push(chunk.freeze());
            offset = end;
        }
        chunks
    }

    fn put_basic_header(&self, out: &mut BytesMut, format: u8) {
        let fmt = format << 6;
        match self.chunk_stream_id {
            id @ 2..=63 => out.put_u8(fmt | id as u8),
            id @ 64..=319 => {
                out.put_u8(fmt);
                out.put_u8((id - 64) as u8);
            }
            id => {
                out.put_u8(fmt | 1);
                out.put_u16_le((id - 64) as u16);
            }
        }
    }
}
