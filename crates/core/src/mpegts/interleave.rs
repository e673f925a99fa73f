//! Network fragmenting and audio/video interleaving.
//!
//! The muxer's packet runs are cut into network fragments of a fixed size
//! (1316 bytes by default, seven transport packets). Video runs are large
//! and audio runs small, so sending each run on its own would produce many
//! short audio fragments. Instead the latest video run is held in a
//! two-slot ring and drained into the front of fragments that carry audio:
//!
//! ```text
//! video run V ─► [slot 0: V ▕cursor▏      ] [slot 1: empty]
//! audio run A ─► fragment = V[cursor..cursor+room] ++ A
//! next video W ─► rest of V flushed, W takes the other slot
//! ```
//!
//! Bytes are never reordered within either stream, and at most one video
//! run is in flight.

use bytes::{BufMut, Bytes, BytesMut};

/// Default network fragment size: 7 × 188.
pub const FRAGMENT_SIZE: usize = 1316;

/// Receiver of network fragments.
///
/// The sink is owned by the muxer for its whole lifetime.
pub trait FragmentSink: Send + 'static {
    fn write_fragment(&mut self, fragment: Bytes);
}

impl FragmentSink for Vec<Bytes> {
    fn write_fragment(&mut self, fragment: Bytes) {
        self.push(fragment);
    }
}

/// Two-slot video ring plus the fragmenting logic.
#[derive(Debug)]
pub struct Interleaver {
    slots: [Option<Bytes>; 2],
    /// Index of the slot currently being drained.
    draining: usize,
    /// Bytes of the draining slot already written.
    cursor: usize,
    fragment_size: usize,
}

impl Interleaver {
    pub fn new(fragment_size: usize) -> Self {
        assert!(fragment_size > 0, "fragment size must be positive");
        Self {
            slots: [None, None],
            draining: 0,
            cursor: 0,
            fragment_size,
        }
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// Video bytes held back and not yet written.
    pub fn pending_video(&self) -> usize {
        self.slots[self.draining]
            .as_ref()
            .map_or(0, |video| video.len() - self.cursor)
    }

    /// Write `data` straight through, cut at fragment boundaries.
    pub fn write_through<S: FragmentSink>(&self, data: &Bytes, sink: &mut S) {
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + self.fragment_size).min(data.len());
            sink.write_fragment(data.slice(offset..end));
            offset = end;
        }
    }

    /// Accept a new video run. The remainder of the in-flight run is
    /// flushed first and the new run becomes the one being drained.
    pub fn write_video<S: FragmentSink>(&mut self, data: Bytes, sink: &mut S) {
        let incoming = 1 - self.draining;
        self.slots[incoming] = Some(data);
        if let Some(previous) = self.slots[self.draining].take() {
            self.write_through(&previous.slice(self.cursor..), sink);
        }
        self.draining = incoming;
        self.cursor = 0;
    }

    /// Write an audio run, front-padding each fragment with in-flight video.
    pub fn write_audio<S: FragmentSink>(&mut self, data: Bytes, sink: &mut S) {
        let Some(video) = self.slots[self.draining].clone() else {
            self.write_through(&data, sink);
            return;
        };

        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + self.fragment_size).min(data.len());
            let audio = data.slice(offset..end);
            let room = self.fragment_size - audio.len();
            let video_end = (self.cursor + room).min(video.len());
            if video_end > self.cursor {
                let mut fragment = BytesMut::with_capacity(video_end - self.cursor + audio.len());
                fragment.put_slice(&video[self.cursor..video_end]);
                fragment.put_slice(&audio);
                self.cursor = video_end;
                sink.write_fragment(fragment.freeze());
            } else {
                sink.write_fragment(audio);
            }
            offset = end;
        }

        if self.cursor == video.len() {
            self.slots[self.draining] = None;
            self.cursor = 0;
        }
    }

    /// Drop any held video without writing it.
    pub fn clear(&mut self) {
        self.slots = [None, None];
        self.draining = 0;
        self.cursor = 0;
    }
}

impl Default for Interleaver {
    fn default() -> Self {
        Self::new(FRAGMENT_SIZE)
    }
}
