//! MPEG-2 transport stream muxing (ISO/IEC 13818-1).
//!
//! The stream carries a single program with one video and one audio
//! elementary stream at fixed PIDs:
//!
//! | PID | Content |
//! |-----|---------|
//! | 0 | PAT |
//! | 4095 | PMT |
//! | 256 | Video PES (H.264 / H.265) |
//! | 257 | Audio PES (AAC / Opus), also the PCR PID |
//!
//! [`TsMuxer`] turns access units into 188-byte packets and hands packet runs
//! to the [`Interleaver`], which cuts them into network fragments for a
//! [`FragmentSink`].

pub mod interleave;
pub mod muxer;
pub mod packet;
pub mod pes;
pub mod psi;

use std::time::Duration;

pub use interleave::{FRAGMENT_SIZE, FragmentSink, Interleaver};
pub use muxer::TsMuxer;
pub use packet::{PACKET_SIZE, PacketHeader, TsPacket};
pub use pes::Pes;
pub use psi::{ProgramAssociation, ProgramMapping, StreamType};

pub const PAT_PID: u16 = 0;
pub const PMT_PID: u16 = 4095;
pub const VIDEO_PID: u16 = 256;
pub const AUDIO_PID: u16 = 257;

/// Maximum presentation time between PAT/PMT emissions.
pub const SEGMENT_DURATION: Duration = Duration::from_secs(2);

/// Minimum presentation time between injected PCRs.
pub const PCR_INTERVAL: Duration = Duration::from_millis(20);
