//! Live video uplink: MPEG-TS muxing with RTMP and SRT transports.
//!
//! - [`mpegts`] packages encoded audio/video access units into a transport
//!   stream cut into network fragments.
//! - [`rtmp`] runs the RTMP handshake and byte transport to an ingest server.
//! - [`srt`] couples the muxer to an SRT sender.
//!
//! Encoders feed any of them through [`MediaSink`].

pub mod error;
pub mod media;
pub mod mpegts;
pub mod rtmp;
pub mod srt;

pub use error::{Error, Result};
pub use media::{AudioFormat, FourCc, MediaSink, VideoFormat};
pub use mpegts::{FragmentSink, TsMuxer};
pub use rtmp::{ReadyState, RtmpSocket, RtmpSocketListener, SocketConfig};
pub use srt::{PublishUrl, SrtConfig, SrtSender, SrtStream, SrtStreamListener, StreamId};
