//! Error types for the livepush library.

use std::fmt;

use crate::media::FourCc;
use crate::rtmp::ReadyState;

/// Errors that can occur in the livepush library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Formats**: [`UnsupportedAudioCodec`](Self::UnsupportedAudioCodec),
///   [`UnsupportedVideoCodec`](Self::UnsupportedVideoCodec),
///   [`UnsupportedSampleRate`](Self::UnsupportedSampleRate),
///   [`InvalidDecoderConfig`](Self::InvalidDecoderConfig).
/// - **Muxing**: [`MalformedAccessUnit`](Self::MalformedAccessUnit).
/// - **RTMP**: [`HandshakeTooShort`](Self::HandshakeTooShort),
///   [`InvalidChunkStreamId`](Self::InvalidChunkStreamId),
///   [`InvalidTransition`](Self::InvalidTransition),
///   [`SocketGone`](Self::SocketGone).
/// - **SRT**: [`InvalidStreamId`](Self::InvalidStreamId),
///   [`InvalidUrl`](Self::InvalidUrl), [`Url`](Self::Url).
/// - **Transport**: [`Io`](Self::Io).
///
/// None of these cross a component boundary at runtime: the muxer logs and
/// drops, the socket reports through its listener.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The audio encoder reported a codec the muxer cannot carry.
    #[error("unsupported audio codec: {0}")]
    UnsupportedAudioCodec(FourCc),

    /// The video encoder reported a codec the muxer cannot carry.
    #[error("unsupported video codec: {0}")]
    UnsupportedVideoCodec(FourCc),

    /// AAC sample rate outside the ADTS sampling frequency table.
    #[error("unsupported AAC sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    /// An `avcC` / `hvcC` decoder configuration record failed to parse.
    #[error("invalid {codec} decoder configuration: {kind}")]
    InvalidDecoderConfig {
        codec: &'static str,
        kind: ConfigErrorKind,
    },

    /// A length-prefixed NAL unit overran the access unit.
    #[error("malformed access unit: NAL length {length} at offset {offset} exceeds {available} bytes")]
    MalformedAccessUnit {
        offset: usize,
        length: usize,
        available: usize,
    },

    /// Not enough inbound bytes to derive the handshake response.
    #[error("handshake input too short: need {needed} bytes, got {got}")]
    HandshakeTooShort { needed: usize, got: usize },

    /// Chunk stream ids 0 and 1 are reserved; 65599 is the largest encodable.
    #[error("invalid chunk stream id: {0}")]
    InvalidChunkStreamId(u32),

    /// The socket state machine refused a transition.
    #[error("invalid ready state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: ReadyState, to: ReadyState },

    /// The socket's actor task has exited.
    #[error("socket task is no longer running")]
    SocketGone,

    /// Stream identifiers are restricted to ASCII alphanumerics.
    #[error("invalid stream id: {0:?}")]
    InvalidStreamId(String),

    /// A publish URL parsed but is not usable.
    #[error("invalid publish URL: {0}")]
    InvalidUrl(&'static str),

    /// A publish URL failed to parse.
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

/// Specific kind of decoder configuration failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// Record ended before a mandatory field.
    Truncated,
    /// `configurationVersion` was not 1.
    UnknownVersion(u8),
    /// No sequence parameter set was present.
    MissingSps,
    /// No picture parameter set was present.
    MissingPps,
}

impl fmt::Display for ConfigErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated record"),
            Self::UnknownVersion(v) => write!(f, "unknown configuration version {v}"),
            Self::MissingSps => write!(f, "no SPS"),
            Self::MissingPps => write!(f, "no PPS"),
        }
    }
}

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
