//! RTMP client transport: handshake, chunk splitting and the socket.
//!
//! Only the layer below RTMP messages lives here. The socket runs the
//! three-phase handshake, counts bytes, enforces a connect timeout and
//! hands every post-handshake byte to an [`RtmpSocketListener`], which
//! owns message framing.
//!
//! ```text
//! client                               server
//!   │ ── C0+C1 (1 + 1536) ─────────────▶ │   Uninitialized → VersionSent
//!   │ ◀──────────── S0+S1 (1 + 1536) ── │
//!   │ ── C2 (1536) ────────────────────▶ │   VersionSent → AckSent
//!   │ ◀──────────────────── S2 (1536) ── │   AckSent → HandshakeDone
//!   │ ◀═══════════ chunk stream ══════▶ │
//! ```

pub mod chunk;
pub mod handshake;
pub mod socket;

use std::fmt;

use crate::error::{Error, Result};

pub use chunk::{Chunk, DEFAULT_CHUNK_SIZE, Message};
pub use socket::{Connector, RtmpSocket, RtmpSocketListener, SocketConfig, TcpConnector};

/// Connection state of an [`RtmpSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadyState {
    Uninitialized,
    /// C0+C1 written, waiting for S0+S1.
    VersionSent,
    /// C2 written, waiting for S2.
    AckSent,
    HandshakeDone,
    Closed,
}

impl ReadyState {
    /// Validate a move from `self` to `to`.
    ///
    /// The handshake states only advance one step at a time. Any state may
    /// be reset to `Uninitialized` by a new connect, and any state other
    /// than `Closed` may close.
    pub fn transition(self, to: ReadyState) -> Result<ReadyState> {
        use ReadyState::*;
        let valid = match (self, to) {
            (_, Uninitialized) => true,
            (Closed, Closed) => false,
            (_, Closed) => true,
            (Uninitialized, VersionSent) | (VersionSent, AckSent) | (AckSent, HandshakeDone) => {
                true
            }
            _ => false,
        };
        if valid {
            Ok(to)
        } else {
            Err(Error::InvalidTransition { from: self, to })
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::VersionSent => "version-sent",
            Self::AckSent => "ack-sent",
            Self::HandshakeDone => "handshake-done",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Status raised when a connection attempt ends without `close()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// The link dropped after the handshake completed.
    ConnectClosed,
    /// The link never completed the handshake.
    ConnectFailed,
}

impl ConnectionStatus {
    /// NetConnection status code as reported to RTMP clients.
    pub fn code(self) -> &'static str {
        match self {
            Self::ConnectClosed => "NetConnection.Connect.Closed",
            Self::ConnectFailed => "NetConnection.Connect.Failed",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReadyState::*;

    #[test]
    fn handshake_sequence_is_valid() {
        let mut state = Uninitialized;
        for next in [VersionSent, AckSent, HandshakeDone, Closed] {
            state = state.transition(next).unwrap();
        }
        assert_eq!(state, Closed);
    }

    #[test]
    fn skipping_a_step_is_rejected() {
        assert!(matches!(
            Uninitialized.transition(AckSent),
            Err(Error::InvalidTransition {
                from: Uninitialized,
                to: AckSent
            })
        ));
        assert!(VersionSent.transition(HandshakeDone).is_err());
        assert!(HandshakeDone.transition(VersionSent).is_err());
    }

    #[test]
    fn closed_only_leaves_through_reset() {
        assert!(Closed.transition(Closed).is_err());
        assert!(Closed.transition(VersionSent).is_err());
        assert_eq!(Closed.transition(Uninitialized).unwrap(), Uninitialized);
    }

    #[test]
    fn status_codes() {
        assert_eq!(ConnectionStatus::ConnectClosed.code(), "NetConnection.Connect.Closed");
        assert_eq!(
            ConnectionStatus::ConnectFailed.to_string(),
            "NetConnection.Connect.Failed"
        );
    }
}
