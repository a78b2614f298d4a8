//! Error Taxonomy
//!
//! Each module has its own `thiserror` enum. [`NetError`] wraps all of them
//! so session code can use `?` across layers, and [`NetError::kind`] maps
//! every failure onto one flat [`ErrorKind`] for logging and counters.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::core::buffer::BufferError;
use crate::game::clock::ClockError;
use crate::network::events::RelayError;
use crate::network::protocol::ProtocolError;
use crate::network::rewind::RewindError;
use crate::network::transport::TransportError;

/// Flat classification of every error the crate reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A buffer or message ended early.
    TruncatedBuffer,
    /// Game event type byte not recognised.
    UnknownEventType,
    /// Protocol or message type not recognised or not accepted.
    UnknownMessageType,
    /// Authoritative state too old to apply.
    StaleSnapshot,
    /// Pause while already paused.
    PrematurePause,
    /// Peer is gone.
    PeerDisconnected,
    /// Operation reserved for the server.
    NotAuthoritative,
    /// Bytes present but not valid.
    Decode,
    /// Bad configuration.
    Config,
    /// Operation not allowed in the current phase.
    InvalidPhase,
}

impl ErrorKind {
    /// Stable snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TruncatedBuffer => "truncated_buffer",
            ErrorKind::UnknownEventType => "unknown_event_type",
            ErrorKind::UnknownMessageType => "unknown_message_type",
            ErrorKind::StaleSnapshot => "stale_snapshot",
            ErrorKind::PrematurePause => "premature_pause",
            ErrorKind::PeerDisconnected => "peer_disconnected",
            ErrorKind::NotAuthoritative => "not_authoritative",
            ErrorKind::Decode => "decode",
            ErrorKind::Config => "config",
            ErrorKind::InvalidPhase => "invalid_phase",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any error raised by the crate.
#[derive(Debug, Error)]
pub enum NetError {
    /// State buffer decode.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// World clock.
    #[error(transparent)]
    Clock(#[from] ClockError),

    /// Rewind manager.
    #[error(transparent)]
    Rewind(#[from] RewindError),

    /// Game event relay.
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// Message envelope or payload.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Transport.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn buffer_kind(e: &BufferError) -> ErrorKind {
    match e {
        BufferError::Truncated { .. } => ErrorKind::TruncatedBuffer,
        BufferError::InvalidString | BufferError::InvalidValue { .. } => ErrorKind::Decode,
    }
}

impl NetError {
    /// Classify.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetError::Buffer(e) => buffer_kind(e),
            NetError::Clock(ClockError::PrematurePause { .. }) => ErrorKind::PrematurePause,
            NetError::Clock(ClockError::ModeLocked { .. }) => ErrorKind::InvalidPhase,
            NetError::Rewind(RewindError::StaleSnapshot { .. }) => ErrorKind::StaleSnapshot,
            NetError::Rewind(RewindError::Decode { .. }) => ErrorKind::Decode,
            NetError::Relay(e) => match e {
                RelayError::NotAuthoritative => ErrorKind::NotAuthoritative,
                RelayError::TooShort { .. } | RelayError::Empty => ErrorKind::TruncatedBuffer,
                RelayError::UnknownEventType(_) => ErrorKind::UnknownEventType,
                RelayError::UnknownKart(_) => ErrorKind::Decode,
            },
            NetError::Protocol(e) => match e {
                ProtocolError::Empty => ErrorKind::TruncatedBuffer,
                ProtocolError::UnknownProtocol(_) | ProtocolError::Unexpected(_) => ErrorKind::UnknownMessageType,
                ProtocolError::Buffer(inner) => buffer_kind(inner),
                ProtocolError::Lobby(_) | ProtocolError::Trailing(_) => ErrorKind::Decode,
                ProtocolError::NotOwner { .. } => ErrorKind::NotAuthoritative,
            },
            NetError::Config(_) => ErrorKind::Config,
            NetError::Transport(_) => ErrorKind::PeerDisconnected,
        }
    }
}

/// Crate result alias.
pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::clock::Phase;
    use crate::network::peer::PeerId;
    use crate::network::rewind::StaleReason;

    #[test]
    fn test_kind_mapping() {
        let cases: Vec<(NetError, ErrorKind)> = vec![
            (
                BufferError::Truncated { needed: 4, remaining: 1 }.into(),
                ErrorKind::TruncatedBuffer,
            ),
            (RelayError::UnknownEventType(9).into(), ErrorKind::UnknownEventType),
            (RelayError::TooShort { event: 1, needed: 5, got: 2 }.into(), ErrorKind::TruncatedBuffer),
            (ProtocolError::UnknownProtocol(99).into(), ErrorKind::UnknownMessageType),
            (
                RewindError::StaleSnapshot {
                    tick: 3,
                    reason: StaleReason::AlreadyApplied,
                }
                .into(),
                ErrorKind::StaleSnapshot,
            ),
            (ClockError::PrematurePause { phase: Phase::InGameMenu }.into(), ErrorKind::PrematurePause),
            (ClockError::ModeLocked { phase: Phase::Race }.into(), ErrorKind::InvalidPhase),
            (TransportError::PeerDisconnected(PeerId(2)).into(), ErrorKind::PeerDisconnected),
            (RelayError::NotAuthoritative.into(), ErrorKind::NotAuthoritative),
            (
                RewindError::Decode {
                    identity: "K0".into(),
                    source: BufferError::InvalidString,
                }
                .into(),
                ErrorKind::Decode,
            ),
            (
                ConfigError::OutOfRange {
                    field: "state_frequency",
                    reason: "zero".into(),
                }
                .into(),
                ErrorKind::Config,
            ),
        ];
        for (err, kind) in cases {
            assert_eq!(err.kind(), kind, "{err}");
        }
    }

    #[test]
    fn test_nested_buffer_error_in_protocol() {
        let err: NetError = ProtocolError::Buffer(BufferError::Truncated { needed: 2, remaining: 0 }).into();
        assert_eq!(err.kind(), ErrorKind::TruncatedBuffer);
        assert_eq!(err.kind().to_string(), "truncated_buffer");
    }

    #[test]
    fn test_display_is_transparent() {
        let err: NetError = RelayError::UnknownKart(4).into();
        assert_eq!(err.to_string(), "unknown kart 4");
    }
}
