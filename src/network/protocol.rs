//! Protocol Messages
//!
//! Every packet is `[protocol u8][payload]`. The protocol byte routes the
//! payload to its handler:
//!
//! | id | protocol          | delivery   | payload                         |
//! |----|-------------------|------------|---------------------------------|
//! | 1  | LobbyControl      | reliable   | bincode `LobbyMessage`          |
//! | 2  | GameEvents        | reliable   | `[event u8][tick u32][fields]`  |
//! | 3  | ControllerEvents  | reliable   | `[tick u32][kart u8][controls]` |
//! | 4  | StateSync         | unreliable | `[tick u32][count u16]` + states|
//!
//! Each state entry is `[identity string][len u16][bytes]`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::buffer::{BufferError, StateReader, StateWriter};
use crate::game::clock::Tick;
use crate::game::controls::{KartControlEvent, KartControls, KartId, CONTROLS_SIZE};
use crate::game::rewinder::StateSnapshot;

/// Protocol discriminant (first byte of every packet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolType {
    /// Handshake, ping, disconnect.
    LobbyControl,
    /// Race-affecting game events.
    GameEvents,
    /// Kart control changes.
    ControllerEvents,
    /// Periodic authoritative states.
    StateSync,
}

impl ProtocolType {
    /// Wire byte.
    pub fn to_u8(self) -> u8 {
        match self {
            ProtocolType::LobbyControl => 1,
            ProtocolType::GameEvents => 2,
            ProtocolType::ControllerEvents => 3,
            ProtocolType::StateSync => 4,
        }
    }

    /// Parse a wire byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(ProtocolType::LobbyControl),
            2 => Ok(ProtocolType::GameEvents),
            3 => Ok(ProtocolType::ControllerEvents),
            4 => Ok(ProtocolType::StateSync),
            other => Err(ProtocolError::UnknownProtocol(other)),
        }
    }

    /// Delivery class the protocol is sent with.
    pub fn delivery(self) -> Delivery {
        match self {
            ProtocolType::StateSync => Delivery::Unreliable,
            _ => Delivery::Reliable,
        }
    }
}

/// Per-message reliability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Delivery {
    /// Delivered once, in send order per channel.
    Reliable,
    /// May be dropped or reordered.
    Unreliable,
}

/// Protocol-level decode errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Packet had no protocol byte.
    #[error("empty packet")]
    Empty,

    /// Protocol byte not recognised.
    #[error("unknown protocol type {0}")]
    UnknownProtocol(u8),

    /// Payload ended early or held bad values.
    #[error("malformed payload: {0}")]
    Buffer(#[from] BufferError),

    /// Lobby message failed to (de)serialize.
    #[error("lobby message: {0}")]
    Lobby(#[from] bincode::Error),

    /// Bytes left over after a complete payload.
    #[error("{0} trailing bytes")]
    Trailing(usize),

    /// Valid protocol, but not accepted by this role.
    #[error("{0:?} not accepted here")]
    Unexpected(ProtocolType),

    /// Controller event for a kart the sender does not drive.
    #[error("sender does not drive kart {kart}")]
    NotOwner {
        /// Kart named in the event.
        kart: KartId,
    },
}

/// Prefix `payload` with its protocol byte.
pub fn encode_packet(protocol: ProtocolType, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(payload.len() + 1);
    packet.push(protocol.to_u8());
    packet.extend_from_slice(payload);
    packet
}

/// Split a packet into protocol and payload.
pub fn decode_packet(packet: &[u8]) -> Result<(ProtocolType, &[u8]), ProtocolError> {
    let (&first, payload) = packet.split_first().ok_or(ProtocolError::Empty)?;
    Ok((ProtocolType::from_u8(first)?, payload))
}

// =============================================================================
// LOBBY CONTROL
// =============================================================================

/// Lobby control messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LobbyMessage {
    /// Server: the kart this client drives.
    KartAssigned {
        /// Kart id.
        kart: KartId,
    },
    /// Client finished loading the world.
    WorldLoaded,
    /// Server: every peer is ready, start now.
    StartRace {
        /// Ticks between authoritative states.
        state_frequency: u32,
    },
    /// Round-trip time request.
    Ping {
        /// Echoed back in the pong.
        nonce: u64,
    },
    /// Answer to a ping.
    Pong {
        /// Nonce from the ping.
        nonce: u64,
    },
    /// Sender is leaving.
    Disconnect,
}

impl LobbyMessage {
    /// Serialize to JSON (logs, debugging).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Serialize to bincode.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Parse from bincode.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    /// Full packet including the protocol byte.
    pub fn to_packet(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(encode_packet(ProtocolType::LobbyControl, &self.to_bytes()?))
    }
}

// =============================================================================
// CONTROLLER EVENTS
// =============================================================================

/// A control change stamped with the tick it applies at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerEventMessage {
    /// Tick the change applies at.
    pub tick: Tick,
    /// The change.
    pub event: KartControlEvent,
}

impl ControllerEventMessage {
    /// Wire size of the payload.
    pub const SIZE: usize = 4 + 1 + CONTROLS_SIZE;

    /// Encode as a full packet.
    pub fn to_packet(&self) -> Vec<u8> {
        let mut w = StateWriter::with_capacity(1 + Self::SIZE);
        w.add_u8(ProtocolType::ControllerEvents.to_u8())
            .add_u32(self.tick)
            .add_u8(self.event.kart);
        self.event.controls.save_state(&mut w);
        w.into_bytes()
    }

    /// Decode a payload (protocol byte already stripped).
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = StateReader::new(payload);
        let tick = r.get_u32()?;
        let kart: KartId = r.get_u8()?;
        let controls = KartControls::restore_state(&mut r)?;
        if !r.is_empty() {
            return Err(ProtocolError::Trailing(r.remaining()));
        }
        Ok(Self {
            tick,
            event: KartControlEvent { kart, controls },
        })
    }
}

// =============================================================================
// STATE SYNC
// =============================================================================

/// Authoritative entity states for one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSyncMessage {
    /// Tick the states belong to.
    pub tick: Tick,
    /// One snapshot per included entity.
    pub states: Vec<StateSnapshot>,
}

impl StateSyncMessage {
    /// Encode as a full packet.
    ///
    /// # Panics
    /// Panics if a snapshot is longer than 65535 bytes or there are more
    /// than 65535 of them.
    pub fn to_packet(&self) -> Vec<u8> {
        assert!(self.states.len() <= u16::MAX as usize, "too many states in one message");
        let mut w = StateWriter::growable();
        w.add_u8(ProtocolType::StateSync.to_u8())
            .add_u32(self.tick)
            .add_u16(self.states.len() as u16);
        for state in &self.states {
            assert!(state.data.len() <= u16::MAX as usize, "state for {} too large", state.identity);
            w.add_string(&state.identity)
                .add_u16(state.data.len() as u16)
                .add_bytes(&state.data);
        }
        w.into_bytes()
    }

    /// Decode a payload (protocol byte already stripped).
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = StateReader::new(payload);
        let tick = r.get_u32()?;
        let count = r.get_u16()? as usize;
        let mut states = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let identity = r.get_string()?;
            let len = r.get_u16()? as usize;
            let data = r.get_bytes(len)?.to_vec();
            states.push(StateSnapshot { identity, data });
        }
        if !r.is_empty() {
            return Err(ProtocolError::Trailing(r.remaining()));
        }
        Ok(Self { tick, states })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_envelope() {
        let packet = encode_packet(ProtocolType::GameEvents, &[9, 8]);
        assert_eq!(packet, vec![2, 9, 8]);
        let (protocol, payload) = decode_packet(&packet).unwrap();
        assert_eq!(protocol, ProtocolType::GameEvents);
        assert_eq!(payload, &[9, 8]);
    }

    #[test]
    fn test_unknown_and_empty_packets() {
        assert!(matches!(decode_packet(&[]), Err(ProtocolError::Empty)));
        assert!(matches!(decode_packet(&[77, 1]), Err(ProtocolError::UnknownProtocol(77))));
    }

    #[test]
    fn test_delivery_classes() {
        assert_eq!(ProtocolType::StateSync.delivery(), Delivery::Unreliable);
        assert_eq!(ProtocolType::GameEvents.delivery(), Delivery::Reliable);
        assert_eq!(ProtocolType::ControllerEvents.delivery(), Delivery::Reliable);
    }

    #[test]
    fn test_lobby_message_bincode_roundtrip() {
        let msg = LobbyMessage::StartRace { state_frequency: 10 };
        let packet = msg.to_packet().unwrap();
        let (protocol, payload) = decode_packet(&packet).unwrap();
        assert_eq!(protocol, ProtocolType::LobbyControl);
        assert_eq!(LobbyMessage::from_bytes(payload).unwrap(), msg);
    }

    #[test]
    fn test_lobby_message_json() {
        let json = LobbyMessage::Ping { nonce: 5 }.to_json().unwrap();
        assert_eq!(json, r#"{"ping":{"nonce":5}}"#);
        assert_eq!(LobbyMessage::from_json(r#""world_loaded""#).unwrap(), LobbyMessage::WorldLoaded);
        assert_eq!(
            LobbyMessage::from_json(r#"{"kart_assigned":{"kart":1}}"#).unwrap(),
            LobbyMessage::KartAssigned { kart: 1 }
        );
    }

    #[test]
    fn test_garbage_lobby_payload_rejected() {
        assert!(LobbyMessage::from_bytes(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_controller_event_layout() {
        let mut controls = KartControls::new();
        controls.set_brake(true);
        let msg = ControllerEventMessage {
            tick: 0x01020304,
            event: KartControlEvent { kart: 2, controls },
        };
        let packet = msg.to_packet();
        assert_eq!(packet.len(), 1 + ControllerEventMessage::SIZE);
        assert_eq!(&packet[..6], &[3, 0x04, 0x03, 0x02, 0x01, 2]);

        let (_, payload) = decode_packet(&packet).unwrap();
        assert_eq!(ControllerEventMessage::decode(payload).unwrap(), msg);
        assert!(ControllerEventMessage::decode(&payload[..5]).is_err());
    }

    #[test]
    fn test_state_sync_layout() {
        let msg = StateSyncMessage {
            tick: 40,
            states: vec![
                StateSnapshot::new("K0", vec![1, 2, 3]),
                StateSnapshot::new("K1", vec![]),
            ],
        };
        let packet = msg.to_packet();
        assert_eq!(
            packet,
            vec![4, 40, 0, 0, 0, 2, 0, 2, b'K', b'0', 3, 0, 1, 2, 3, 2, b'K', b'1', 0, 0]
        );
        let decoded = StateSyncMessage::decode(&packet[1..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_state_sync_truncated() {
        let msg = StateSyncMessage {
            tick: 1,
            states: vec![StateSnapshot::new("K0", vec![7; 20])],
        };
        let packet = msg.to_packet();
        let err = StateSyncMessage::decode(&packet[1..packet.len() - 1]).unwrap_err();
        assert!(matches!(err, ProtocolError::Buffer(BufferError::Truncated { .. })));
    }
}
