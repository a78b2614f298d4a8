//! Game Event Relay
//!
//! Race-affecting events decided by the server and mirrored on clients.
//!
//! ```text
//!   [event_type u8][tick u32][fields...]
//!
//!   1  KartFinishedRace    [tick u32][kart u8][time f32]
//!   2  PlayerDisconnected  [tick u32][kart u8]
//! ```
//!
//! Always carried inside a reliable `GameEvents` packet. Only the server
//! generates events. The relay never touches the world directly: every
//! event goes onto the rewind timeline at its tick, so a rollback replays
//! it at the same point the server applied it.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::buffer::{StateReader, StateWriter};
use crate::game::clock::Tick;
use crate::game::controls::KartId;
use crate::game::events::GameEvent;
use crate::game::world::RaceWorld;
use crate::network::protocol::ProtocolType;

const KART_FINISHED_RACE: u8 = 1;
const PLAYER_DISCONNECTED: u8 = 2;

/// Relay errors. All of them are logged and the message dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// Only the server may generate or send game events.
    #[error("game events are generated by the server only")]
    NotAuthoritative,

    /// Message shorter than its event type requires.
    #[error("event {event} needs {needed} bytes, got {got}")]
    TooShort {
        /// Event type byte.
        event: u8,
        /// Bytes required after the type.
        needed: usize,
        /// Bytes present after the type.
        got: usize,
    },

    /// Event type byte not recognised.
    #[error("unknown game event type {0}")]
    UnknownEventType(u8),

    /// Event refers to a kart that does not exist.
    #[error("unknown kart {0}")]
    UnknownKart(KartId),

    /// Empty message.
    #[error("empty game event")]
    Empty,
}

/// A game event stamped with the tick it applies at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GameEventMessage {
    /// Tick the event is played at, before that tick's step.
    pub tick: Tick,
    /// The event.
    pub event: GameEvent,
}

impl GameEventMessage {
    /// Full packet including the protocol byte.
    pub fn to_packet(&self) -> Vec<u8> {
        let mut w = StateWriter::with_capacity(1 + 1 + 4 + 1 + 4);
        w.add_u8(ProtocolType::GameEvents.to_u8());
        match self.event {
            GameEvent::KartFinishedRace { kart, time } => {
                w.add_u8(KART_FINISHED_RACE)
                    .add_u32(self.tick)
                    .add_u8(kart)
                    .add_f32(time);
            }
            GameEvent::PlayerDisconnected { kart } => {
                w.add_u8(PLAYER_DISCONNECTED).add_u32(self.tick).add_u8(kart);
            }
        }
        w.into_bytes()
    }

    /// Decode a payload (protocol byte already stripped).
    pub fn decode(payload: &[u8]) -> Result<Self, RelayError> {
        let (&event, body) = payload.split_first().ok_or(RelayError::Empty)?;
        let needed = match event {
            KART_FINISHED_RACE => 4 + 1 + 4,
            PLAYER_DISCONNECTED => 4 + 1,
            other => return Err(RelayError::UnknownEventType(other)),
        };
        if body.len() < needed {
            return Err(RelayError::TooShort {
                event,
                needed,
                got: body.len(),
            });
        }
        let mut r = StateReader::new(body);
        let too_short = |_| RelayError::TooShort {
            event,
            needed,
            got: body.len(),
        };
        let tick = r.get_u32().map_err(too_short)?;
        let kart = r.get_u8().map_err(too_short)?;
        let event = match event {
            KART_FINISHED_RACE => GameEvent::KartFinishedRace {
                kart,
                time: r.get_f32().map_err(too_short)?,
            },
            _ => GameEvent::PlayerDisconnected { kart },
        };
        Ok(Self { tick, event })
    }
}

/// Server-side generation and client-side intake of game events.
///
/// Each kart is announced finished or disconnected at most once per side,
/// which keeps generation and intake idempotent even before the event has
/// been played.
#[derive(Debug, Clone)]
pub struct GameEventsProtocol {
    is_server: bool,
    finished: BTreeSet<KartId>,
    disconnected: BTreeSet<KartId>,
    accepted: u64,
    dropped: u64,
}

impl GameEventsProtocol {
    /// Relay for the given role.
    pub fn new(is_server: bool) -> Self {
        Self {
            is_server,
            finished: BTreeSet::new(),
            disconnected: BTreeSet::new(),
            accepted: 0,
            dropped: 0,
        }
    }

    /// Events generated (server) or accepted onto the timeline (client).
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Events dropped so far (malformed, late, duplicate or unauthorised).
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Server: `kart` finished at the current race time. Returns the event
    /// stamped with the current tick, or `None` if it was already announced.
    pub fn kart_finished_race(
        &mut self,
        world: &RaceWorld,
        kart: KartId,
    ) -> Result<Option<GameEventMessage>, RelayError> {
        if !self.is_server {
            return Err(RelayError::NotAuthoritative);
        }
        let time = world.clock().time();
        self.generate(world, GameEvent::KartFinishedRace { kart, time })
    }

    /// Server: `kart`'s driver left. Returns the event stamped with the
    /// current tick, or `None` if it was already announced.
    pub fn eliminate_player(
        &mut self,
        world: &RaceWorld,
        kart: KartId,
    ) -> Result<Option<GameEventMessage>, RelayError> {
        if !self.is_server {
            return Err(RelayError::NotAuthoritative);
        }
        self.generate(world, GameEvent::PlayerDisconnected { kart })
    }

    fn generate(&mut self, world: &RaceWorld, event: GameEvent) -> Result<Option<GameEventMessage>, RelayError> {
        let msg = GameEventMessage {
            tick: world.tick(),
            event,
        };
        if !self.admit(world, &msg)? {
            return Ok(None);
        }
        info!(?event, tick = msg.tick, "game event generated");
        Ok(Some(msg))
    }

    /// Client: decode and validate an event from the server.
    ///
    /// Returns the event to put on the timeline, or `None` if it was a
    /// duplicate or arrived after the race ended. Errors mean the message
    /// was dropped.
    pub fn receive(&mut self, world: &RaceWorld, payload: &[u8]) -> Result<Option<GameEventMessage>, RelayError> {
        if self.is_server {
            self.dropped += 1;
            return Err(RelayError::NotAuthoritative);
        }
        if world.is_race_over() {
            self.dropped += 1;
            debug!(tick = world.tick(), "game event after race over ignored");
            return Ok(None);
        }
        let msg = match GameEventMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.dropped += 1;
                match &e {
                    RelayError::UnknownEventType(t) => warn!(event_type = *t, "unknown game event dropped"),
                    other => warn!(error = %other, "malformed game event dropped"),
                }
                return Err(e);
            }
        };
        match self.admit(world, &msg) {
            Ok(true) => {
                debug!(event = ?msg.event, tick = msg.tick, "game event received");
                Ok(Some(msg))
            }
            Ok(false) => {
                self.dropped += 1;
                Ok(None)
            }
            Err(e) => {
                self.dropped += 1;
                warn!(error = %e, "game event dropped");
                Err(e)
            }
        }
    }

    fn admit(&mut self, world: &RaceWorld, msg: &GameEventMessage) -> Result<bool, RelayError> {
        let kart = msg.event.kart();
        if world.kart(kart).is_none() {
            return Err(RelayError::UnknownKart(kart));
        }
        let fresh = match msg.event {
            GameEvent::KartFinishedRace { .. } => self.finished.insert(kart),
            GameEvent::PlayerDisconnected { .. } => self.disconnected.insert(kart),
        };
        if fresh {
            self.accepted += 1;
        }
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RaceConfig;
    use crate::network::protocol::decode_packet;

    fn world(num_karts: u8) -> RaceWorld {
        let config = RaceConfig {
            race_now: true,
            ..RaceConfig::default()
        };
        RaceWorld::new(&config, num_karts)
    }

    fn racing_world(num_karts: u8) -> RaceWorld {
        let mut w = world(num_karts);
        for _ in 0..130 {
            w.step();
        }
        w
    }

    fn payload(packet: &[u8]) -> &[u8] {
        let (protocol, payload) = decode_packet(packet).unwrap();
        assert_eq!(protocol, ProtocolType::GameEvents);
        payload
    }

    #[test]
    fn test_wire_layout() {
        let msg = GameEventMessage {
            tick: 0x0102,
            event: GameEvent::KartFinishedRace { kart: 3, time: 1.5 },
        };
        assert_eq!(
            msg.to_packet(),
            vec![2, 1, 0x02, 0x01, 0, 0, 3, 0x00, 0x00, 0xC0, 0x3F]
        );
        let msg = GameEventMessage {
            tick: 7,
            event: GameEvent::PlayerDisconnected { kart: 1 },
        };
        let packet = msg.to_packet();
        assert_eq!(packet, vec![2, 2, 7, 0, 0, 0, 1]);
        assert_eq!(GameEventMessage::decode(payload(&packet)).unwrap(), msg);
    }

    #[test]
    fn test_short_and_unknown_dropped() {
        assert_eq!(
            GameEventMessage::decode(&[1, 0, 0, 0, 0, 2, 0]),
            Err(RelayError::TooShort {
                event: 1,
                needed: 9,
                got: 6
            })
        );
        assert_eq!(
            GameEventMessage::decode(&[2, 5]).unwrap_err(),
            RelayError::TooShort { event: 2, needed: 5, got: 1 }
        );
        assert_eq!(GameEventMessage::decode(&[9, 1]), Err(RelayError::UnknownEventType(9)));
        assert_eq!(GameEventMessage::decode(&[]), Err(RelayError::Empty));

        let w = world(2);
        let mut client = GameEventsProtocol::new(false);
        assert!(client.receive(&w, &[1, 0]).is_err());
        assert_eq!(client.dropped(), 1);
        assert_eq!(client.accepted(), 0);
    }

    #[test]
    fn test_only_server_generates() {
        let w = world(2);
        let mut client = GameEventsProtocol::new(false);
        assert_eq!(client.kart_finished_race(&w, 0), Err(RelayError::NotAuthoritative));
        assert_eq!(client.eliminate_player(&w, 0), Err(RelayError::NotAuthoritative));

        let mut server = GameEventsProtocol::new(true);
        let packet = GameEventMessage {
            tick: 0,
            event: GameEvent::PlayerDisconnected { kart: 0 },
        }
        .to_packet();
        assert_eq!(server.receive(&w, payload(&packet)), Err(RelayError::NotAuthoritative));
    }

    #[test]
    fn test_server_stamps_current_tick_and_time() {
        let w = racing_world(2);
        let mut server = GameEventsProtocol::new(true);
        let msg = server.kart_finished_race(&w, 1).unwrap().unwrap();
        assert_eq!(msg.tick, w.tick());
        assert_eq!(
            msg.event,
            GameEvent::KartFinishedRace {
                kart: 1,
                time: w.clock().time()
            }
        );
        // Generation does not touch the world
        assert!(!w.kart(1).unwrap().is_finished());
    }

    #[test]
    fn test_server_to_client_relay() {
        let server_world = racing_world(2);
        let mut client_world = racing_world(2);
        let mut server = GameEventsProtocol::new(true);
        let mut client = GameEventsProtocol::new(false);

        let sent = server.eliminate_player(&server_world, 0).unwrap().unwrap();
        let got = client.receive(&client_world, payload(&sent.to_packet())).unwrap();
        assert_eq!(got, Some(sent));

        client_world.apply_game_event(&got.unwrap().event);
        assert!(client_world.kart(0).unwrap().is_retired());
    }

    #[test]
    fn test_each_kart_announced_once() {
        let w = racing_world(2);
        let mut server = GameEventsProtocol::new(true);
        assert!(server.eliminate_player(&w, 1).unwrap().is_some());
        assert_eq!(server.eliminate_player(&w, 1).unwrap(), None);
        assert!(server.kart_finished_race(&w, 0).unwrap().is_some());
        assert_eq!(server.kart_finished_race(&w, 0).unwrap(), None);
        assert_eq!(server.accepted(), 2);

        let mut client = GameEventsProtocol::new(false);
        let packet = GameEventMessage {
            tick: 40,
            event: GameEvent::KartFinishedRace { kart: 0, time: 12.0 },
        }
        .to_packet();
        assert!(client.receive(&w, payload(&packet)).unwrap().is_some());
        assert_eq!(client.receive(&w, payload(&packet)).unwrap(), None);
        assert_eq!(client.accepted(), 1);
        assert_eq!(client.dropped(), 1);
    }

    #[test]
    fn test_unknown_kart_dropped() {
        let w = world(2);
        let mut client = GameEventsProtocol::new(false);
        let packet = GameEventMessage {
            tick: 3,
            event: GameEvent::PlayerDisconnected { kart: 7 },
        }
        .to_packet();
        assert_eq!(client.receive(&w, payload(&packet)), Err(RelayError::UnknownKart(7)));
        let mut server = GameEventsProtocol::new(true);
        assert_eq!(server.eliminate_player(&w, 7), Err(RelayError::UnknownKart(7)));
    }

    #[test]
    fn test_events_ignored_after_race_over() {
        let mut w = racing_world(1);
        w.apply_game_event(&GameEvent::KartFinishedRace { kart: 0, time: 1.0 });
        assert!(w.is_race_over());

        let mut client = GameEventsProtocol::new(false);
        let late = GameEventMessage {
            tick: w.tick(),
            event: GameEvent::PlayerDisconnected { kart: 0 },
        }
        .to_packet();
        assert_eq!(client.receive(&w, payload(&late)).unwrap(), None);
        assert_eq!(client.dropped(), 1);
        assert_eq!(client.accepted(), 0);
    }
}
