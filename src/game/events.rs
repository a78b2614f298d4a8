//! Timeline Events
//!
//! Everything the rewind timeline can replay: per-kart control changes and
//! the race-affecting game events the server decides. Both are stamped with
//! the tick they apply at and are played before that tick's step.

use serde::{Deserialize, Serialize};

use crate::game::controls::{KartControlEvent, KartId};

/// A race-affecting event decided by the server.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum GameEvent {
    /// Kart crossed the line at `time` seconds of race time.
    KartFinishedRace {
        /// Kart.
        kart: KartId,
        /// Race time at the finish.
        time: f32,
    },
    /// The kart's driver left; the kart is eliminated for good.
    PlayerDisconnected {
        /// Kart.
        kart: KartId,
    },
}

impl GameEvent {
    /// Kart the event is about.
    pub fn kart(&self) -> KartId {
        match *self {
            GameEvent::KartFinishedRace { kart, .. } | GameEvent::PlayerDisconnected { kart } => kart,
        }
    }
}

/// One entry of the rewind timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TimelineEvent {
    /// New controls for a kart.
    Controls(KartControlEvent),
    /// Server-decided outcome.
    Game(GameEvent),
}

impl TimelineEvent {
    /// Kart the event is about.
    pub fn kart(&self) -> KartId {
        match self {
            TimelineEvent::Controls(e) => e.kart,
            TimelineEvent::Game(e) => e.kart(),
        }
    }
}

impl From<KartControlEvent> for TimelineEvent {
    fn from(event: KartControlEvent) -> Self {
        TimelineEvent::Controls(event)
    }
}

impl From<GameEvent> for TimelineEvent {
    fn from(event: GameEvent) -> Self {
        TimelineEvent::Game(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::controls::KartControls;

    #[test]
    fn test_kart_of_each_event() {
        let controls: TimelineEvent = KartControlEvent {
            kart: 2,
            controls: KartControls::new(),
        }
        .into();
        assert_eq!(controls.kart(), 2);

        let finish: TimelineEvent = GameEvent::KartFinishedRace { kart: 4, time: 9.5 }.into();
        assert_eq!(finish.kart(), 4);
        assert!(matches!(finish, TimelineEvent::Game(_)));
        assert_eq!(GameEvent::PlayerDisconnected { kart: 1 }.kart(), 1);
    }
}
