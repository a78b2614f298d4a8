//! Game Logic Module
//!
//! The deterministic race simulation.
//!
//! ## Module Structure
//!
//! - `clock`: race phases and the tick clock
//! - `controls`: packed per-kart inputs
//! - `events`: server-decided game events and the replayable timeline entry
//! - `kart`: kart state, kinematics and snapshots
//! - `smoothing`: cosmetic correction blending (not part of any snapshot)
//! - `rewinder`: the save/restore contract used by rollback
//! - `world`: clock plus karts, one `step()` per tick

pub mod clock;
pub mod controls;
pub mod events;
pub mod kart;
pub mod rewinder;
pub mod smoothing;
pub mod world;

// Re-export key types
pub use clock::{ClockConfig, ClockError, ClockMode, ClockNotice, Phase, PhaseDurations, Tick, WorldClock};
pub use controls::{KartControlEvent, KartControls, KartId, SkidControl};
pub use events::{GameEvent, TimelineEvent};
pub use kart::{Kart, KartState};
pub use rewinder::{
    ReconcilePolicy, Reconciliation, RewindWorld, Rewindable, RewinderRegistry, StateSnapshot, StateSource,
};
pub use world::RaceWorld;
