//! # Kart Rewind
//!
//! Rollback state synchronization for networked kart racing: a deterministic
//! race clock, rewindable karts, and a rewind manager that restores an older
//! local state, applies the server's authoritative one and re-simulates up to
//! the present.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         KART REWIND                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  core/            - Deterministic primitives                 │
//! │  ├── buffer.rs    - Byte-exact state buffer                  │
//! │  ├── math.rs      - Vec3 / Quat / Transform                  │
//! │  ├── bits.rs      - Packed flag and animation words          │
//! │  └── hash.rs      - State digests for determinism checks     │
//! │                                                              │
//! │  game/            - Simulation (deterministic)               │
//! │  ├── clock.rs     - Race phases and tick clock               │
//! │  ├── controls.rs  - Packed kart inputs                       │
//! │  ├── events.rs    - Timeline events: controls and outcomes   │
//! │  ├── kart.rs      - Kart state, kinematics, snapshots        │
//! │  ├── smoothing.rs - Cosmetic correction blending             │
//! │  ├── rewinder.rs  - Save/restore contract                    │
//! │  └── world.rs     - Clock + karts, one step per tick         │
//! │                                                              │
//! │  network/         - Networking (non-deterministic)           │
//! │  ├── transport.rs - Transport trait, queue, loopback hub     │
//! │  ├── protocol.rs  - Packet envelope and messages             │
//! │  ├── rewind.rs    - History, timeline, rollback              │
//! │  ├── events.rs    - Server-authoritative game event relay    │
//! │  ├── lobby.rs     - Handshake, start, ping                   │
//! │  └── session.rs   - Server and client race loops             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism
//!
//! `game/` is driven only by `step()` and recorded timeline events. Given the
//! same starting state and the same events, two worlds produce identical
//! digests tick for tick, which is what makes re-simulation after a rollback
//! land on the server's timeline.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod error;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use config::{ConfigError, NetworkMode, RaceConfig};
pub use core::buffer::{BufferError, StateReader, StateWriter};
pub use core::hash::StateHash;
pub use error::{ErrorKind, NetError, Result};
pub use game::{KartControls, KartId, Phase, RaceWorld, Tick, WorldClock};
pub use network::{RaceSession, RewindManager, Transport};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default simulation tick rate (Hz)
pub const TICK_RATE: u32 = 120;
