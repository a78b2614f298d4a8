//! Core primitives.
//!
//! Byte buffers, value types and bitfields shared by the simulation and the
//! network layer. Nothing here knows about karts or peers.

pub mod buffer;
pub mod math;
pub mod bits;
pub mod hash;

// Re-export core types
pub use buffer::{BufferError, StateReader, StateWriter};
pub use math::{Quat, Transform, Vec3};
pub use bits::{AnimationWord, KartFlags};
pub use hash::{compute_world_hash, StateHash, StateHasher};
