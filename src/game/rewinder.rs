//! Rewindable Entities
//!
//! Capability interface for anything whose state is synchronized and rolled
//! back, plus the world-level interface the rewind manager drives.
//!
//! ```text
//!   RewindManager ──owns──► opaque StateSnapshot { identity, bytes }
//!        │
//!        └──drives──► RewindWorld ──lookup by identity──► dyn Rewindable
//! ```
//!
//! The manager never looks inside a snapshot; each entity encodes and
//! decodes its own bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::buffer::BufferError;
use crate::game::clock::Tick;
use crate::game::events::TimelineEvent;

/// One entity's serialized state at one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Stable identity of the entity that produced it.
    pub identity: String,
    /// Entity-defined bytes.
    pub data: Vec<u8>,
}

impl StateSnapshot {
    /// Create a snapshot.
    pub fn new(identity: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            identity: identity.into(),
            data,
        }
    }
}

/// Where a restored state came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSource {
    /// Our own record from an earlier tick.
    Local,
    /// The server's confirmed state.
    Authoritative,
}

/// Lifecycle decision returned after a rewind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Nothing to do.
    Unchanged,
    /// Entity is gone on the server; eliminate it locally.
    Eliminate,
    /// Entity is back on the server; reinstate it (hidden).
    Reinstate,
}

/// Tuning for post-rewind reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilePolicy {
    /// Consecutive authoritative updates an entity may be absent from.
    pub missed_state_tolerance: u32,
    /// Ticks over which a positional correction is blended out.
    pub smoothing_ticks: u32,
    /// Steering difference that triggers steering smoothing.
    pub steering_threshold: f32,
    /// Ticks over which a full-lock steering change is blended.
    pub steering_smoothing_ticks: u32,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            missed_state_tolerance: 3,
            smoothing_ticks: 15,
            steering_threshold: 0.05,
            steering_smoothing_ticks: 12,
        }
    }
}

/// An entity that can be saved, restored and reconciled.
pub trait Rewindable {
    /// Stable identity, unique within the world.
    fn identity(&self) -> &str;

    /// Serialize deterministic state. `None` excludes the entity.
    ///
    /// Must not change the entity; two calls give identical bytes.
    fn save_state(&self) -> Option<StateSnapshot>;

    /// Overwrite deterministic state from `data`.
    ///
    /// On error the entity keeps the state it had before the call.
    fn restore_state(&mut self, data: &[u8], source: StateSource) -> Result<(), BufferError>;

    /// Called on every entity before a rollback starts.
    fn prepare_rewind(&mut self);

    /// Called once per rewind after replay.
    ///
    /// `authoritative` is true when the rewind carried a server state
    /// message; only those rewinds count towards missed updates.
    fn compute_error(&mut self, policy: &ReconcilePolicy, authoritative: bool) -> Reconciliation;
}

/// Maps identity strings to entity slots.
#[derive(Debug, Clone, Default)]
pub struct RewinderRegistry {
    slots: BTreeMap<String, usize>,
}

impl RewinderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `identity` at `slot`. Returns the previous slot if the
    /// identity was already taken.
    pub fn register(&mut self, identity: impl Into<String>, slot: usize) -> Option<usize> {
        self.slots.insert(identity.into(), slot)
    }

    /// Remove an identity.
    pub fn unregister(&mut self, identity: &str) -> Option<usize> {
        self.slots.remove(identity)
    }

    /// Slot for an identity.
    pub fn slot(&self, identity: &str) -> Option<usize> {
        self.slots.get(identity).copied()
    }

    /// Number of registered entities.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Identities in sorted order.
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }
}

/// World interface used by the rewind manager.
pub trait RewindWorld {
    /// Ticks simulated since the synchronized start.
    fn current_tick(&self) -> Tick;

    /// Serialize world-level state that is not owned by any entity
    /// (clock counters, tick).
    fn save_local(&self) -> Vec<u8>;

    /// Restore what `save_local` wrote.
    fn restore_local(&mut self, data: &[u8]) -> Result<(), BufferError>;

    /// Snapshot every entity that is not excluded.
    fn save_entities(&self) -> Vec<StateSnapshot>;

    /// Identities of all registered entities.
    fn identities(&self) -> Vec<String>;

    /// Entity lookup by identity.
    fn rewinder_mut(&mut self, identity: &str) -> Option<&mut dyn Rewindable>;

    /// Apply a recorded timeline event. Must be idempotent.
    fn apply_event(&mut self, event: &TimelineEvent);

    /// Run one simulation step.
    fn step(&mut self);

    /// Enter or leave replay (suppresses side notifications).
    fn set_replaying(&mut self, replaying: bool);

    /// Policy passed to every entity's `compute_error`.
    fn reconcile_policy(&self) -> ReconcilePolicy;

    /// Act on an entity's reconciliation outcome.
    fn apply_reconciliation(&mut self, identity: &str, outcome: Reconciliation);
}
