//! Rewind Manager
//!
//! Owns the local state history and the event timeline. The timeline holds
//! control changes and server-decided game events (finish, disconnect), so a
//! replay re-applies both at their tick. When an authoritative state for a
//! past tick arrives (or an event arrives late) the world is rolled back and
//! replayed up to the present.
//!
//! ```text
//!   history:  R0 ─── R10 ─── R20 ─── R30 ─── R40        (every K ticks)
//!   events:     e3   e12  e17       e31                  (per tick)
//!
//!   authoritative state for T = 27 arrives at now = 43
//!
//!   1. restore R20            (world record + every entity)
//!   2. replay 20..27          with recorded events
//!   3. apply server states    for tick 27
//!   4. replay 27..43          refreshing R30, R40
//!   5. compute_error          smoothing + eliminate / reinstate
//! ```
//!
//! Invariants:
//! - events for tick `t` are applied before the step from `t` to `t + 1`
//! - a rewind always ends at the tick it started from
//! - an authoritative tick is applied at most once, in increasing order

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::buffer::BufferError;
use crate::game::clock::Tick;
use crate::game::events::TimelineEvent;
use crate::game::rewinder::{Reconciliation, RewindWorld, StateSnapshot, StateSource};

// =============================================================================
// CONFIG AND ERRORS
// =============================================================================

/// History cadence and depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewindConfig {
    /// Ticks between local records (and between server states).
    pub state_frequency: u32,
    /// How far back a rollback may reach.
    pub max_rollback_ticks: u32,
}

impl Default for RewindConfig {
    fn default() -> Self {
        Self {
            state_frequency: 10,
            max_rollback_ticks: 240,
        }
    }
}

/// Why an authoritative state was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// A state for this or a later tick was already applied.
    AlreadyApplied,
    /// A newer state is already waiting.
    Superseded,
    /// No local record reaches back that far.
    BelowHistory,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StaleReason::AlreadyApplied => "already applied a state at or after this tick",
            StaleReason::Superseded => "a newer state is pending",
            StaleReason::BelowHistory => "older than local history",
        };
        f.write_str(s)
    }
}

/// Rewind errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RewindError {
    /// Authoritative state too old to use.
    #[error("stale snapshot for tick {tick}: {reason}")]
    StaleSnapshot {
        /// Tick of the rejected state.
        tick: Tick,
        /// Why it was rejected.
        reason: StaleReason,
    },

    /// An entity could not decode its state; it kept its previous one.
    #[error("failed to decode state of {identity}: {source}")]
    Decode {
        /// Entity identity.
        identity: String,
        /// Underlying buffer error.
        source: BufferError,
    },
}

/// Running counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RewindStats {
    /// Local records written (including refreshes during replay).
    pub saved_states: u64,
    /// Completed rollbacks.
    pub rewinds: u64,
    /// Ticks re-simulated across all rollbacks.
    pub replayed_ticks: u64,
    /// Authoritative states rejected as stale.
    pub stale_snapshots: u64,
    /// Entity states that failed to decode.
    pub decode_failures: u64,
    /// Network events that arrived for an already simulated tick.
    pub late_events: u64,
}

/// Result of one rollback.
#[derive(Debug, Clone, PartialEq)]
pub struct RewindSummary {
    /// Tick of the local record the rollback started from.
    pub from_tick: Tick,
    /// Authoritative tick applied, if the rollback carried one.
    pub authoritative_tick: Option<Tick>,
    /// Tick the world is at again afterwards.
    pub to_tick: Tick,
    /// Steps re-simulated.
    pub replayed_ticks: u32,
    /// Authoritative entity states applied successfully.
    pub applied: usize,
    /// Per-entity decode failures.
    pub errors: Vec<RewindError>,
    /// Non-trivial reconciliation outcomes handed to the world.
    pub outcomes: Vec<(String, Reconciliation)>,
}

#[derive(Debug, Clone)]
struct LocalRecord {
    world: Vec<u8>,
    entities: Vec<StateSnapshot>,
}

// =============================================================================
// REWIND MANAGER
// =============================================================================

/// History, timeline and rollback driver for one world.
#[derive(Debug, Default)]
pub struct RewindManager {
    config: RewindConfig,
    history: BTreeMap<Tick, LocalRecord>,
    events: BTreeMap<Tick, Vec<TimelineEvent>>,
    /// Highest tick whose events were applied.
    played_through: Option<Tick>,
    pending_state: Option<(Tick, Vec<StateSnapshot>)>,
    last_applied: Option<Tick>,
    replay_from: Option<Tick>,
    stats: RewindStats,
}

impl RewindManager {
    /// New manager with empty history.
    pub fn new(config: RewindConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Configuration.
    pub fn config(&self) -> &RewindConfig {
        &self.config
    }

    /// Change the cadence (negotiated at race start).
    pub fn set_state_frequency(&mut self, frequency: u32) {
        self.config.state_frequency = frequency;
    }

    /// Counters.
    pub fn stats(&self) -> &RewindStats {
        &self.stats
    }

    /// Drop all history, events and pending states.
    pub fn reset(&mut self) {
        let config = self.config;
        *self = Self::new(config);
    }

    // =========================================================================
    // LOCAL HISTORY
    // =========================================================================

    /// True if a local record is due at `tick`.
    pub fn should_save_state(&self, tick: Tick) -> bool {
        self.config.state_frequency > 0 && tick % self.config.state_frequency == 0
    }

    /// Record the world and every entity at the world's current tick.
    pub fn save_local_state<W: RewindWorld + ?Sized>(&mut self, world: &W) {
        let tick = world.current_tick();
        let record = LocalRecord {
            world: world.save_local(),
            entities: world.save_entities(),
        };
        self.history.insert(tick, record);
        self.stats.saved_states += 1;
        self.collect_garbage(tick);
    }

    /// Tick of the oldest kept record.
    pub fn oldest_record(&self) -> Option<Tick> {
        self.history.keys().next().copied()
    }

    /// Tick of the newest kept record.
    pub fn latest_record(&self) -> Option<Tick> {
        self.history.keys().next_back().copied()
    }

    /// True if a record exists for exactly `tick`.
    pub fn has_record(&self, tick: Tick) -> bool {
        self.history.contains_key(&tick)
    }

    /// Number of kept records.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn collect_garbage(&mut self, now: Tick) {
        let mut floor = now.saturating_sub(self.config.max_rollback_ticks);
        if let Some((pending, _)) = &self.pending_state {
            floor = floor.min(*pending);
        }
        if let Some(replay) = self.replay_from {
            floor = floor.min(replay);
        }
        let keep_from = self
            .history
            .range(..=floor)
            .next_back()
            .map_or(floor, |(tick, _)| *tick);
        if self.history.keys().next().map_or(false, |oldest| *oldest < keep_from) {
            self.history = self.history.split_off(&keep_from);
        }
        if self.events.keys().next().map_or(false, |oldest| *oldest < keep_from) {
            self.events = self.events.split_off(&keep_from);
        }
    }

    // =========================================================================
    // EVENT TIMELINE
    // =========================================================================

    /// Record an event produced locally for `tick`.
    pub fn add_local_event(&mut self, tick: Tick, event: impl Into<TimelineEvent>) {
        self.insert_event(tick, event.into());
    }

    /// Record an event received from the network for `tick`.
    ///
    /// Returns false if the tick is older than the kept history; such an
    /// event can no longer be replayed and is not recorded.
    pub fn add_network_event(&mut self, tick: Tick, event: impl Into<TimelineEvent>) -> bool {
        let event = event.into();
        let late = self.played_through.map_or(false, |played| tick <= played);
        if late {
            if self.oldest_record().map_or(true, |oldest| tick < oldest) {
                warn!(tick, kart = event.kart(), "event older than history dropped");
                return false;
            }
            self.stats.late_events += 1;
            self.replay_from = Some(self.replay_from.map_or(tick, |t| t.min(tick)));
            debug!(tick, kart = event.kart(), "late event schedules replay");
        }
        self.insert_event(tick, event);
        true
    }

    fn insert_event(&mut self, tick: Tick, event: TimelineEvent) {
        self.events.entry(tick).or_default().push(event);
    }

    /// Apply every not yet played event up to and including `tick`.
    pub fn play_events_till<W: RewindWorld + ?Sized>(&mut self, world: &mut W, tick: Tick) {
        let start = self.played_through.map_or(0, |t| t + 1);
        if start > tick {
            return;
        }
        for events in self.events.range(start..=tick).map(|(_, e)| e) {
            for event in events {
                world.apply_event(event);
            }
        }
        self.played_through = Some(tick);
    }

    /// Events recorded for one tick.
    pub fn events_at(&self, tick: Tick) -> &[TimelineEvent] {
        self.events.get(&tick).map(Vec::as_slice).unwrap_or(&[])
    }

    fn apply_events_at<W: RewindWorld + ?Sized>(&self, world: &mut W, tick: Tick) {
        if let Some(events) = self.events.get(&tick) {
            for event in events {
                world.apply_event(event);
            }
        }
    }

    // =========================================================================
    // AUTHORITATIVE STATE
    // =========================================================================

    /// Accept the server's entity states for `tick`.
    ///
    /// States for a tick the world has not reached yet are parked until it
    /// gets there; a newer state replaces an older parked one.
    pub fn receive_authoritative_state(
        &mut self,
        tick: Tick,
        states: Vec<StateSnapshot>,
    ) -> Result<(), RewindError> {
        let reason = if self.last_applied.map_or(false, |last| tick <= last) {
            Some(StaleReason::AlreadyApplied)
        } else if self.pending_state.as_ref().map_or(false, |(pending, _)| tick <= *pending) {
            Some(StaleReason::Superseded)
        } else if self.oldest_record().map_or(false, |oldest| tick < oldest) {
            Some(StaleReason::BelowHistory)
        } else {
            None
        };
        if let Some(reason) = reason {
            self.stats.stale_snapshots += 1;
            debug!(tick, %reason, "authoritative state rejected");
            return Err(RewindError::StaleSnapshot { tick, reason });
        }
        self.pending_state = Some((tick, states));
        Ok(())
    }

    /// Tick of the parked authoritative state.
    pub fn pending_tick(&self) -> Option<Tick> {
        self.pending_state.as_ref().map(|(tick, _)| *tick)
    }

    /// Last authoritative tick applied.
    pub fn last_applied(&self) -> Option<Tick> {
        self.last_applied
    }

    /// Discard parked authoritative states (server went away).
    pub fn forget_peer_states(&mut self) {
        if let Some((tick, _)) = self.pending_state.take() {
            info!(tick, "dropping pending authoritative state");
        }
    }

    /// True if a rollback is due at `now`.
    pub fn needs_rewind(&self, now: Tick) -> bool {
        self.replay_from.is_some() || self.pending_tick().map_or(false, |t| t <= now)
    }

    // =========================================================================
    // ROLLBACK
    // =========================================================================

    /// Roll back to the earliest due tick and replay to the present.
    ///
    /// Returns `Ok(None)` when nothing is due. Fails with
    /// [`RewindError::StaleSnapshot`] if no local record reaches back far
    /// enough; the world is left untouched in that case.
    pub fn rewind_and_replay<W: RewindWorld + ?Sized>(
        &mut self,
        world: &mut W,
    ) -> Result<Option<RewindSummary>, RewindError> {
        let now = world.current_tick();
        let authoritative = match self.pending_state.take() {
            Some((tick, states)) if tick <= now => Some((tick, states)),
            future => {
                self.pending_state = future;
                None
            }
        };
        let late = self.replay_from.take();
        let target = match (authoritative.as_ref().map(|(t, _)| *t), late) {
            (Some(a), Some(l)) => a.min(l),
            (Some(a), None) => a,
            (None, Some(l)) => l,
            (None, None) => return Ok(None),
        };

        let Some((from_tick, record)) = self
            .history
            .range(..=target)
            .next_back()
            .map(|(tick, record)| (*tick, record.clone()))
        else {
            if let Some((tick, _)) = authoritative {
                self.stats.stale_snapshots += 1;
                warn!(tick, "no local record for authoritative state");
                return Err(RewindError::StaleSnapshot {
                    tick,
                    reason: StaleReason::BelowHistory,
                });
            }
            warn!(tick = target, "no local record for late event; replay skipped");
            return Ok(None);
        };

        let identities = world.identities();
        for identity in &identities {
            if let Some(entity) = world.rewinder_mut(identity) {
                entity.prepare_rewind();
            }
        }
        world.set_replaying(true);

        let mut errors = Vec::new();
        if let Err(source) = world.restore_local(&record.world) {
            world.set_replaying(false);
            return Err(RewindError::Decode {
                identity: "world".to_owned(),
                source,
            });
        }
        for snapshot in &record.entities {
            self.restore_entity(world, snapshot, StateSource::Local, &mut errors);
        }

        let mut applied = 0;
        let mut replayed = 0;
        let auth_tick = authoritative.as_ref().map(|(t, _)| *t);

        if let Some((tick, states)) = authoritative {
            replayed += self.replay(world, from_tick, tick);
            for snapshot in &states {
                if self.restore_entity(world, snapshot, StateSource::Authoritative, &mut errors) {
                    applied += 1;
                }
            }
            if self.should_save_state(tick) {
                self.save_local_state(world);
            }
            replayed += self.replay(world, tick, now);
            self.last_applied = Some(tick);
        } else {
            replayed += self.replay(world, from_tick, now);
        }
        world.set_replaying(false);

        let policy = world.reconcile_policy();
        let mut outcomes = Vec::new();
        for identity in &identities {
            let Some(entity) = world.rewinder_mut(identity) else {
                continue;
            };
            let outcome = entity.compute_error(&policy, auth_tick.is_some());
            if outcome != Reconciliation::Unchanged {
                outcomes.push((identity.clone(), outcome));
            }
        }
        for (identity, outcome) in &outcomes {
            world.apply_reconciliation(identity, *outcome);
        }

        self.played_through = now.checked_sub(1);
        self.stats.rewinds += 1;
        self.stats.replayed_ticks += u64::from(replayed);
        self.collect_garbage(now);

        debug!(
            from = from_tick,
            auth = ?auth_tick,
            to = now,
            replayed,
            applied,
            errors = errors.len(),
            "rewind complete"
        );

        Ok(Some(RewindSummary {
            from_tick,
            authoritative_tick: auth_tick,
            to_tick: now,
            replayed_ticks: replayed,
            applied,
            errors,
            outcomes,
        }))
    }

    /// Re-simulate `from..to`, refreshing records on cadence. Returns the
    /// number of steps taken.
    fn replay<W: RewindWorld + ?Sized>(&mut self, world: &mut W, from: Tick, to: Tick) -> u32 {
        let mut steps = 0;
        for tick in from..to {
            self.apply_events_at(world, tick);
            world.step();
            steps += 1;
            let reached = world.current_tick();
            if reached < to && self.should_save_state(reached) {
                self.save_local_state(world);
            }
        }
        steps
    }

    fn restore_entity<W: RewindWorld + ?Sized>(
        &mut self,
        world: &mut W,
        snapshot: &StateSnapshot,
        source: StateSource,
        errors: &mut Vec<RewindError>,
    ) -> bool {
        let Some(entity) = world.rewinder_mut(&snapshot.identity) else {
            debug!(identity = %snapshot.identity, "state for unknown entity ignored");
            return false;
        };
        match entity.restore_state(&snapshot.data, source) {
            Ok(()) => true,
            Err(source) => {
                self.stats.decode_failures += 1;
                warn!(identity = %snapshot.identity, error = %source, "entity state rejected");
                errors.push(RewindError::Decode {
                    identity: snapshot.identity.clone(),
                    source,
                });
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RaceConfig;
    use crate::game::controls::{KartControlEvent, KartControls};
    use crate::game::events::GameEvent;
    use crate::game::rewinder::Rewindable;
    use crate::game::world::RaceWorld;

    fn config() -> RaceConfig {
        RaceConfig {
            race_now: true,
            ..RaceConfig::default()
        }
    }

    fn manager() -> RewindManager {
        RewindManager::new(RewindConfig {
            state_frequency: 10,
            max_rollback_ticks: 240,
        })
    }

    fn controls(steer: f32, accel: f32) -> KartControls {
        let mut c = KartControls::new();
        c.set_steer(steer);
        c.set_accel(accel);
        c
    }

    /// Input script shared by the reference and predicted worlds.
    fn script(tick: Tick) -> Vec<KartControlEvent> {
        match tick {
            0 => vec![
                KartControlEvent { kart: 0, controls: controls(0.0, 1.0) },
                KartControlEvent { kart: 1, controls: controls(0.0, 0.8) },
            ],
            30 => vec![KartControlEvent { kart: 0, controls: controls(0.4, 1.0) }],
            55 => vec![KartControlEvent { kart: 1, controls: controls(-0.6, 1.0) }],
            _ => Vec::new(),
        }
    }

    /// Step a reference world to `until`, capturing entity states at `capture`.
    fn reference(until: Tick, capture: Tick, skip: Option<Tick>) -> (RaceWorld, Vec<StateSnapshot>) {
        let mut world = RaceWorld::new(&config(), 2);
        let mut captured = Vec::new();
        for tick in 0..until {
            if tick == capture {
                captured = world.save_entities();
            }
            if Some(tick) != skip {
                for e in script(tick) {
                    world.apply_event(&e.into());
                }
            }
            world.step();
        }
        (world, captured)
    }

    /// Predicting side: records history and plays its own timeline.
    fn predicted(until: Tick, skip: Option<Tick>) -> (RaceWorld, RewindManager) {
        let mut world = RaceWorld::new(&config(), 2);
        let mut mgr = manager();
        for tick in 0..until {
            if mgr.should_save_state(tick) {
                mgr.save_local_state(&world);
            }
            if Some(tick) != skip {
                for e in script(tick) {
                    mgr.add_local_event(tick, e);
                }
            }
            mgr.play_events_till(&mut world, tick);
            world.step();
        }
        (world, mgr)
    }

    #[test]
    fn test_should_save_state_cadence() {
        let mgr = manager();
        assert!(mgr.should_save_state(0));
        assert!(!mgr.should_save_state(7));
        assert!(mgr.should_save_state(40));
        let off = RewindManager::new(RewindConfig {
            state_frequency: 0,
            max_rollback_ticks: 10,
        });
        assert!(!off.should_save_state(0));
    }

    #[test]
    fn test_rollback_matches_fresh_simulation() {
        // The predicting side never saw the input at 55; the server did.
        let (server, auth) = reference(100, 97, None);
        let (mut client, mut mgr) = predicted(100, Some(55));
        assert_ne!(client.digest(), server.digest());

        mgr.receive_authoritative_state(97, auth).unwrap();
        assert!(mgr.needs_rewind(client.tick()));
        let summary = mgr.rewind_and_replay(&mut client).unwrap().unwrap();

        assert_eq!(summary.from_tick, 90);
        assert_eq!(summary.authoritative_tick, Some(97));
        assert_eq!(summary.to_tick, 100);
        assert_eq!(summary.replayed_ticks, 10);
        assert_eq!(summary.applied, 2);
        assert!(summary.errors.is_empty());
        assert_eq!(client.tick(), 100);
        assert_eq!(client.digest(), server.digest());
        assert_eq!(mgr.last_applied(), Some(97));
        assert_eq!(mgr.stats().rewinds, 1);
    }

    #[test]
    fn test_stale_state_rejected_after_newer() {
        let (_, auth) = reference(100, 97, None);
        let (_, older) = reference(100, 87, None);
        let (mut client, mut mgr) = predicted(100, None);

        mgr.receive_authoritative_state(97, auth).unwrap();
        mgr.rewind_and_replay(&mut client).unwrap();
        let before = client.digest();

        let err = mgr.receive_authoritative_state(87, older).unwrap_err();
        assert_eq!(
            err,
            RewindError::StaleSnapshot {
                tick: 87,
                reason: StaleReason::AlreadyApplied
            }
        );
        assert!(mgr.receive_authoritative_state(97, Vec::new()).is_err());
        assert_eq!(mgr.stats().stale_snapshots, 2);
        assert!(!mgr.needs_rewind(client.tick()));
        assert_eq!(client.digest(), before);
    }

    #[test]
    fn test_newer_pending_state_supersedes() {
        let mut mgr = manager();
        mgr.receive_authoritative_state(120, Vec::new()).unwrap();
        let err = mgr.receive_authoritative_state(110, Vec::new()).unwrap_err();
        assert!(matches!(
            err,
            RewindError::StaleSnapshot {
                reason: StaleReason::Superseded,
                ..
            }
        ));
        mgr.receive_authoritative_state(130, Vec::new()).unwrap();
        assert_eq!(mgr.pending_tick(), Some(130));
    }

    #[test]
    fn test_future_state_parked_until_reached() {
        let (_, auth) = reference(100, 60, None);
        let (mut client, mut mgr) = predicted(50, None);

        mgr.receive_authoritative_state(60, auth).unwrap();
        assert!(!mgr.needs_rewind(client.tick()));
        assert_eq!(mgr.rewind_and_replay(&mut client).unwrap(), None);
        assert_eq!(mgr.pending_tick(), Some(60));

        for tick in 50..60 {
            if mgr.should_save_state(tick) {
                mgr.save_local_state(&client);
            }
            mgr.play_events_till(&mut client, tick);
            client.step();
        }
        assert!(mgr.needs_rewind(client.tick()));
        let summary = mgr.rewind_and_replay(&mut client).unwrap().unwrap();
        assert_eq!(summary.authoritative_tick, Some(60));
        assert_eq!(client.tick(), 60);
    }

    #[test]
    fn test_late_network_event_replays() {
        let (server, _) = reference(80, 0, None);
        let (mut client, mut mgr) = predicted(80, Some(55));

        let late = script(55)[0];
        assert!(mgr.add_network_event(55, late));
        assert_eq!(mgr.stats().late_events, 1);
        assert!(mgr.needs_rewind(client.tick()));

        let summary = mgr.rewind_and_replay(&mut client).unwrap().unwrap();
        assert_eq!(summary.from_tick, 50);
        assert_eq!(summary.authoritative_tick, None);
        assert_eq!(summary.replayed_ticks, 30);
        assert!(summary.outcomes.is_empty());
        assert_eq!(client.digest(), server.digest());
        assert_eq!(client.kart(0).unwrap().missed_server_states(), 0);
    }

    /// Reference world that also plays `game` at its tick.
    fn reference_with(until: Tick, capture: Tick, game: (Tick, GameEvent)) -> (RaceWorld, Vec<StateSnapshot>) {
        let mut world = RaceWorld::new(&config(), 2);
        let mut captured = Vec::new();
        for tick in 0..until {
            if tick == capture {
                captured = world.save_entities();
            }
            for e in script(tick) {
                world.apply_event(&e.into());
            }
            if tick == game.0 {
                world.apply_game_event(&game.1);
            }
            world.step();
        }
        (world, captured)
    }

    /// Predicting side that is told about `game` when it reaches `arrival`.
    fn predicted_with(until: Tick, game: (Tick, GameEvent), arrival: Tick) -> (RaceWorld, RewindManager) {
        let mut world = RaceWorld::new(&config(), 2);
        let mut mgr = manager();
        for tick in 0..until {
            if tick == arrival {
                assert!(mgr.add_network_event(game.0, game.1));
            }
            if mgr.needs_rewind(tick) {
                mgr.rewind_and_replay(&mut world).unwrap();
            }
            if mgr.should_save_state(tick) {
                mgr.save_local_state(&world);
            }
            for e in script(tick) {
                mgr.add_local_event(tick, e);
            }
            mgr.play_events_till(&mut world, tick);
            world.step();
        }
        (world, mgr)
    }

    #[test]
    fn test_finish_survives_rollback_to_older_state() {
        let finish = (200, GameEvent::KartFinishedRace { kart: 0, time: 42.0 });
        let (server, auth) = reference_with(210, 195, finish);
        let (mut client, mut mgr) = predicted_with(210, finish, 200);
        assert_eq!(client.kart(0).unwrap().finish_time(), Some(42.0));

        mgr.receive_authoritative_state(195, auth).unwrap();
        let summary = mgr.rewind_and_replay(&mut client).unwrap().unwrap();
        assert_eq!(summary.authoritative_tick, Some(195));

        let kart = client.kart(0).unwrap();
        assert!(kart.is_finished());
        assert_eq!(kart.finish_time(), Some(42.0));
        assert_eq!(client.results(), vec![(0, 42.0)]);
        assert_eq!(client.digest(), server.digest());
    }

    #[test]
    fn test_disconnect_not_reinstated_by_older_state() {
        let gone = (200, GameEvent::PlayerDisconnected { kart: 1 });
        let (server, auth) = reference_with(210, 195, gone);
        assert!(auth.iter().any(|s| s.identity == "K1"));
        let (mut client, mut mgr) = predicted_with(210, gone, 200);
        assert!(client.kart(1).unwrap().is_retired());

        mgr.receive_authoritative_state(195, auth).unwrap();
        let summary = mgr.rewind_and_replay(&mut client).unwrap().unwrap();

        assert!(summary.outcomes.is_empty());
        let kart = client.kart(1).unwrap();
        assert!(kart.is_retired() && kart.is_eliminated());
        assert!(!kart.is_hidden());
        assert!(kart.is_finished());
        assert_eq!(client.digest(), server.digest());
    }

    #[test]
    fn test_late_game_event_replays() {
        let finish = (200, GameEvent::KartFinishedRace { kart: 1, time: 41.5 });
        let (server, _) = reference_with(210, 0, finish);
        let (mut client, mut mgr) = predicted_with(210, finish, Tick::MAX);
        assert!(!client.kart(1).unwrap().is_finished());

        assert!(mgr.add_network_event(finish.0, finish.1));
        assert!(mgr.needs_rewind(client.tick()));

        let summary = mgr.rewind_and_replay(&mut client).unwrap().unwrap();
        assert_eq!(summary.from_tick, 200);
        assert_eq!(client.kart(1).unwrap().finish_time(), Some(41.5));
        assert_eq!(client.digest(), server.digest());
        assert_eq!(mgr.stats().late_events, 1);
    }

    #[test]
    fn test_randomized_late_inputs_converge() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        const TICKS: Tick = 150;
        let mut rng = StdRng::seed_from_u64(7);

        // (tick, event, arrival tick); kart 0 is local, kart 1 arrives late.
        let mut timeline: Vec<(Tick, KartControlEvent, Tick)> = Vec::new();
        for tick in 0..TICKS {
            for kart in 0..2u8 {
                if tick == 0 || rng.gen_bool(0.1) {
                    let c = controls(rng.gen_range(-1.0..=1.0), rng.gen_range(0.0..=1.0));
                    let delay: Tick = if kart == 0 { 0 } else { rng.gen_range(1..=20) };
                    timeline.push((tick, KartControlEvent { kart, controls: c }, tick + delay));
                }
            }
        }

        let mut server = RaceWorld::new(&config(), 2);
        for tick in 0..TICKS {
            for (_, e, _) in timeline.iter().filter(|(t, _, _)| *t == tick) {
                server.apply_event(&(*e).into());
            }
            server.step();
        }

        let mut client = RaceWorld::new(&config(), 2);
        let mut mgr = manager();
        for now in 0..TICKS {
            for (tick, e, arrival) in &timeline {
                if *arrival != now {
                    continue;
                }
                if *tick == now {
                    mgr.add_local_event(*tick, *e);
                } else {
                    assert!(mgr.add_network_event(*tick, *e));
                }
            }
            if mgr.needs_rewind(now) {
                mgr.rewind_and_replay(&mut client).unwrap();
            }
            if mgr.should_save_state(now) {
                mgr.save_local_state(&client);
            }
            mgr.play_events_till(&mut client, now);
            client.step();
        }
        for (tick, e, arrival) in &timeline {
            if *arrival >= TICKS {
                assert!(mgr.add_network_event(*tick, *e));
            }
        }
        if mgr.needs_rewind(client.tick()) {
            mgr.rewind_and_replay(&mut client).unwrap();
        }

        assert_eq!(client.tick(), TICKS);
        assert_eq!(client.digest(), server.digest());
        assert!(mgr.stats().rewinds > 0);
    }

    #[test]
    fn test_events_played_once_in_tick_order() {
        let mut world = RaceWorld::new(&config(), 1);
        let mut mgr = manager();
        mgr.add_local_event(3, KartControlEvent { kart: 0, controls: controls(0.5, 1.0) });
        mgr.add_local_event(1, KartControlEvent { kart: 0, controls: controls(-0.5, 1.0) });
        mgr.add_local_event(3, KartControlEvent { kart: 0, controls: controls(1.0, 0.0) });

        mgr.play_events_till(&mut world, 2);
        assert_eq!(world.kart(0).unwrap().controls(), controls(-0.5, 1.0));
        mgr.play_events_till(&mut world, 3);
        assert_eq!(world.kart(0).unwrap().controls(), controls(1.0, 0.0));
        assert_eq!(mgr.events_at(3).len(), 2);

        world.set_controls(0, KartControls::new());
        mgr.play_events_till(&mut world, 3);
        assert_eq!(world.kart(0).unwrap().controls(), KartControls::new());
    }

    #[test]
    fn test_decode_failure_keeps_local_state() {
        let (_, mut auth) = reference(100, 97, None);
        let (mut client, mut mgr) = predicted(100, None);
        let k0_before = client.kart(0).unwrap().state().clone();

        for snap in &mut auth {
            if snap.identity == "K0" {
                snap.data.truncate(3);
            }
        }
        mgr.receive_authoritative_state(97, auth).unwrap();
        let summary = mgr.rewind_and_replay(&mut client).unwrap().unwrap();

        assert_eq!(summary.applied, 1);
        assert_eq!(summary.errors.len(), 1);
        assert!(matches!(&summary.errors[0], RewindError::Decode { identity, .. } if identity == "K0"));
        assert_eq!(mgr.stats().decode_failures, 1);
        assert!(client.kart(0).unwrap().state().bits_eq(&k0_before));
        assert_eq!(client.tick(), 100);
    }

    #[test]
    fn test_history_garbage_collected() {
        let mut world = RaceWorld::new(&config(), 1);
        let mut mgr = RewindManager::new(RewindConfig {
            state_frequency: 10,
            max_rollback_ticks: 40,
        });
        for tick in 0..=100 {
            if mgr.should_save_state(tick) {
                mgr.save_local_state(&world);
            }
            mgr.add_local_event(tick, KartControlEvent { kart: 0, controls: controls(0.0, 1.0) });
            mgr.play_events_till(&mut world, tick);
            world.step();
        }
        assert_eq!(mgr.oldest_record(), Some(60));
        assert_eq!(mgr.latest_record(), Some(100));
        assert_eq!(mgr.history_len(), 5);
        assert!(mgr.events_at(59).is_empty());
        assert_eq!(mgr.events_at(60).len(), 1);

        let err = mgr.receive_authoritative_state(55, Vec::new()).unwrap_err();
        assert!(matches!(
            err,
            RewindError::StaleSnapshot {
                reason: StaleReason::BelowHistory,
                ..
            }
        ));
        let stale_event = KartControlEvent { kart: 0, controls: KartControls::new() };
        assert!(!mgr.add_network_event(20, stale_event));
    }

    #[test]
    fn test_missing_entity_counts_as_missed() {
        let (_, auth) = reference(100, 97, None);
        let (mut client, mut mgr) = predicted(100, None);
        let only_k1: Vec<_> = auth.into_iter().filter(|s| s.identity == "K1").collect();

        mgr.receive_authoritative_state(97, only_k1).unwrap();
        let summary = mgr.rewind_and_replay(&mut client).unwrap().unwrap();
        assert!(summary.outcomes.is_empty());
        assert_eq!(client.kart(0).unwrap().missed_server_states(), 1);
        assert_eq!(client.kart(1).unwrap().missed_server_states(), 0);
    }

    #[test]
    fn test_forget_peer_states() {
        let mut mgr = manager();
        mgr.receive_authoritative_state(50, Vec::new()).unwrap();
        mgr.forget_peer_states();
        assert_eq!(mgr.pending_tick(), None);
        assert!(!mgr.needs_rewind(100));
    }

    #[test]
    fn test_rewind_without_history_fails_cleanly() {
        let mut world = RaceWorld::new(&config(), 1);
        for _ in 0..20 {
            world.step();
        }
        let mut mgr = manager();
        mgr.receive_authoritative_state(5, Vec::new()).unwrap();
        let err = mgr.rewind_and_replay(&mut world).unwrap_err();
        assert!(matches!(err, RewindError::StaleSnapshot { tick: 5, .. }));
        assert_eq!(world.tick(), 20);
        assert_eq!(world.kart(0).unwrap().identity(), "K0");
    }
}
