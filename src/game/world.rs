//! Race World
//!
//! Owns the clock and the karts. One `step()` is one fixed tick:
//!
//! 1. Re-check race over (a rollback may have restored finish flags), then
//!    advance the clock (phase FSM).
//! 2. Once the synchronized start is reached, step every kart in id order
//!    and resolve kart-kart bumps using current-tick state only.
//! 3. Advance the world tick.

use tracing::{debug, info};

use crate::config::RaceConfig;
use crate::core::buffer::{BufferError, StateReader, StateWriter};
use crate::core::hash::{compute_world_hash, StateHash};
use crate::core::math::{Quat, Transform, Vec3};
use crate::game::clock::{Phase, Tick, WorldClock, CLOCK_STATE_SIZE};
use crate::game::controls::{KartControls, KartId};
use crate::game::events::{GameEvent, TimelineEvent};
use crate::game::kart::{Kart, KART_RADIUS};
use crate::game::rewinder::{
    ReconcilePolicy, Reconciliation, Rewindable, RewindWorld, RewinderRegistry, StateSnapshot,
};

/// Grid spacing between karts.
const GRID_LATERAL: f32 = 3.0;
const GRID_BACK: f32 = 4.0;

/// The simulated race.
#[derive(Debug, Clone)]
pub struct RaceWorld {
    clock: WorldClock,
    karts: Vec<Kart>,
    registry: RewinderRegistry,
    tick: Tick,
    policy: ReconcilePolicy,
}

impl RaceWorld {
    /// Create a world with `num_karts` karts on a two-wide start grid.
    pub fn new(config: &RaceConfig, num_karts: u8) -> Self {
        let clock = WorldClock::new(config.clock_config(), config.network_mode);
        let mut karts = Vec::with_capacity(num_karts as usize);
        let mut registry = RewinderRegistry::new();
        for id in 0..num_karts {
            let column = (id % 2) as f32;
            let row = (id / 2) as f32;
            let start = Transform::new(
                Vec3::new(column * GRID_LATERAL - GRID_LATERAL * 0.5, 0.0, -row * GRID_BACK),
                Quat::IDENTITY,
            );
            let kart = Kart::new(id, start, config.ticks_per_second);
            registry.register(kart.identity().to_owned(), karts.len());
            karts.push(kart);
        }
        Self {
            clock,
            karts,
            registry,
            tick: 0,
            policy: config.reconcile_policy(),
        }
    }

    /// Ticks since the synchronized start.
    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// The race clock.
    pub fn clock(&self) -> &WorldClock {
        &self.clock
    }

    /// Mutable race clock.
    pub fn clock_mut(&mut self) -> &mut WorldClock {
        &mut self.clock
    }

    /// Active phase.
    pub fn phase(&self) -> Phase {
        self.clock.phase()
    }

    /// Reconciliation policy.
    pub fn policy(&self) -> &ReconcilePolicy {
        &self.policy
    }

    /// All karts in id order.
    pub fn karts(&self) -> &[Kart] {
        &self.karts
    }

    /// Number of karts.
    pub fn num_karts(&self) -> usize {
        self.karts.len()
    }

    /// Kart by id.
    pub fn kart(&self, id: KartId) -> Option<&Kart> {
        self.karts.get(id as usize)
    }

    /// Mutable kart by id.
    pub fn kart_mut(&mut self, id: KartId) -> Option<&mut Kart> {
        self.karts.get_mut(id as usize)
    }

    /// Set a kart's controls. Returns false for an unknown kart.
    pub fn set_controls(&mut self, id: KartId, controls: KartControls) -> bool {
        match self.kart_mut(id) {
            Some(kart) => {
                kart.set_controls(controls);
                true
            }
            None => false,
        }
    }

    /// True once every kart is done.
    pub fn is_race_over(&self) -> bool {
        self.clock.is_race_over()
    }

    // =========================================================================
    // RACE OUTCOMES
    // =========================================================================

    /// Mark a kart finished. `None` for an unknown kart, `Some(false)` if it
    /// had already finished.
    pub fn finish_kart(&mut self, id: KartId, time: f32) -> Option<bool> {
        let kart = self.karts.get_mut(id as usize)?;
        if !kart.finish(time) {
            return Some(false);
        }
        info!(kart = id, time, "kart finished");
        self.check_race_over();
        Some(true)
    }

    /// Retire a kart whose driver left: eliminated for good, with the current
    /// race time as its finish time. `None` for an unknown kart,
    /// `Some(false)` if it was already retired.
    pub fn retire_kart(&mut self, id: KartId) -> Option<bool> {
        let time = self.clock.time();
        let tick = self.tick;
        let kart = self.karts.get_mut(id as usize)?;
        if !kart.retire(tick, time) {
            return Some(false);
        }
        info!(kart = id, tick, time, "kart retired");
        self.check_race_over();
        Some(true)
    }

    /// Apply a server-decided game event. Applying the same event twice
    /// changes nothing. `None` for an unknown kart.
    pub fn apply_game_event(&mut self, event: &GameEvent) -> Option<bool> {
        match *event {
            GameEvent::KartFinishedRace { kart, time } => self.finish_kart(kart, time),
            GameEvent::PlayerDisconnected { kart } => self.retire_kart(kart),
        }
    }

    /// Eliminate a kart. `None` for an unknown kart, `Some(false)` if it was
    /// already eliminated.
    pub fn eliminate_kart(&mut self, id: KartId) -> Option<bool> {
        let kart = self.karts.get_mut(id as usize)?;
        if !kart.eliminate() {
            return Some(false);
        }
        info!(kart = id, tick = self.tick, "kart eliminated");
        self.check_race_over();
        Some(true)
    }

    /// Finished karts ordered by finish time, ties by id.
    pub fn results(&self) -> Vec<(KartId, f32)> {
        let mut results: Vec<(KartId, f32)> = self
            .karts
            .iter()
            .filter_map(|k| k.finish_time().map(|t| (k.id(), t)))
            .collect();
        results.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        results
    }

    fn check_race_over(&mut self) {
        if self.clock.phase() != Phase::Race {
            return;
        }
        let all_done = self
            .karts
            .iter()
            .all(|k| k.is_eliminated() || k.is_finished());
        if all_done {
            info!(tick = self.tick, "all karts done");
            self.clock.enter_race_over();
        }
    }

    // =========================================================================
    // SIMULATION
    // =========================================================================

    /// Run one fixed step.
    pub fn step(&mut self) {
        if self.clock.is_paused() {
            return;
        }
        self.check_race_over();
        self.clock.update(1);
        if !self.clock.has_started() {
            return;
        }
        if self.clock.karts_can_move() {
            for kart in &mut self.karts {
                kart.step(self.tick);
            }
            self.resolve_bumps();
        }
        self.tick += 1;
    }

    fn resolve_bumps(&mut self) {
        let min_dist_sq = (2.0 * KART_RADIUS) * (2.0 * KART_RADIUS);
        for i in 0..self.karts.len() {
            for j in (i + 1)..self.karts.len() {
                let (left, right) = self.karts.split_at_mut(j);
                let a = &mut left[i];
                let b = &mut right[0];
                if !a.is_solid() || !b.is_solid() {
                    continue;
                }
                let d = a.transform().origin - b.transform().origin;
                let dist_sq = d.length_squared();
                if dist_sq >= min_dist_sq {
                    continue;
                }
                let normal = if dist_sq > 0.0 {
                    d.scale(1.0 / dist_sq.sqrt())
                } else {
                    Vec3::new(1.0, 0.0, 0.0)
                };
                debug!(a = a.id(), b = b.id(), tick = self.tick, "kart bump");
                a.bump(normal);
                b.bump(-normal);
            }
        }
    }

    /// Advance cosmetic smoothing once per rendered tick.
    pub fn update_graphics(&mut self) {
        for kart in &mut self.karts {
            kart.update_graphics();
        }
    }

    /// Digest of the deterministic world state.
    pub fn digest(&self) -> StateHash {
        compute_world_hash(self.tick, |h| {
            let mut clock = StateWriter::with_capacity(CLOCK_STATE_SIZE);
            self.clock.save_state(&mut clock);
            h.update_bytes(clock.as_bytes());
            for kart in &self.karts {
                h.update_str(kart.identity());
                match kart.save_state() {
                    Some(snap) => h.update_bytes(&snap.data),
                    None => h.update_u8(0xEE),
                }
            }
        })
    }
}

impl RewindWorld for RaceWorld {
    fn current_tick(&self) -> Tick {
        self.tick
    }

    fn save_local(&self) -> Vec<u8> {
        let mut w = StateWriter::with_capacity(4 + CLOCK_STATE_SIZE);
        w.add_u32(self.tick);
        self.clock.save_state(&mut w);
        w.into_bytes()
    }

    fn restore_local(&mut self, data: &[u8]) -> Result<(), BufferError> {
        let mut r = StateReader::new(data);
        let tick = r.get_u32()?;
        self.clock.restore_state(&mut r)?;
        self.tick = tick;
        for kart in &mut self.karts {
            if kart.unretire_since(tick) {
                debug!(kart = kart.id(), tick, "retirement undone by rollback");
            }
        }
        Ok(())
    }

    fn save_entities(&self) -> Vec<StateSnapshot> {
        self.karts.iter().filter_map(|k| k.save_state()).collect()
    }

    fn identities(&self) -> Vec<String> {
        self.registry.identities().map(str::to_owned).collect()
    }

    fn rewinder_mut(&mut self, identity: &str) -> Option<&mut dyn Rewindable> {
        let slot = self.registry.slot(identity)?;
        self.karts.get_mut(slot).map(|k| k as &mut dyn Rewindable)
    }

    fn apply_event(&mut self, event: &TimelineEvent) {
        match event {
            TimelineEvent::Controls(e) => {
                self.set_controls(e.kart, e.controls);
            }
            TimelineEvent::Game(e) => {
                if self.apply_game_event(e).is_none() {
                    debug!(kart = e.kart(), "game event for unknown kart ignored");
                }
            }
        }
    }

    fn step(&mut self) {
        RaceWorld::step(self);
    }

    fn set_replaying(&mut self, replaying: bool) {
        self.clock.set_notices_muted(replaying);
    }

    fn reconcile_policy(&self) -> ReconcilePolicy {
        self.policy.clone()
    }

    fn apply_reconciliation(&mut self, identity: &str, outcome: Reconciliation) {
        let Some(slot) = self.registry.slot(identity) else {
            return;
        };
        let Some(id) = self.karts.get(slot).map(Kart::id) else {
            return;
        };
        match outcome {
            Reconciliation::Unchanged => {}
            Reconciliation::Eliminate => {
                self.eliminate_kart(id);
            }
            Reconciliation::Reinstate => {
                if let Some(kart) = self.kart_mut(id) {
                    kart.reinstate();
                    info!(kart = id, "kart reinstated");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::kart::KartState;

    fn race_config() -> RaceConfig {
        RaceConfig {
            race_now: true,
            ..RaceConfig::default()
        }
    }

    fn full_throttle() -> KartControls {
        let mut c = KartControls::new();
        c.set_accel(1.0);
        c
    }

    #[test]
    fn test_grid_positions() {
        let world = RaceWorld::new(&RaceConfig::default(), 4);
        let origins: Vec<Vec3> = world.karts().iter().map(|k| k.transform().origin).collect();
        assert_eq!(origins[0], Vec3::new(-1.5, 0.0, 0.0));
        assert_eq!(origins[1], Vec3::new(1.5, 0.0, 0.0));
        assert_eq!(origins[3], Vec3::new(1.5, 0.0, -4.0));
        assert_eq!(world.identities(), vec!["K0", "K1", "K2", "K3"]);
    }

    #[test]
    fn test_tick_counts_from_ready() {
        let mut world = RaceWorld::new(&RaceConfig::default(), 2);
        for _ in 0..360 {
            world.step();
        }
        assert_eq!(world.phase(), Phase::Ready);
        assert_eq!(world.tick(), 1);
        for _ in 0..240 {
            world.step();
        }
        assert_eq!(world.phase(), Phase::Go);
        assert_eq!(world.tick(), 241);
    }

    #[test]
    fn test_karts_wait_for_go() {
        let mut world = RaceWorld::new(&RaceConfig::default(), 1);
        world.set_controls(0, full_throttle());
        for _ in 0..599 {
            world.step();
        }
        assert_eq!(world.kart(0).unwrap().transform().origin.z, 0.0);
        world.step();
        assert_eq!(world.phase(), Phase::Go);
        assert!(world.kart(0).unwrap().transform().origin.z > 0.0);
    }

    #[test]
    fn test_pause_freezes_world() {
        let mut world = RaceWorld::new(&race_config(), 1);
        world.set_controls(0, full_throttle());
        for _ in 0..10 {
            world.step();
        }
        let tick = world.tick();
        let pos = world.kart(0).unwrap().transform();
        world.clock_mut().pause(Phase::InGameMenu);
        for _ in 0..10 {
            world.step();
        }
        assert_eq!(world.tick(), tick);
        assert!(world.kart(0).unwrap().transform().bits_eq(&pos));
    }

    #[test]
    fn test_all_finished_ends_race() {
        let mut world = RaceWorld::new(&race_config(), 3);
        for _ in 0..130 {
            world.step();
        }
        assert_eq!(world.phase(), Phase::Race);

        assert_eq!(world.finish_kart(1, 30.0), Some(true));
        assert_eq!(world.finish_kart(1, 31.0), Some(false));
        assert_eq!(world.eliminate_kart(2), Some(true));
        assert!(!world.is_race_over());
        assert_eq!(world.finish_kart(0, 32.5), Some(true));
        assert!(world.is_race_over());

        assert_eq!(world.results(), vec![(1, 30.0), (0, 32.5)]);
        assert_eq!(world.finish_kart(9, 1.0), None);
    }

    #[test]
    fn test_game_events_are_idempotent() {
        let mut world = RaceWorld::new(&race_config(), 2);
        for _ in 0..130 {
            world.step();
        }
        let finish = GameEvent::KartFinishedRace { kart: 0, time: 12.0 };
        assert_eq!(world.apply_game_event(&finish), Some(true));
        assert_eq!(world.apply_game_event(&finish), Some(false));
        assert_eq!(world.kart(0).unwrap().finish_time(), Some(12.0));

        let left = GameEvent::PlayerDisconnected { kart: 1 };
        assert_eq!(world.apply_game_event(&left), Some(true));
        assert_eq!(world.apply_game_event(&left), Some(false));
        assert!(world.kart(1).unwrap().is_retired());
        assert_eq!(world.apply_game_event(&GameEvent::PlayerDisconnected { kart: 5 }), None);
        assert!(world.is_race_over());
    }

    #[test]
    fn test_retired_kart_gets_race_time_as_finish() {
        let mut world = RaceWorld::new(&race_config(), 2);
        for _ in 0..250 {
            world.step();
        }
        let now = world.clock().time();
        assert!(now > 0.0);
        assert_eq!(world.retire_kart(1), Some(true));
        assert_eq!(world.kart(1).unwrap().finish_time(), Some(now));
        assert_eq!(world.results(), vec![(1, now)]);
    }

    #[test]
    fn test_rollback_undoes_later_retirement_only() {
        let mut world = RaceWorld::new(&race_config(), 3);
        for _ in 0..10 {
            world.step();
        }
        world.retire_kart(2);
        world.step();
        let record = world.save_local();
        for _ in 0..10 {
            world.step();
        }
        world.retire_kart(1);

        world.restore_local(&record).unwrap();
        assert!(!world.kart(1).unwrap().is_eliminated());
        assert!(world.kart(2).unwrap().is_retired());
    }

    #[test]
    fn test_bump_pushes_karts_apart() {
        let mut world = RaceWorld::new(&race_config(), 2);
        world.kart_mut(0).unwrap().state_mut().transform.origin = Vec3::new(-0.5, 0.0, 0.0);
        world.kart_mut(1).unwrap().state_mut().transform.origin = Vec3::new(0.5, 0.0, 0.0);
        world.step();
        let a = world.kart(0).unwrap().state();
        let b = world.kart(1).unwrap().state();
        assert!(a.bounce_back_ticks > 0 && b.bounce_back_ticks > 0);
        assert!(a.additional_impulse.x < 0.0);
        assert!(b.additional_impulse.x > 0.0);
    }

    #[test]
    fn test_local_record_roundtrip() {
        let mut world = RaceWorld::new(&RaceConfig::default(), 2);
        for _ in 0..700 {
            world.step();
        }
        let record = world.save_local();
        let (tick, phase) = (world.tick(), world.phase());
        for _ in 0..300 {
            world.step();
        }
        world.restore_local(&record).unwrap();
        assert_eq!(world.tick(), tick);
        assert_eq!(world.phase(), phase);
        assert!(world.restore_local(&record[..3]).is_err());
        assert_eq!(world.tick(), tick);
    }

    #[test]
    fn test_lookup_by_identity() {
        let mut world = RaceWorld::new(&race_config(), 2);
        assert!(world.rewinder_mut("K1").is_some());
        assert!(world.rewinder_mut("K7").is_none());
    }

    #[test]
    fn test_reconciliation_outcomes() {
        let mut world = RaceWorld::new(&race_config(), 2);
        world.apply_reconciliation("K1", Reconciliation::Eliminate);
        assert!(world.kart(1).unwrap().is_eliminated());
        assert_eq!(world.save_entities().len(), 1);

        world.apply_reconciliation("K1", Reconciliation::Reinstate);
        let kart = world.kart(1).unwrap();
        assert!(!kart.is_eliminated());
        assert!(kart.is_hidden());
    }

    #[test]
    fn test_digest_tracks_state() {
        let mut a = RaceWorld::new(&race_config(), 2);
        let mut b = RaceWorld::new(&race_config(), 2);
        for _ in 0..20 {
            a.step();
            b.step();
        }
        assert_eq!(a.digest(), b.digest());
        *b.kart_mut(0).unwrap().state_mut() = KartState::default();
        assert_ne!(a.digest(), b.digest());
    }
}
