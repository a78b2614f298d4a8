//! Kart Entity
//!
//! Deterministic kart state, a small fixed-step kinematic model, and the
//! snapshot encoding used for rollback.
//!
//! Snapshot layout (little-endian, in order):
//! ```text
//! bubblegum_ticks u16
//! flags           u16   KartFlags: fire | animation | plunger | invulnerable
//! plunger_ticks   u16   only if the plunger flag is set
//! origin          vec3  \ while an animation runs this is the
//! rotation        quat  / animation's end transform
//! animation       u32   AnimationWord, only if the animation flag is set
//! linear_vel      vec3
//! angular_vel     vec3
//! timed_rot_ticks u16,  timed_rotation f32
//! bounce_back     u16,  central_impulse u16, additional_impulse vec3
//! controls        5 bytes (see controls.rs)
//! attachment      kind u8, ticks u16
//! powerup         kind u8, count u8
//! energy          f32
//! speed_boost     u16
//! skidding        state u8, skid_time f32
//! finish          finished u8, finish_time f32
//! ```
//!
//! Cosmetic state (visual smoothing, steering smoothing) is never written.

use tracing::{debug, info};

use crate::core::bits::{AnimationWord, KartFlags};
use crate::core::buffer::{BufferError, StateReader, StateWriter};
use crate::core::math::{Quat, Transform, Vec3};
use crate::game::clock::Tick;
use crate::game::controls::{KartControls, KartId, SkidControl};
use crate::game::rewinder::{ReconcilePolicy, Reconciliation, Rewindable, StateSnapshot, StateSource};
use crate::game::smoothing::{ErrorSmoothing, SteeringSmoothing};

/// Upper bound on a kart snapshot.
pub const KART_STATE_CAPACITY: usize = 2 + 2 + 2 // gum, flags, plunger
    + 12 + 16 + 4 // transform, animation word
    + 12 + 12 // velocities
    + 2 + 4 // timed rotation
    + 2 + 2 + 12 // collision
    + 5 // controls
    + 3 + 2 + 4 // attachment, powerup, energy
    + 2 // speed boost
    + 1 + 4 // skidding
    + 1 + 4; // finish

// =============================================================================
// TUNING
// =============================================================================

const ENGINE_ACCEL: f32 = 18.0;
const BRAKE_ACCEL: f32 = 30.0;
const NITRO_ACCEL: f32 = 12.0;
const NITRO_USE_PER_SEC: f32 = 1.0;
const DRAG: f32 = 0.4;
const MAX_SPEED: f32 = 25.0;
const MAX_REVERSE_SPEED: f32 = 6.0;
const NITRO_SPEED_BONUS: f32 = 5.0;
const SKID_BOOST_SPEED_BONUS: f32 = 4.0;
const TURN_RATE: f32 = 2.2;
const SKID_TURN_FACTOR: f32 = 1.5;
const SKID_MIN_SPEED: f32 = 5.0;
const SKID_BONUS_TIME: f32 = 1.0;
const SKID_BOOST_TIME: f32 = 1.0;
const FINISHED_ACCEL: f32 = 0.3;

const RESCUE_TIME: f32 = 1.5;
const EXPLOSION_TIME: f32 = 2.0;
const INVULNERABLE_AFTER_ANIMATION: f32 = 2.0;
const BUBBLEGUM_TIME: f32 = 1.0;
const BUBBLEGUM_SPEED_FACTOR: f32 = 0.5;

const BOUNCE_BACK_TIME: f32 = 0.25;
const BUMP_IMPULSE_TIME: f32 = 0.125;
const BUMP_IMPULSE: f32 = 4.0;

/// Collision radius used for kart-kart bumps.
pub const KART_RADIUS: f32 = 0.75;

// =============================================================================
// SUB-STATES
// =============================================================================

/// Kart animation types carried in the animation word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnimationKind {
    /// Put back on track.
    Rescue,
    /// Hit directly by an explosive.
    ExplosionDirectHit,
    /// Caught in an explosion.
    Explosion,
}

impl AnimationKind {
    fn to_u8(self) -> u8 {
        match self {
            AnimationKind::Rescue => 0,
            AnimationKind::ExplosionDirectHit => 1,
            AnimationKind::Explosion => 2,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AnimationKind::Rescue),
            1 => Some(AnimationKind::ExplosionDirectHit),
            2 => Some(AnimationKind::Explosion),
            _ => None,
        }
    }
}

/// A running kart animation. The kart already sits at the end transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KartAnimation {
    /// Animation type.
    pub kind: AnimationKind,
    /// World tick at which control returns to the kart.
    pub end_ticks: u32,
}

/// Attachment carried by a kart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachmentKind {
    /// Nothing attached.
    #[default]
    None,
    /// Slows the kart.
    Parachute,
    /// Explodes when the timer runs out.
    Bomb,
    /// Slows the kart heavily.
    Anvil,
    /// Swatter.
    Swatter,
    /// Bubble shield.
    BubbleShield,
}

impl AttachmentKind {
    fn to_u8(self) -> u8 {
        match self {
            AttachmentKind::None => 0,
            AttachmentKind::Parachute => 1,
            AttachmentKind::Bomb => 2,
            AttachmentKind::Anvil => 3,
            AttachmentKind::Swatter => 4,
            AttachmentKind::BubbleShield => 5,
        }
    }

    fn from_u8(value: u8) -> Result<Self, BufferError> {
        Ok(match value {
            0 => AttachmentKind::None,
            1 => AttachmentKind::Parachute,
            2 => AttachmentKind::Bomb,
            3 => AttachmentKind::Anvil,
            4 => AttachmentKind::Swatter,
            5 => AttachmentKind::BubbleShield,
            other => {
                return Err(BufferError::InvalidValue {
                    field: "attachment",
                    value: other as u32,
                })
            }
        })
    }
}

/// Attachment and its remaining time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attachment {
    /// What is attached.
    pub kind: AttachmentKind,
    /// Ticks left.
    pub ticks: u16,
}

/// Collected powerup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Powerup {
    /// Powerup type (0 = none).
    pub kind: u8,
    /// Uses left.
    pub count: u8,
}

/// Skid state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SkidState {
    /// Not skidding.
    #[default]
    None,
    /// Skidding left.
    Left,
    /// Skidding right.
    Right,
}

impl SkidState {
    fn to_u8(self) -> u8 {
        match self {
            SkidState::None => 0,
            SkidState::Left => 1,
            SkidState::Right => 2,
        }
    }

    fn from_u8(value: u8) -> Result<Self, BufferError> {
        Ok(match value {
            0 => SkidState::None,
            1 => SkidState::Left,
            2 => SkidState::Right,
            other => {
                return Err(BufferError::InvalidValue {
                    field: "skid_state",
                    value: other as u32,
                })
            }
        })
    }
}

// =============================================================================
// DETERMINISTIC STATE
// =============================================================================

/// Every field a kart snapshot covers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KartState {
    /// Ticks of bubblegum slowdown left.
    pub bubblegum_ticks: u16,
    /// Fire was held last tick.
    pub fire_clicked: bool,
    /// Ticks of invulnerability left (at most 8191).
    pub invulnerable_ticks: u16,
    /// Ticks the view stays blocked by a plunger.
    pub plunger_ticks: u16,
    /// Running animation.
    pub animation: Option<KartAnimation>,
    /// Physics transform.
    pub transform: Transform,
    /// Linear velocity.
    pub linear_velocity: Vec3,
    /// Angular velocity.
    pub angular_velocity: Vec3,
    /// Ticks of forced rotation left.
    pub timed_rotation_ticks: u16,
    /// Forced yaw rate (rad/s).
    pub timed_rotation: f32,
    /// Ticks during which throttle is ignored after a bump.
    pub bounce_back_ticks: u16,
    /// Ticks the additional impulse still applies.
    pub central_impulse_ticks: u16,
    /// Velocity added while the impulse applies.
    pub additional_impulse: Vec3,
    /// Current inputs.
    pub controls: KartControls,
    /// Attachment.
    pub attachment: Attachment,
    /// Powerup.
    pub powerup: Powerup,
    /// Nitro energy.
    pub energy: f32,
    /// Ticks of skid speed boost left.
    pub speed_boost_ticks: u16,
    /// Skid state.
    pub skid_state: SkidState,
    /// Seconds spent in the current skid.
    pub skid_time: f32,
    /// Kart crossed the line.
    pub finished: bool,
    /// Race time at which it finished.
    pub finish_time: f32,
}

impl KartState {
    /// State of a kart standing at `transform`.
    pub fn at(transform: Transform) -> Self {
        Self {
            transform,
            ..Self::default()
        }
    }

    /// Append the snapshot bytes.
    pub fn encode(&self, w: &mut StateWriter) {
        let mut flags = KartFlags::empty();
        flags.set_fire(self.fire_clicked);
        flags.set_animation(self.animation.is_some());
        flags.set_plunger(self.plunger_ticks != 0);
        flags.set_invulnerable_ticks(self.invulnerable_ticks.min(KartFlags::MAX_INVULNERABLE_TICKS));

        w.add_u16(self.bubblegum_ticks).add_u16(flags.bits());
        if flags.plunger() {
            w.add_u16(self.plunger_ticks);
        }

        w.add_vec3(self.transform.origin).add_quat(self.transform.rotation);
        if let Some(anim) = self.animation {
            let end = anim.end_ticks.min(AnimationWord::MAX_END_TICKS);
            w.add_u32(AnimationWord::new(anim.kind.to_u8(), end).bits());
        }

        w.add_vec3(self.linear_velocity)
            .add_vec3(self.angular_velocity)
            .add_u16(self.timed_rotation_ticks)
            .add_f32(self.timed_rotation)
            .add_u16(self.bounce_back_ticks)
            .add_u16(self.central_impulse_ticks)
            .add_vec3(self.additional_impulse);

        self.controls.save_state(w);

        w.add_u8(self.attachment.kind.to_u8())
            .add_u16(self.attachment.ticks)
            .add_u8(self.powerup.kind)
            .add_u8(self.powerup.count)
            .add_f32(self.energy)
            .add_u16(self.speed_boost_ticks)
            .add_u8(self.skid_state.to_u8())
            .add_f32(self.skid_time)
            .add_bool(self.finished)
            .add_f32(self.finish_time);
    }

    /// Decode a whole snapshot. Trailing bytes are an error.
    pub fn decode(data: &[u8]) -> Result<Self, BufferError> {
        let mut r = StateReader::new(data);
        let bubblegum_ticks = r.get_u16()?;
        let flags = KartFlags::from_bits(r.get_u16()?);
        let plunger_ticks = if flags.plunger() { r.get_u16()? } else { 0 };

        let origin = r.get_vec3()?;
        let rotation = r.get_quat()?;
        let animation = if flags.animation() {
            let word = AnimationWord::from_bits(r.get_u32()?);
            let kind = AnimationKind::from_u8(word.kind()).ok_or(BufferError::InvalidValue {
                field: "animation_kind",
                value: word.kind() as u32,
            })?;
            Some(KartAnimation {
                kind,
                end_ticks: word.end_ticks(),
            })
        } else {
            None
        };

        let linear_velocity = r.get_vec3()?;
        let angular_velocity = r.get_vec3()?;
        let timed_rotation_ticks = r.get_u16()?;
        let timed_rotation = r.get_f32()?;
        let bounce_back_ticks = r.get_u16()?;
        let central_impulse_ticks = r.get_u16()?;
        let additional_impulse = r.get_vec3()?;
        let controls = KartControls::restore_state(&mut r)?;
        let attachment = Attachment {
            kind: AttachmentKind::from_u8(r.get_u8()?)?,
            ticks: r.get_u16()?,
        };
        let powerup = Powerup {
            kind: r.get_u8()?,
            count: r.get_u8()?,
        };
        let energy = r.get_f32()?;
        let speed_boost_ticks = r.get_u16()?;
        let skid_state = SkidState::from_u8(r.get_u8()?)?;
        let skid_time = r.get_f32()?;
        let finished = r.get_bool()?;
        let finish_time = r.get_f32()?;

        if !r.is_empty() {
            return Err(BufferError::InvalidValue {
                field: "trailing_bytes",
                value: r.remaining() as u32,
            });
        }

        Ok(Self {
            bubblegum_ticks,
            fire_clicked: flags.fire(),
            invulnerable_ticks: flags.invulnerable_ticks(),
            plunger_ticks,
            animation,
            transform: Transform::new(origin, rotation),
            linear_velocity,
            angular_velocity,
            timed_rotation_ticks,
            timed_rotation,
            bounce_back_ticks,
            central_impulse_ticks,
            additional_impulse,
            controls,
            attachment,
            powerup,
            energy,
            speed_boost_ticks,
            skid_state,
            skid_time,
            finished,
            finish_time,
        })
    }

    /// Bit-exact comparison of the physics fields plus `==` on the rest.
    pub fn bits_eq(&self, other: &Self) -> bool {
        self.transform.bits_eq(&other.transform)
            && self.linear_velocity.bits_eq(other.linear_velocity)
            && self.angular_velocity.bits_eq(other.angular_velocity)
            && self.additional_impulse.bits_eq(other.additional_impulse)
            && self.timed_rotation.to_bits() == other.timed_rotation.to_bits()
            && self.energy.to_bits() == other.energy.to_bits()
            && self.skid_time.to_bits() == other.skid_time.to_bits()
            && self.finish_time.to_bits() == other.finish_time.to_bits()
            && self == other
    }
}

// =============================================================================
// KART
// =============================================================================

/// Permanent elimination decided by a game event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Retirement {
    tick: Tick,
    was_eliminated: bool,
}

/// A kart in the race.
#[derive(Debug, Clone)]
pub struct Kart {
    id: KartId,
    identity: String,
    ticks_per_second: u32,
    dt: f32,
    start: Transform,
    state: KartState,

    // Lifecycle, driven by reconciliation and events
    eliminated: bool,
    retired: Option<Retirement>,
    hidden: bool,
    has_server_state: bool,
    missed_server_states: u32,
    last_animation_end_ticks: Option<u32>,

    // Cosmetic
    smoothing: ErrorSmoothing,
    steering_smoothing: SteeringSmoothing,
    pre_rewind: Option<(Transform, f32)>,
}

impl Kart {
    /// Create a kart standing at `start`.
    pub fn new(id: KartId, start: Transform, ticks_per_second: u32) -> Self {
        Self {
            id,
            identity: Self::identity_for(id),
            ticks_per_second,
            dt: 1.0 / ticks_per_second as f32,
            start,
            state: KartState::at(start),
            eliminated: false,
            retired: None,
            hidden: false,
            has_server_state: false,
            missed_server_states: 0,
            last_animation_end_ticks: None,
            smoothing: ErrorSmoothing::default(),
            steering_smoothing: SteeringSmoothing::default(),
            pre_rewind: None,
        }
    }

    /// Identity string for a kart id.
    pub fn identity_for(id: KartId) -> String {
        format!("K{}", id)
    }

    /// Kart id.
    pub fn id(&self) -> KartId {
        self.id
    }

    /// Deterministic state.
    pub fn state(&self) -> &KartState {
        &self.state
    }

    /// Mutable deterministic state.
    pub fn state_mut(&mut self) -> &mut KartState {
        &mut self.state
    }

    /// Physics transform.
    pub fn transform(&self) -> Transform {
        self.state.transform
    }

    /// Transform to render (physics plus correction offset).
    pub fn visual_transform(&self) -> Transform {
        self.smoothing.apply(&self.state.transform)
    }

    /// Steering to render.
    pub fn displayed_steer(&self) -> f32 {
        self.steering_smoothing.apply(self.state.controls.steer())
    }

    /// True while a visual correction is running.
    pub fn is_smoothing(&self) -> bool {
        self.smoothing.is_active()
    }

    /// Current controls.
    pub fn controls(&self) -> KartControls {
        self.state.controls
    }

    /// Replace controls.
    pub fn set_controls(&mut self, controls: KartControls) {
        self.state.controls = controls;
    }

    /// Eliminated karts are not simulated and not saved.
    pub fn is_eliminated(&self) -> bool {
        self.eliminated
    }

    /// Eliminated for good because its driver left.
    pub fn is_retired(&self) -> bool {
        self.retired.is_some()
    }

    /// Hidden after reinstatement until a fresh state arrives.
    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// Crossed the finish line.
    pub fn is_finished(&self) -> bool {
        self.state.finished
    }

    /// Finish time, if finished.
    pub fn finish_time(&self) -> Option<f32> {
        self.state.finished.then_some(self.state.finish_time)
    }

    /// Consecutive authoritative updates this kart was missing from.
    pub fn missed_server_states(&self) -> u32 {
        self.missed_server_states
    }

    fn secs_to_ticks(&self, secs: f32) -> u16 {
        (secs * self.ticks_per_second as f32).round().min(u16::MAX as f32) as u16
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Mark finished. Returns false if it already was.
    pub fn finish(&mut self, time: f32) -> bool {
        if self.state.finished {
            return false;
        }
        self.state.finished = true;
        self.state.finish_time = time;
        true
    }

    /// Remove from the simulation. Returns false if already eliminated.
    pub fn eliminate(&mut self) -> bool {
        if self.eliminated {
            return false;
        }
        self.eliminated = true;
        self.state.controls = KartControls::new();
        self.state.linear_velocity = Vec3::ZERO;
        self.state.angular_velocity = Vec3::ZERO;
        self.smoothing = ErrorSmoothing::default();
        true
    }

    /// Eliminate permanently at tick `now`, recording `time` as the finish
    /// time. Returns false if the kart was already retired.
    pub fn retire(&mut self, now: Tick, time: f32) -> bool {
        if self.retired.is_some() {
            return false;
        }
        self.retired = Some(Retirement {
            tick: now,
            was_eliminated: self.eliminated,
        });
        self.eliminate();
        self.finish(time);
        true
    }

    /// Undo a retirement applied at or after `tick`. Used when the world is
    /// rolled back to `tick`; replaying the timeline retires the kart again.
    pub fn unretire_since(&mut self, tick: Tick) -> bool {
        match self.retired {
            Some(r) if r.tick >= tick => {
                self.retired = None;
                self.eliminated = r.was_eliminated;
                true
            }
            _ => false,
        }
    }

    /// Bring an eliminated kart back, hidden until its next server state.
    pub fn reinstate(&mut self) {
        self.eliminated = false;
        self.hidden = true;
        self.missed_server_states = 0;
        self.smoothing = ErrorSmoothing::default();
        self.steering_smoothing.clear();
    }

    /// Back to the start grid.
    pub fn reset(&mut self) {
        self.state = KartState::at(self.start);
        self.eliminated = false;
        self.retired = None;
        self.hidden = false;
        self.has_server_state = false;
        self.missed_server_states = 0;
        self.last_animation_end_ticks = None;
        self.smoothing = ErrorSmoothing::default();
        self.steering_smoothing.clear();
        self.pre_rewind = None;
    }

    // =========================================================================
    // ITEMS AND ANIMATIONS
    // =========================================================================

    fn start_animation(&mut self, kind: AnimationKind, now: Tick, secs: f32) {
        let end = now
            .saturating_add(self.secs_to_ticks(secs) as u32)
            .min(AnimationWord::MAX_END_TICKS);
        let t = &self.state.transform;
        let upright = Transform::new(
            Vec3::new(t.origin.x, 0.0, t.origin.z),
            Quat::from_yaw(t.rotation.yaw()),
        );
        self.state.transform = upright;
        self.state.linear_velocity = Vec3::ZERO;
        self.state.angular_velocity = Vec3::ZERO;
        self.state.skid_state = SkidState::None;
        self.state.skid_time = 0.0;
        self.state.animation = Some(KartAnimation { kind, end_ticks: end });
        self.last_animation_end_ticks = Some(end);
    }

    /// Start a rescue. Returns false if an animation is already running.
    pub fn start_rescue(&mut self, now: Tick) -> bool {
        if self.state.animation.is_some() {
            return false;
        }
        self.start_animation(AnimationKind::Rescue, now, RESCUE_TIME);
        true
    }

    /// Blow the kart up unless it is protected.
    pub fn explode(&mut self, now: Tick, direct_hit: bool) -> bool {
        if self.state.animation.is_some() || self.state.invulnerable_ticks > 0 {
            return false;
        }
        if self.state.attachment.kind == AttachmentKind::BubbleShield {
            self.state.attachment = Attachment::default();
            return false;
        }
        let kind = if direct_hit {
            AnimationKind::ExplosionDirectHit
        } else {
            AnimationKind::Explosion
        };
        self.state.attachment = Attachment::default();
        self.start_animation(kind, now, EXPLOSION_TIME);
        true
    }

    /// Slow the kart with bubblegum.
    pub fn hit_by_bubblegum(&mut self) {
        if self.state.invulnerable_ticks == 0 {
            self.state.bubblegum_ticks = self.secs_to_ticks(BUBBLEGUM_TIME);
        }
    }

    /// Block the view with a plunger.
    pub fn block_view(&mut self, secs: f32) {
        self.state.plunger_ticks = self.secs_to_ticks(secs);
    }

    /// Attach something for `secs`.
    pub fn attach(&mut self, kind: AttachmentKind, secs: f32) {
        self.state.attachment = Attachment {
            kind,
            ticks: if kind == AttachmentKind::None { 0 } else { self.secs_to_ticks(secs) },
        };
    }

    /// Give a powerup.
    pub fn give_powerup(&mut self, kind: u8, count: u8) {
        self.state.powerup = Powerup { kind, count };
    }

    /// Set nitro energy.
    pub fn set_energy(&mut self, energy: f32) {
        self.state.energy = energy.max(0.0);
    }

    /// Set invulnerability, clamped to what the snapshot can carry.
    pub fn set_invulnerable_ticks(&mut self, ticks: u32) {
        self.state.invulnerable_ticks = ticks.min(KartFlags::MAX_INVULNERABLE_TICKS as u32) as u16;
    }

    /// Apply a bump pushing the kart along `direction` (unit length).
    pub fn bump(&mut self, direction: Vec3) {
        if self.state.animation.is_some() {
            return;
        }
        self.state.bounce_back_ticks = self.secs_to_ticks(BOUNCE_BACK_TIME);
        self.state.central_impulse_ticks = self.secs_to_ticks(BUMP_IMPULSE_TIME);
        self.state.additional_impulse = direction.scale(BUMP_IMPULSE);
    }

    /// True if this kart takes part in collisions.
    pub fn is_solid(&self) -> bool {
        !self.eliminated && self.state.animation.is_none()
    }

    // =========================================================================
    // SIMULATION
    // =========================================================================

    /// Advance one fixed step. `now` is the world tick being simulated.
    pub fn step(&mut self, now: Tick) {
        if self.eliminated {
            return;
        }
        self.simulate(now);
        self.count_down_timers();
    }

    fn simulate(&mut self, now: Tick) {
        if let Some(anim) = self.state.animation {
            if now < anim.end_ticks {
                return;
            }
            debug!(kart = self.id, kind = ?anim.kind, "animation ended");
            self.state.animation = None;
            let ticks = self.secs_to_ticks(INVULNERABLE_AFTER_ANIMATION);
            self.set_invulnerable_ticks(ticks as u32);
        }

        let controls = if self.state.finished {
            let mut c = KartControls::new();
            c.set_accel(FINISHED_ACCEL);
            c
        } else {
            self.state.controls
        };

        if controls.rescue() {
            self.start_rescue(now);
            return;
        }

        let dt = self.dt;
        let skid_boost_ticks = self.secs_to_ticks(SKID_BOOST_TIME);
        let s = &mut self.state;

        // Fire on press, not while held
        if controls.fire() && !s.fire_clicked && s.powerup.count > 0 {
            s.powerup.count -= 1;
            if s.powerup.count == 0 {
                s.powerup.kind = 0;
            }
        }
        s.fire_clicked = controls.fire();

        let forward = s.transform.rotation.rotate(Vec3::FORWARD);
        let speed = s.linear_velocity.dot(forward);

        let nitro = controls.nitro() && s.energy > 0.0;
        let mut max_speed = MAX_SPEED;
        if nitro {
            max_speed += NITRO_SPEED_BONUS;
        }
        if s.speed_boost_ticks > 0 {
            max_speed += SKID_BOOST_SPEED_BONUS;
        }
        match s.attachment.kind {
            AttachmentKind::Parachute => max_speed *= 0.65,
            AttachmentKind::Anvil => max_speed *= 0.5,
            _ => {}
        }
        if s.bubblegum_ticks > 0 {
            max_speed *= BUBBLEGUM_SPEED_FACTOR;
        }

        let mut accel = 0.0;
        if s.bounce_back_ticks == 0 {
            accel += controls.accel() * ENGINE_ACCEL;
            if controls.brake() {
                accel -= BRAKE_ACCEL;
            }
        }
        if nitro {
            accel += NITRO_ACCEL;
            s.energy = (s.energy - NITRO_USE_PER_SEC * dt).max(0.0);
        }
        let new_speed = (speed + (accel - DRAG * speed) * dt).clamp(-MAX_REVERSE_SPEED, max_speed);

        let steer = controls.steer();
        let direction = if new_speed < 0.0 { -1.0 } else { 1.0 };
        let mut yaw_rate = steer * TURN_RATE * (new_speed.abs() / MAX_SPEED).min(1.0) * direction;

        let wants_skid = controls.skid() != SkidControl::None && steer != 0.0 && new_speed > SKID_MIN_SPEED;
        if wants_skid {
            if s.skid_state == SkidState::None {
                s.skid_state = if steer < 0.0 { SkidState::Left } else { SkidState::Right };
                s.skid_time = 0.0;
            }
            s.skid_time += dt;
            yaw_rate *= SKID_TURN_FACTOR;
        } else if s.skid_state != SkidState::None {
            if s.skid_time >= SKID_BONUS_TIME {
                s.speed_boost_ticks = skid_boost_ticks;
            }
            s.skid_state = SkidState::None;
            s.skid_time = 0.0;
        }

        if s.timed_rotation_ticks > 0 {
            yaw_rate += s.timed_rotation;
        }

        let rotation = (s.transform.rotation * Quat::from_yaw(yaw_rate * dt)).normalize();
        let mut velocity = rotation.rotate(Vec3::FORWARD).scale(new_speed);
        if s.central_impulse_ticks > 0 {
            velocity = velocity + s.additional_impulse;
        }

        s.linear_velocity = velocity;
        s.angular_velocity = Vec3::new(0.0, yaw_rate, 0.0);
        s.transform = Transform::new(s.transform.origin + velocity.scale(dt), rotation);
    }

    fn count_down_timers(&mut self) {
        let s = &mut self.state;
        s.bubblegum_ticks = s.bubblegum_ticks.saturating_sub(1);
        s.invulnerable_ticks = s.invulnerable_ticks.saturating_sub(1);
        s.plunger_ticks = s.plunger_ticks.saturating_sub(1);
        s.bounce_back_ticks = s.bounce_back_ticks.saturating_sub(1);
        s.speed_boost_ticks = s.speed_boost_ticks.saturating_sub(1);
        s.timed_rotation_ticks = s.timed_rotation_ticks.saturating_sub(1);
        if s.central_impulse_ticks > 0 {
            s.central_impulse_ticks -= 1;
            if s.central_impulse_ticks == 0 {
                s.additional_impulse = Vec3::ZERO;
            }
        }
        if s.attachment.ticks > 0 {
            s.attachment.ticks -= 1;
            if s.attachment.ticks == 0 {
                s.attachment.kind = AttachmentKind::None;
            }
        }
    }

    /// Advance cosmetic smoothing by one rendered tick.
    pub fn update_graphics(&mut self) {
        self.smoothing.advance();
        self.steering_smoothing.advance();
    }
}

impl Rewindable for Kart {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn save_state(&self) -> Option<StateSnapshot> {
        if self.eliminated {
            return None;
        }
        let mut w = StateWriter::with_capacity(KART_STATE_CAPACITY);
        self.state.encode(&mut w);
        Some(StateSnapshot::new(self.identity.clone(), w.into_bytes()))
    }

    fn restore_state(&mut self, data: &[u8], source: StateSource) -> Result<(), BufferError> {
        let decoded = KartState::decode(data)?;

        if let Some(anim) = decoded.animation {
            if self.state.animation.is_none() && self.last_animation_end_ticks != Some(anim.end_ticks) {
                info!(kart = self.id, kind = ?anim.kind, "creating animation from state");
            }
            self.last_animation_end_ticks = Some(anim.end_ticks);
        }

        self.state = decoded;
        if source == StateSource::Authoritative {
            self.has_server_state = true;
        }
        Ok(())
    }

    fn prepare_rewind(&mut self) {
        self.has_server_state = false;
        self.pre_rewind = Some((self.visual_transform(), self.displayed_steer()));
    }

    fn compute_error(&mut self, policy: &ReconcilePolicy, authoritative: bool) -> Reconciliation {
        if let Some((shown, shown_steer)) = self.pre_rewind.take() {
            if self.state.animation.is_none() && !self.eliminated {
                self.smoothing.start(&shown, &self.state.transform, policy.smoothing_ticks);
            } else {
                self.smoothing = ErrorSmoothing::default();
            }

            let diff = (shown_steer - self.state.controls.steer()).abs();
            if diff > policy.steering_threshold {
                let ticks = (diff * policy.steering_smoothing_ticks as f32 / 2.0).ceil().max(1.0) as u32;
                self.steering_smoothing.start(shown_steer, ticks);
            } else {
                self.steering_smoothing.clear();
            }
        }

        if !authoritative {
            return Reconciliation::Unchanged;
        }

        if self.has_server_state {
            self.missed_server_states = 0;
            if self.eliminated {
                if self.retired.is_some() {
                    return Reconciliation::Unchanged;
                }
                info!(kart = self.id, "kart present in server state again");
                return Reconciliation::Reinstate;
            }
            if self.hidden {
                self.hidden = false;
            }
            return Reconciliation::Unchanged;
        }

        if self.eliminated {
            return Reconciliation::Unchanged;
        }
        self.missed_server_states += 1;
        if self.missed_server_states >= policy.missed_state_tolerance {
            info!(
                kart = self.id,
                missed = self.missed_server_states,
                "kart missing from server state"
            );
            return Reconciliation::Eliminate;
        }
        Reconciliation::Unchanged
    }
}
