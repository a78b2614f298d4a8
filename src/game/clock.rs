//! World Clock and Race Phases
//!
//! Fixed-step clock driving the race lifecycle:
//!
//! ```text
//! SETUP → TRACK_INTRO ─┬─────────────────────► READY → SET → GO → MUSIC → RACE
//!                      └► WAIT_FOR_SERVER ──┘                               │
//!                         (networked only)                                  ▼
//!                      FINISH ◄── RESULT_DISPLAY ◄──────────────── DELAY_FINISH
//! ```
//!
//! Timed phases use an auxiliary tick counter reset on every phase entry.
//! The primary race time only advances during `Race`, `DelayFinish` and
//! `Goal`. Durations are configured in seconds and converted with the
//! injected tick rate; nothing here reads a wall clock.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::NetworkMode;
use crate::core::buffer::{BufferError, StateReader, StateWriter};

/// World tick since the synchronized start.
pub type Tick = u32;

/// Race lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Initial state before anything is shown.
    Setup,
    /// Camera fly-by with intro sound.
    TrackIntro,
    /// Networked race: waiting for the server's start signal.
    WaitForServer,
    /// "Ready" light.
    Ready,
    /// "Set" light.
    Set,
    /// "Go": karts may drive.
    Go,
    /// Music credit display.
    Music,
    /// Main race.
    Race,
    /// All karts done; short delay before results.
    DelayFinish,
    /// Results on screen.
    ResultDisplay,
    /// Race fully finished.
    Finish,
    /// Terminal phase for goal-based modes.
    Goal,
    /// Paused in the in-game menu.
    InGameMenu,
}

impl Phase {
    fn to_u8(self) -> u8 {
        match self {
            Phase::Setup => 0,
            Phase::TrackIntro => 1,
            Phase::WaitForServer => 2,
            Phase::Ready => 3,
            Phase::Set => 4,
            Phase::Go => 5,
            Phase::Music => 6,
            Phase::Race => 7,
            Phase::DelayFinish => 8,
            Phase::ResultDisplay => 9,
            Phase::Finish => 10,
            Phase::Goal => 11,
            Phase::InGameMenu => 12,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Phase::Setup,
            1 => Phase::TrackIntro,
            2 => Phase::WaitForServer,
            3 => Phase::Ready,
            4 => Phase::Set,
            5 => Phase::Go,
            6 => Phase::Music,
            7 => Phase::Race,
            8 => Phase::DelayFinish,
            9 => Phase::ResultDisplay,
            10 => Phase::Finish,
            11 => Phase::Goal,
            12 => Phase::InGameMenu,
            _ => return None,
        })
    }
}

/// How the primary race time runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockMode {
    /// Count up from zero.
    #[default]
    Chrono,
    /// Count down to zero.
    Countdown,
}

/// Notification for audio/UI collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockNotice {
    /// A phase was entered.
    PhaseEntered(Phase),
    /// Engines should start (emitted on entering `Ready`).
    StartEngines,
    /// Countdown clock hit zero.
    CountdownReachedZero,
}

/// Clock errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    /// Pause requested while a pause is already active.
    #[error("pause requested while already paused in {phase:?}")]
    PrematurePause {
        /// Phase that is active (the pause phase).
        phase: Phase,
    },

    /// Clock mode changed while the race is running.
    #[error("clock mode cannot change during {phase:?}")]
    ModeLocked {
        /// Phase that is active.
        phase: Phase,
    },
}

/// Phase durations in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseDurations {
    /// Track intro length.
    pub track_intro: f32,
    /// Upper bound on waiting for the intro sound.
    pub intro_sound_cap: f32,
    /// Ready light.
    pub ready: f32,
    /// Set light.
    pub set: f32,
    /// Go message before the music credit.
    pub go: f32,
    /// Music credit display.
    pub music_credit: f32,
    /// Delay between the last kart finishing and results.
    pub delay_finish: f32,
}

impl Default for PhaseDurations {
    fn default() -> Self {
        Self {
            track_intro: 3.0,
            intro_sound_cap: 3.5,
            ready: 1.0,
            set: 1.0,
            go: 2.5,
            music_credit: 1.0,
            delay_finish: 2.0,
        }
    }
}

/// Clock configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockConfig {
    /// Fixed simulation rate.
    pub ticks_per_second: u32,
    /// Phase durations.
    pub durations: PhaseDurations,
    /// Skip the start sequence and begin at `Music`.
    pub race_now: bool,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            ticks_per_second: crate::TICK_RATE,
            durations: PhaseDurations::default(),
            race_now: false,
        }
    }
}

impl ClockConfig {
    /// Seconds to ticks, rounded to nearest.
    pub fn time_to_ticks(&self, secs: f32) -> u32 {
        (secs * self.ticks_per_second as f32).round().max(0.0) as u32
    }

    /// Ticks to seconds.
    pub fn ticks_to_time(&self, ticks: u32) -> f32 {
        ticks as f32 / self.ticks_per_second as f32
    }
}

/// Durations converted to ticks once.
#[derive(Debug, Clone, Copy)]
struct PhaseTicks {
    track_intro: u32,
    intro_sound_cap: u32,
    ready: u32,
    set: u32,
    go: u32,
    music_credit: u32,
    delay_finish: u32,
}

impl PhaseTicks {
    fn from_config(config: &ClockConfig) -> Self {
        let d = &config.durations;
        Self {
            track_intro: config.time_to_ticks(d.track_intro),
            intro_sound_cap: config.time_to_ticks(d.intro_sound_cap),
            ready: config.time_to_ticks(d.ready),
            set: config.time_to_ticks(d.set),
            go: config.time_to_ticks(d.go),
            music_credit: config.time_to_ticks(d.music_credit),
            delay_finish: config.time_to_ticks(d.delay_finish),
        }
    }
}

/// Size of a saved clock record.
pub const CLOCK_STATE_SIZE: usize = 1 + 1 + 4 + 1 + 4 + 4 + 4 + 1;

const NO_PHASE: u8 = 0xFF;

const FLAG_STARTED: u8 = 1 << 0;
const FLAG_COUNTDOWN_NOTIFIED: u8 = 1 << 1;

/// Race clock and phase state machine.
#[derive(Debug, Clone)]
pub struct WorldClock {
    config: ClockConfig,
    ticks: PhaseTicks,
    network: NetworkMode,

    phase: Phase,
    previous_phase: Option<Phase>,
    auxiliary_ticks: u32,

    mode: ClockMode,
    time_ticks: u32,
    initial_time_ticks: u32,
    count_up_ticks: u32,

    server_ready: bool,
    started: bool,
    countdown_notified: bool,
    intro_sound_playing: bool,

    notices: Vec<ClockNotice>,
    notices_muted: bool,
}

impl WorldClock {
    /// Create a clock in its initial phase.
    pub fn new(config: ClockConfig, network: NetworkMode) -> Self {
        let ticks = PhaseTicks::from_config(&config);
        let mut clock = Self {
            config,
            ticks,
            network,
            phase: Phase::Setup,
            previous_phase: None,
            auxiliary_ticks: 0,
            mode: ClockMode::Chrono,
            time_ticks: 0,
            initial_time_ticks: 0,
            count_up_ticks: 0,
            server_ready: false,
            started: false,
            countdown_notified: false,
            intro_sound_playing: false,
            notices: Vec::new(),
            notices_muted: false,
        };
        clock.reset();
        clock
    }

    /// Return to the start of the race, keeping mode and configuration.
    pub fn reset(&mut self) {
        self.time_ticks = self.initial_time_ticks;
        self.count_up_ticks = 0;
        self.auxiliary_ticks = 0;
        self.previous_phase = None;
        self.server_ready = false;
        self.countdown_notified = false;
        self.notices.clear();
        if self.config.race_now {
            self.phase = Phase::Music;
            self.started = true;
        } else {
            self.phase = Phase::Setup;
            self.started = false;
        }
    }

    /// Clock configuration.
    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    /// Network mode the clock was created for.
    pub fn network_mode(&self) -> NetworkMode {
        self.network
    }

    // =========================================================================
    // STEPPING
    // =========================================================================

    /// Run `ticks` single steps.
    pub fn update(&mut self, ticks: u32) {
        for _ in 0..ticks {
            self.step();
        }
    }

    fn step(&mut self) {
        if self.previous_phase.is_some() {
            return;
        }

        let timed = matches!(self.phase, Phase::Race | Phase::DelayFinish | Phase::Goal);

        match self.phase {
            Phase::Setup => {
                self.enter_phase(Phase::TrackIntro);
                self.step_track_intro();
            }
            Phase::TrackIntro => self.step_track_intro(),
            Phase::WaitForServer => {
                if self.server_ready {
                    self.enter_phase(Phase::Ready);
                }
            }
            Phase::Ready => self.advance_auxiliary(self.ticks.ready, Phase::Set),
            Phase::Set => self.advance_auxiliary(self.ticks.set, Phase::Go),
            Phase::Go => self.advance_auxiliary(self.ticks.go, Phase::Music),
            Phase::Music => self.advance_auxiliary(self.ticks.music_credit, Phase::Race),
            Phase::DelayFinish => {
                self.advance_auxiliary(self.ticks.delay_finish, Phase::ResultDisplay)
            }
            Phase::Race
            | Phase::ResultDisplay
            | Phase::Finish
            | Phase::Goal
            | Phase::InGameMenu => {}
        }

        if timed {
            self.advance_time();
        }
    }

    fn step_track_intro(&mut self) {
        self.auxiliary_ticks += 1;
        if self.auxiliary_ticks < self.ticks.track_intro {
            return;
        }
        if self.intro_sound_playing && self.auxiliary_ticks < self.ticks.intro_sound_cap {
            return;
        }
        let next = if self.network.is_networking() {
            Phase::WaitForServer
        } else {
            Phase::Ready
        };
        self.enter_phase(next);
    }

    fn advance_auxiliary(&mut self, duration: u32, next: Phase) {
        self.auxiliary_ticks += 1;
        if self.auxiliary_ticks >= duration {
            self.enter_phase(next);
        }
    }

    fn advance_time(&mut self) {
        self.count_up_ticks = self.count_up_ticks.saturating_add(1);
        match self.mode {
            ClockMode::Chrono => self.time_ticks = self.time_ticks.saturating_add(1),
            ClockMode::Countdown => {
                self.time_ticks = self.time_ticks.saturating_sub(1);
                if self.time_ticks == 0 && !self.countdown_notified {
                    self.countdown_notified = true;
                    self.notify(ClockNotice::CountdownReachedZero);
                }
            }
        }
    }

    fn enter_phase(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, "phase change");
        self.phase = phase;
        self.auxiliary_ticks = 0;
        self.notify(ClockNotice::PhaseEntered(phase));
        if phase == Phase::Ready {
            self.started = true;
            self.notify(ClockNotice::StartEngines);
        }
    }

    fn notify(&mut self, notice: ClockNotice) {
        if !self.notices_muted {
            self.notices.push(notice);
        }
    }

    // =========================================================================
    // EXTERNAL SIGNALS
    // =========================================================================

    /// Server confirmed every peer is ready; leaves `WaitForServer`.
    pub fn server_ready(&mut self) {
        self.server_ready = true;
    }

    /// Whether the start signal has been received.
    pub fn is_server_ready(&self) -> bool {
        self.server_ready
    }

    /// Tell the clock whether the intro sound is still playing.
    pub fn set_intro_sound_playing(&mut self, playing: bool) {
        self.intro_sound_playing = playing;
    }

    /// All karts are done: move to `DelayFinish` unless already past it.
    pub fn enter_race_over(&mut self) {
        if matches!(
            self.phase,
            Phase::DelayFinish | Phase::ResultDisplay | Phase::Finish
        ) {
            return;
        }
        self.enter_phase(Phase::DelayFinish);
    }

    /// Force a phase (goal modes, result screens).
    pub fn set_phase(&mut self, phase: Phase) {
        self.enter_phase(phase);
    }

    /// Pause into `phase`, remembering the current one.
    ///
    /// # Panics
    /// Panics if a pause is already active.
    pub fn pause(&mut self, phase: Phase) {
        assert!(
            self.previous_phase.is_none(),
            "pause while already paused (active phase {:?})",
            self.phase
        );
        self.previous_phase = Some(self.phase);
        self.phase = phase;
    }

    /// Checked variant of [`pause`](Self::pause).
    pub fn try_pause(&mut self, phase: Phase) -> Result<(), ClockError> {
        if self.previous_phase.is_some() {
            return Err(ClockError::PrematurePause { phase: self.phase });
        }
        self.pause(phase);
        Ok(())
    }

    /// Restore the phase saved by `pause`. Returns false if not paused.
    pub fn unpause(&mut self) -> bool {
        match self.previous_phase.take() {
            Some(phase) => {
                self.phase = phase;
                true
            }
            None => false,
        }
    }

    /// Choose chrono or countdown and the starting time.
    pub fn set_clock_mode(&mut self, mode: ClockMode, initial_secs: f32) -> Result<(), ClockError> {
        if matches!(self.phase, Phase::Race | Phase::DelayFinish) {
            return Err(ClockError::ModeLocked { phase: self.phase });
        }
        self.mode = mode;
        self.time_ticks = self.config.time_to_ticks(initial_secs);
        self.initial_time_ticks = self.time_ticks;
        self.countdown_notified = false;
        Ok(())
    }

    /// Overwrite the primary time.
    pub fn set_time(&mut self, secs: f32) {
        self.time_ticks = self.config.time_to_ticks(secs);
    }

    /// Drain pending notifications.
    pub fn take_notices(&mut self) -> Vec<ClockNotice> {
        std::mem::take(&mut self.notices)
    }

    /// Suppress notifications (used while replaying).
    pub fn set_notices_muted(&mut self, muted: bool) {
        self.notices_muted = muted;
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Active phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Phase saved by an active pause.
    pub fn previous_phase(&self) -> Option<Phase> {
        self.previous_phase
    }

    /// True while paused.
    pub fn is_paused(&self) -> bool {
        self.previous_phase.is_some()
    }

    /// Ticks spent in the current phase.
    pub fn auxiliary_ticks(&self) -> u32 {
        self.auxiliary_ticks
    }

    /// Clock mode.
    pub fn clock_mode(&self) -> ClockMode {
        self.mode
    }

    /// Primary time in seconds.
    pub fn time(&self) -> f32 {
        self.config.ticks_to_time(self.time_ticks)
    }

    /// Primary time in ticks.
    pub fn time_ticks(&self) -> u32 {
        self.time_ticks
    }

    /// Ticks of race time elapsed, regardless of mode.
    pub fn count_up_ticks(&self) -> u32 {
        self.count_up_ticks
    }

    /// True in `Race`.
    pub fn is_racing(&self) -> bool {
        self.phase == Phase::Race
    }

    /// True once the race has ended for everyone.
    pub fn is_race_over(&self) -> bool {
        matches!(
            self.phase,
            Phase::DelayFinish | Phase::ResultDisplay | Phase::Finish
        )
    }

    /// True once the synchronized start (`Ready`) has been reached.
    pub fn has_started(&self) -> bool {
        self.started
    }

    /// True while karts are simulated.
    pub fn karts_can_move(&self) -> bool {
        !self.is_paused()
            && matches!(
                self.phase,
                Phase::Go | Phase::Music | Phase::Race | Phase::DelayFinish
            )
    }

    // =========================================================================
    // LOCAL REWIND RECORD
    // =========================================================================

    /// Append the clock counters to `w`.
    ///
    /// External signals (server ready, intro sound) are not part of the
    /// record: they arrive at different ticks on each peer and a rollback
    /// must not undo them.
    pub fn save_state(&self, w: &mut StateWriter) {
        let mut flags = 0u8;
        if self.started {
            flags |= FLAG_STARTED;
        }
        if self.countdown_notified {
            flags |= FLAG_COUNTDOWN_NOTIFIED;
        }
        w.add_u8(self.phase.to_u8())
            .add_u8(self.previous_phase.map_or(NO_PHASE, Phase::to_u8))
            .add_u32(self.auxiliary_ticks)
            .add_u8(match self.mode {
                ClockMode::Chrono => 0,
                ClockMode::Countdown => 1,
            })
            .add_u32(self.time_ticks)
            .add_u32(self.initial_time_ticks)
            .add_u32(self.count_up_ticks)
            .add_u8(flags);
    }

    /// Restore counters written by [`save_state`](Self::save_state).
    ///
    /// Nothing is modified unless the whole record decodes.
    pub fn restore_state(&mut self, r: &mut StateReader<'_>) -> Result<(), BufferError> {
        let phase_raw = r.get_u8()?;
        let phase = Phase::from_u8(phase_raw).ok_or(BufferError::InvalidValue {
            field: "phase",
            value: phase_raw as u32,
        })?;
        let prev_raw = r.get_u8()?;
        let previous_phase = if prev_raw == NO_PHASE {
            None
        } else {
            Some(Phase::from_u8(prev_raw).ok_or(BufferError::InvalidValue {
                field: "previous_phase",
                value: prev_raw as u32,
            })?)
        };
        let auxiliary_ticks = r.get_u32()?;
        let mode = match r.get_u8()? {
            0 => ClockMode::Chrono,
            1 => ClockMode::Countdown,
            other => {
                return Err(BufferError::InvalidValue {
                    field: "clock_mode",
                    value: other as u32,
                })
            }
        };
        let time_ticks = r.get_u32()?;
        let initial_time_ticks = r.get_u32()?;
        let count_up_ticks = r.get_u32()?;
        let flags = r.get_u8()?;

        self.phase = phase;
        self.previous_phase = previous_phase;
        self.auxiliary_ticks = auxiliary_ticks;
        self.mode = mode;
        self.time_ticks = time_ticks;
        self.initial_time_ticks = initial_time_ticks;
        self.count_up_ticks = count_up_ticks;
        self.started = flags & FLAG_STARTED != 0;
        self.countdown_notified = flags & FLAG_COUNTDOWN_NOTIFIED != 0;
        Ok(())
    }
}
