//! Race Configuration
//!
//! One `RaceConfig` per race, loaded from JSON and/or environment
//! variables and validated before any component is built from it.
//!
//! Environment overrides:
//! - `KART_TICK_RATE`
//! - `KART_STATE_FREQUENCY`
//! - `KART_MAX_ROLLBACK_TICKS`
//! - `KART_MISSED_STATE_TOLERANCE`
//! - `KART_NETWORK_MODE` (`offline`, `lan`, `wan`)

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::game::clock::{ClockConfig, PhaseDurations};
use crate::game::rewinder::ReconcilePolicy;
use crate::network::rewind::RewindConfig;

/// How the race is networked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Single machine, no peers.
    #[default]
    Offline,
    /// Local network.
    Lan,
    /// Internet.
    Wan,
}

impl NetworkMode {
    /// True for LAN and WAN.
    pub fn is_networking(self) -> bool {
        !matches!(self, NetworkMode::Offline)
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "offline" => Some(NetworkMode::Offline),
            "lan" => Some(NetworkMode::Lan),
            "wan" => Some(NetworkMode::Wan),
            _ => None,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// JSON could not be parsed.
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),

    /// An environment variable held an unparsable value.
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },

    /// A field is outside its allowed range.
    #[error("{field} out of range: {reason}")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Full race configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceConfig {
    /// Fixed simulation rate (Hz).
    pub ticks_per_second: u32,
    /// Network mode.
    pub network_mode: NetworkMode,
    /// Save (client) or send (server) a state every N ticks.
    pub state_frequency: u32,
    /// Oldest tick a rollback may reach, relative to now.
    pub max_rollback_ticks: u32,
    /// Consecutive authoritative updates a kart may be missing from before
    /// it is eliminated locally.
    pub missed_state_tolerance: u32,
    /// Ticks over which a visual correction is blended out.
    pub smoothing_ticks: u32,
    /// Skip the start sequence.
    pub race_now: bool,
    /// Distance along +Z at which a kart finishes (server decides).
    pub finish_line: f32,
    /// Ping interval in ticks.
    pub ping_interval_ticks: u32,
    /// Phase durations in seconds.
    pub phases: PhaseDurations,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            ticks_per_second: crate::TICK_RATE,
            network_mode: NetworkMode::Offline,
            state_frequency: 10,
            max_rollback_ticks: 240,
            missed_state_tolerance: 3,
            smoothing_ticks: 15,
            race_now: false,
            finish_line: 400.0,
            ping_interval_ticks: 120,
            phases: PhaseDurations::default(),
        }
    }
}

impl RaceConfig {
    /// Parse from JSON; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in
    /// [`from_env`](Self::from_env)).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse_u32(var: &'static str, value: String) -> Result<u32, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { var, value })
        }

        if let Some(v) = lookup("KART_TICK_RATE") {
            self.ticks_per_second = parse_u32("KART_TICK_RATE", v)?;
        }
        if let Some(v) = lookup("KART_STATE_FREQUENCY") {
            self.state_frequency = parse_u32("KART_STATE_FREQUENCY", v)?;
        }
        if let Some(v) = lookup("KART_MAX_ROLLBACK_TICKS") {
            self.max_rollback_ticks = parse_u32("KART_MAX_ROLLBACK_TICKS", v)?;
        }
        if let Some(v) = lookup("KART_MISSED_STATE_TOLERANCE") {
            self.missed_state_tolerance = parse_u32("KART_MISSED_STATE_TOLERANCE", v)?;
        }
        if let Some(v) = lookup("KART_NETWORK_MODE") {
            self.network_mode = NetworkMode::parse(&v).ok_or(ConfigError::InvalidEnv {
                var: "KART_NETWORK_MODE",
                value: v,
            })?;
        }
        Ok(())
    }

    /// Check ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ticks_per_second == 0 {
            return Err(ConfigError::OutOfRange {
                field: "ticks_per_second",
                reason: "must be positive".into(),
            });
        }
        if self.state_frequency == 0 {
            return Err(ConfigError::OutOfRange {
                field: "state_frequency",
                reason: "must be positive".into(),
            });
        }
        if self.max_rollback_ticks < self.state_frequency {
            return Err(ConfigError::OutOfRange {
                field: "max_rollback_ticks",
                reason: format!(
                    "{} is shorter than the state frequency {}",
                    self.max_rollback_ticks, self.state_frequency
                ),
            });
        }
        if self.missed_state_tolerance == 0 {
            return Err(ConfigError::OutOfRange {
                field: "missed_state_tolerance",
                reason: "must be at least 1".into(),
            });
        }
        let p = &self.phases;
        for (name, secs) in [
            ("phases.track_intro", p.track_intro),
            ("phases.intro_sound_cap", p.intro_sound_cap),
            ("phases.ready", p.ready),
            ("phases.set", p.set),
            ("phases.go", p.go),
            ("phases.music_credit", p.music_credit),
            ("phases.delay_finish", p.delay_finish),
        ] {
            if !secs.is_finite() || secs < 0.0 {
                return Err(ConfigError::OutOfRange {
                    field: name,
                    reason: format!("{} is not a non-negative duration", secs),
                });
            }
        }
        Ok(())
    }

    /// Clock settings derived from this config.
    pub fn clock_config(&self) -> ClockConfig {
        ClockConfig {
            ticks_per_second: self.ticks_per_second,
            durations: self.phases.clone(),
            race_now: self.race_now,
        }
    }

    /// Rewind manager settings.
    pub fn rewind_config(&self) -> RewindConfig {
        RewindConfig {
            state_frequency: self.state_frequency,
            max_rollback_ticks: self.max_rollback_ticks,
        }
    }

    /// Reconciliation settings for entities.
    pub fn reconcile_policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            missed_state_tolerance: self.missed_state_tolerance,
            smoothing_ticks: self.smoothing_ticks,
            ..ReconcilePolicy::default()
        }
    }

    /// Fixed step length in seconds.
    pub fn dt(&self) -> f32 {
        1.0 / self.ticks_per_second as f32
    }
}
