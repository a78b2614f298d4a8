//! Kart Controls
//!
//! Per-kart input state. Analog axes are stored quantized so that a
//! decoded control block is bit-identical to the one that was encoded.
//!
//! Packed layout (5 bytes):
//! ```text
//! [steer i16][accel u16][buttons u8]
//! buttons: bit0 brake, bit1 nitro, bits2-3 skid, bit4 rescue,
//!          bit5 fire, bit6 look back
//! ```

use serde::{Deserialize, Serialize};

use crate::core::buffer::{BufferError, StateReader, StateWriter};

/// Kart index within the race.
pub type KartId = u8;

/// Packed size in bytes.
pub const CONTROLS_SIZE: usize = 5;

const BRAKE: u8 = 1 << 0;
const NITRO: u8 = 1 << 1;
const SKID_SHIFT: u8 = 2;
const SKID_MASK: u8 = 0b11 << SKID_SHIFT;
const RESCUE: u8 = 1 << 4;
const FIRE: u8 = 1 << 5;
const LOOK_BACK: u8 = 1 << 6;

/// Skid button state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SkidControl {
    /// Not skidding.
    #[default]
    None,
    /// Skid, direction chosen by steering.
    Skid,
    /// Skid left.
    Left,
    /// Skid right.
    Right,
}

impl SkidControl {
    fn to_bits(self) -> u8 {
        match self {
            SkidControl::None => 0,
            SkidControl::Skid => 1,
            SkidControl::Left => 2,
            SkidControl::Right => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => SkidControl::None,
            1 => SkidControl::Skid,
            2 => SkidControl::Left,
            _ => SkidControl::Right,
        }
    }
}

/// Control inputs for one kart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KartControls {
    steer: i16,
    accel: u16,
    buttons: u8,
}

impl KartControls {
    /// Neutral controls.
    pub const fn new() -> Self {
        Self {
            steer: 0,
            accel: 0,
            buttons: 0,
        }
    }

    /// Steering in [-1, 1]; negative is left.
    pub fn steer(&self) -> f32 {
        self.steer as f32 / i16::MAX as f32
    }

    /// Set steering, clamped and quantized.
    pub fn set_steer(&mut self, value: f32) {
        let v = value.clamp(-1.0, 1.0);
        self.steer = (v * i16::MAX as f32).round() as i16;
    }

    /// Throttle in [0, 1].
    pub fn accel(&self) -> f32 {
        self.accel as f32 / u16::MAX as f32
    }

    /// Set throttle, clamped and quantized.
    pub fn set_accel(&mut self, value: f32) {
        let v = value.clamp(0.0, 1.0);
        self.accel = (v * u16::MAX as f32).round() as u16;
    }

    fn flag(&self, bit: u8) -> bool {
        self.buttons & bit != 0
    }

    fn set_flag(&mut self, bit: u8, on: bool) {
        if on {
            self.buttons |= bit;
        } else {
            self.buttons &= !bit;
        }
    }

    /// Brake held.
    pub fn brake(&self) -> bool {
        self.flag(BRAKE)
    }

    /// Set brake.
    pub fn set_brake(&mut self, on: bool) {
        self.set_flag(BRAKE, on);
    }

    /// Nitro held.
    pub fn nitro(&self) -> bool {
        self.flag(NITRO)
    }

    /// Set nitro.
    pub fn set_nitro(&mut self, on: bool) {
        self.set_flag(NITRO, on);
    }

    /// Skid state.
    pub fn skid(&self) -> SkidControl {
        SkidControl::from_bits((self.buttons & SKID_MASK) >> SKID_SHIFT)
    }

    /// Set skid state.
    pub fn set_skid(&mut self, skid: SkidControl) {
        self.buttons = (self.buttons & !SKID_MASK) | (skid.to_bits() << SKID_SHIFT);
    }

    /// Rescue requested.
    pub fn rescue(&self) -> bool {
        self.flag(RESCUE)
    }

    /// Set rescue.
    pub fn set_rescue(&mut self, on: bool) {
        self.set_flag(RESCUE, on);
    }

    /// Fire held.
    pub fn fire(&self) -> bool {
        self.flag(FIRE)
    }

    /// Set fire.
    pub fn set_fire(&mut self, on: bool) {
        self.set_flag(FIRE, on);
    }

    /// Look back held.
    pub fn look_back(&self) -> bool {
        self.flag(LOOK_BACK)
    }

    /// Set look back.
    pub fn set_look_back(&mut self, on: bool) {
        self.set_flag(LOOK_BACK, on);
    }

    /// Append the packed form.
    pub fn save_state(&self, w: &mut StateWriter) {
        w.add_i16(self.steer).add_u16(self.accel).add_u8(self.buttons);
    }

    /// Read the packed form.
    pub fn restore_state(r: &mut StateReader<'_>) -> Result<Self, BufferError> {
        let steer = r.get_i16()?;
        let accel = r.get_u16()?;
        let buttons = r.get_u8()?;
        if buttons & 0x80 != 0 {
            return Err(BufferError::InvalidValue {
                field: "buttons",
                value: buttons as u32,
            });
        }
        Ok(Self { steer, accel, buttons })
    }
}

/// A control change for one kart, replayed during rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KartControlEvent {
    /// Kart the controls belong to.
    pub kart: KartId,
    /// New controls.
    pub controls: KartControls,
}
