//! Fixed-Layout Bitfields
//!
//! Small booleans and counters packed into one integer so a kart snapshot
//! stays compact. Each sub-field has a fixed position and width; all
//! masking and shifting lives here.
//!
//! ```text
//! KartFlags (u16)
//!  15   14   13   12 ................ 0
//! [fire][anim][plng][ invulnerable ticks ]
//!
//! AnimationWord (u32)
//!  31 ... 27  26 ........................ 0
//! [  kind  ][        end ticks           ]
//! ```

use serde::{Deserialize, Serialize};

// =============================================================================
// KART FLAGS
// =============================================================================

const FIRE_BIT: u16 = 1 << 15;
const ANIMATION_BIT: u16 = 1 << 14;
const PLUNGER_BIT: u16 = 1 << 13;
const INVULNERABLE_MASK: u16 = (1 << 13) - 1;

/// Packed kart status word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KartFlags(u16);

impl KartFlags {
    /// Largest invulnerability counter the field can hold.
    pub const MAX_INVULNERABLE_TICKS: u16 = INVULNERABLE_MASK;

    /// All flags clear, zero ticks.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Wrap a raw word read from the wire.
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Raw word for the wire.
    pub const fn bits(self) -> u16 {
        self.0
    }

    fn set_bit(&mut self, bit: u16, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    /// Kart fired its weapon this tick.
    pub fn fire(self) -> bool {
        self.0 & FIRE_BIT != 0
    }

    /// Set the fire flag.
    pub fn set_fire(&mut self, on: bool) {
        self.set_bit(FIRE_BIT, on);
    }

    /// An animation (rescue, explosion, cannon) is running.
    pub fn animation(self) -> bool {
        self.0 & ANIMATION_BIT != 0
    }

    /// Set the animation flag.
    pub fn set_animation(&mut self, on: bool) {
        self.set_bit(ANIMATION_BIT, on);
    }

    /// A plunger is blocking the kart's view.
    pub fn plunger(self) -> bool {
        self.0 & PLUNGER_BIT != 0
    }

    /// Set the plunger flag.
    pub fn set_plunger(&mut self, on: bool) {
        self.set_bit(PLUNGER_BIT, on);
    }

    /// Remaining invulnerability ticks.
    pub fn invulnerable_ticks(self) -> u16 {
        self.0 & INVULNERABLE_MASK
    }

    /// Store the invulnerability counter.
    ///
    /// # Panics
    /// Panics if `ticks` does not fit in 13 bits. Callers clamp first.
    pub fn set_invulnerable_ticks(&mut self, ticks: u16) {
        assert!(
            ticks <= INVULNERABLE_MASK,
            "invulnerable ticks {} exceed {}",
            ticks,
            INVULNERABLE_MASK
        );
        self.0 = (self.0 & !INVULNERABLE_MASK) | ticks;
    }
}

// =============================================================================
// ANIMATION WORD
// =============================================================================

const END_TICKS_BITS: u32 = 27;
const END_TICKS_MASK: u32 = (1 << END_TICKS_BITS) - 1;
const KIND_MASK: u32 = (1 << (32 - END_TICKS_BITS)) - 1;

/// Packed animation descriptor: which animation, and the tick it ends at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnimationWord(u32);

impl AnimationWord {
    /// Largest end tick representable.
    pub const MAX_END_TICKS: u32 = END_TICKS_MASK;

    /// Largest kind value representable.
    pub const MAX_KIND: u8 = KIND_MASK as u8;

    /// Pack a kind and end tick.
    ///
    /// # Panics
    /// Panics if either value overflows its field.
    pub fn new(kind: u8, end_ticks: u32) -> Self {
        assert!(kind as u32 <= KIND_MASK, "animation kind {} out of range", kind);
        assert!(end_ticks <= END_TICKS_MASK, "animation end ticks {} out of range", end_ticks);
        Self(((kind as u32) << END_TICKS_BITS) | end_ticks)
    }

    /// Wrap a raw word.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw word.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Animation kind.
    pub fn kind(self) -> u8 {
        (self.0 >> END_TICKS_BITS) as u8
    }

    /// Tick at which the animation finishes.
    pub fn end_ticks(self) -> u32 {
        self.0 & END_TICKS_MASK
    }
}
