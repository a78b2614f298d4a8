//! Visual Error Smoothing
//!
//! After a rollback the physics state snaps to the corrected value; the
//! rendered kart instead keeps an offset that decays to zero over a few
//! ticks. None of this is saved in snapshots.

use crate::core::math::{Quat, Transform, Vec3};

/// Positional or rotational error below which no smoothing is scheduled.
pub const MIN_POSITION_ERROR: f32 = 0.001;
/// Rotation error (radians) below which no smoothing is scheduled.
pub const MIN_ROTATION_ERROR: f32 = 0.001;

/// Cubic ease-out: fast start, slow end.
fn ease_out_cubic(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    1.0 - (1.0 - t).powi(3)
}

/// Decaying offset between the predicted and corrected transform.
#[derive(Debug, Clone, Default)]
pub struct ErrorSmoothing {
    initial_offset: Vec3,
    offset: Vec3,
    /// Rotation that takes the corrected rotation to the predicted one.
    initial_rotation: Quat,
    rotation: Quat,
    ticks_total: u32,
    ticks_remaining: u32,
}

impl ErrorSmoothing {
    /// Start blending from `predicted` towards `corrected` over `ticks`.
    ///
    /// Returns false (and clears any running correction) when the two are
    /// close enough to snap.
    pub fn start(&mut self, predicted: &Transform, corrected: &Transform, ticks: u32) -> bool {
        let offset = predicted.origin - corrected.origin;
        let angle = predicted.rotation.angle_to(corrected.rotation);
        if ticks == 0 || (offset.length() < MIN_POSITION_ERROR && angle < MIN_ROTATION_ERROR) {
            *self = Self::default();
            return false;
        }
        let inverse = Quat::new(
            -corrected.rotation.x,
            -corrected.rotation.y,
            -corrected.rotation.z,
            corrected.rotation.w,
        );
        let delta = (predicted.rotation * inverse).normalize();
        self.initial_offset = offset;
        self.offset = offset;
        self.initial_rotation = delta;
        self.rotation = delta;
        self.ticks_total = ticks;
        self.ticks_remaining = ticks;
        true
    }

    /// Advance one tick.
    pub fn advance(&mut self) {
        if self.ticks_remaining == 0 {
            return;
        }
        self.ticks_remaining -= 1;
        if self.ticks_remaining == 0 {
            self.offset = Vec3::ZERO;
            self.rotation = Quat::IDENTITY;
            return;
        }
        let t = 1.0 - self.ticks_remaining as f32 / self.ticks_total as f32;
        let ease = ease_out_cubic(t);
        self.offset = self.initial_offset.scale(1.0 - ease);
        self.rotation = self.initial_rotation.nlerp(Quat::IDENTITY, ease);
    }

    /// True while an offset is applied.
    pub fn is_active(&self) -> bool {
        self.ticks_remaining > 0
    }

    /// Current positional offset.
    pub fn offset(&self) -> Vec3 {
        self.offset
    }

    /// Rendered transform for a physics transform.
    pub fn apply(&self, physics: &Transform) -> Transform {
        if !self.is_active() {
            return *physics;
        }
        Transform::new(
            physics.origin + self.offset,
            (self.rotation * physics.rotation).normalize(),
        )
    }
}

/// Steering blend after a correction changed the steering value.
#[derive(Debug, Clone, Default)]
pub struct SteeringSmoothing {
    from: f32,
    ticks_total: u32,
    ticks_elapsed: u32,
}

impl SteeringSmoothing {
    /// Start blending from the previously shown steering.
    pub fn start(&mut self, from: f32, ticks: u32) {
        self.from = from;
        self.ticks_total = ticks;
        self.ticks_elapsed = 0;
    }

    /// Stop blending.
    pub fn clear(&mut self) {
        self.ticks_total = 0;
        self.ticks_elapsed = 0;
    }

    /// Advance one tick.
    pub fn advance(&mut self) {
        if self.ticks_elapsed < self.ticks_total {
            self.ticks_elapsed += 1;
        }
    }

    /// True while blending.
    pub fn is_active(&self) -> bool {
        self.ticks_elapsed < self.ticks_total
    }

    /// Steering to display given the simulated steering.
    pub fn apply(&self, steer: f32) -> f32 {
        if !self.is_active() {
            return steer;
        }
        let t = self.ticks_elapsed as f32 / self.ticks_total as f32;
        self.from + (steer - self.from) * t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correction_completes() {
        let mut s = ErrorSmoothing::default();
        let predicted = Transform::at(Vec3::new(10.0, 0.0, 0.0));
        let corrected = Transform::at(Vec3::ZERO);
        assert!(s.start(&predicted, &corrected, 15));

        let mut ticks = 0;
        while s.is_active() {
            s.advance();
            ticks += 1;
        }
        assert_eq!(ticks, 15);
        assert_eq!(s.offset(), Vec3::ZERO);
    }

    #[test]
    fn test_correction_reduces_offset() {
        let mut s = ErrorSmoothing::default();
        let corrected = Transform::at(Vec3::ZERO);
        s.start(&Transform::at(Vec3::new(0.0, 0.0, 4.0)), &corrected, 10);

        let rendered = s.apply(&corrected);
        assert_eq!(rendered.origin, Vec3::new(0.0, 0.0, 4.0));

        let mut last = s.offset().length();
        for _ in 0..9 {
            s.advance();
            let now = s.offset().length();
            assert!(now < last);
            last = now;
        }
    }

    #[test]
    fn test_tiny_error_snaps() {
        let mut s = ErrorSmoothing::default();
        let a = Transform::at(Vec3::new(0.0, 0.0, 0.0001));
        assert!(!s.start(&a, &Transform::default(), 10));
        assert!(!s.is_active());
    }

    #[test]
    fn test_rotation_offset_applied() {
        let mut s = ErrorSmoothing::default();
        let predicted = Transform::new(Vec3::ZERO, Quat::from_yaw(0.5));
        let corrected = Transform::new(Vec3::ZERO, Quat::from_yaw(0.1));
        assert!(s.start(&predicted, &corrected, 8));
        let shown = s.apply(&corrected);
        assert!(shown.rotation.angle_to(predicted.rotation) < 1e-2);
    }

    #[test]
    fn test_ease_out_cubic() {
        assert_eq!(ease_out_cubic(0.0), 0.0);
        assert!((ease_out_cubic(1.0) - 1.0).abs() < 0.001);
        assert!(ease_out_cubic(0.5) > 0.5);
    }

    #[test]
    fn test_steering_blend() {
        let mut s = SteeringSmoothing::default();
        s.start(-1.0, 4);
        assert_eq!(s.apply(1.0), -1.0);
        s.advance();
        s.advance();
        assert_eq!(s.apply(1.0), 0.0);
        s.advance();
        s.advance();
        assert!(!s.is_active());
        assert_eq!(s.apply(1.0), 1.0);
    }
}
