//! The canonical pose/velocity estimate bundle.

use nalgebra::Vector3;

use crate::geometry::SE3;
use crate::imu::GRAVITY;

/// The single source of truth read by external consumers. Written only by
/// the fusion engine's worker under the estimate lock; its timestamp is
/// monotonically advanced and never rolls back except through an explicit
/// reset or state reload.
#[derive(Debug, Clone)]
pub struct CanonicalEstimate {
    pub pose: SE3,
    pub timestamp_s: f64,
    pub velocity: Vector3<f64>,
    pub acceleration: Vector3<f64>,
    pub angular_velocity: Vector3<f64>,
    /// Gravity vector in the reference frame (points toward the ground).
    pub gravity: Vector3<f64>,
}

impl CanonicalEstimate {
    pub fn new() -> Self {
        Self {
            pose: SE3::identity(),
            timestamp_s: 0.0,
            velocity: Vector3::zeros(),
            acceleration: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            gravity: GRAVITY,
        }
    }

    /// Unit gravity direction.
    pub fn gravity_direction(&self) -> Vector3<f64> {
        let norm = self.gravity.norm();
        if norm > 1e-12 {
            self.gravity / norm
        } else {
            Vector3::new(0.0, 0.0, -1.0)
        }
    }
}

impl Default for CanonicalEstimate {
    fn default() -> Self {
        Self::new()
    }
}
