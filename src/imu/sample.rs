use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;

/// Standard gravity magnitude (m/s^2).
pub const GRAVITY_MAGNITUDE: f64 = 9.81;

/// Gravity vector in the world frame (m/s^2).
///
/// Convention used throughout the crate: the gravity *direction* points
/// toward the ground, i.e. world -Z at rest. A stationary accelerometer
/// therefore reads a mean specific force of `+GRAVITY_MAGNITUDE * up`.
pub const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, -GRAVITY_MAGNITUDE);

/// Single IMU measurement: specific force and angular rate in the body
/// frame, stamped in seconds.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    pub timestamp_s: f64,
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl ImuSample {
    pub fn new(timestamp_s: f64, accel: Vector3<f64>, gyro: Vector3<f64>) -> Self {
        Self {
            timestamp_s,
            accel,
            gyro,
        }
    }
}

/// Slowly-varying sensor offsets, subtracted from raw readings before
/// integration. Mutated only by the fusion engine during steady-state
/// updates; persisted as part of saved state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuBias {
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl ImuBias {
    pub fn zero() -> Self {
        Self {
            accel: Vector3::zeros(),
            gyro: Vector3::zeros(),
        }
    }

    /// Bias-corrected copy of a raw sample.
    pub fn correct(&self, sample: &ImuSample) -> ImuSample {
        ImuSample {
            timestamp_s: sample.timestamp_s,
            accel: sample.accel - self.accel,
            gyro: sample.gyro - self.gyro,
        }
    }
}

impl Default for ImuBias {
    fn default() -> Self {
        Self::zero()
    }
}

/// IMU noise densities and random-walk parameters (1-sigma), as reported by
/// the inertial source's calibration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ImuNoise {
    pub sigma_gyro: f64,
    pub sigma_accel: f64,
    pub walk_gyro: f64,
    pub walk_accel: f64,
}

impl Default for ImuNoise {
    fn default() -> Self {
        // Representative consumer-grade MEMS values
        Self {
            sigma_gyro: 1.7e-4,
            sigma_accel: 2.0e-3,
            walk_gyro: 1.9e-5,
            walk_accel: 3.0e-3,
        }
    }
}

/// Calibration handed over by the inertial source: body-from-sensor
/// extrinsics plus noise parameters.
#[derive(Debug, Clone)]
pub struct ImuCalibration {
    pub extrinsics: SE3,
    pub noise: ImuNoise,
}

impl Default for ImuCalibration {
    fn default() -> Self {
        Self {
            extrinsics: SE3::identity(),
            noise: ImuNoise::default(),
        }
    }
}
