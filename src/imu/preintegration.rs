use nalgebra::{UnitQuaternion, Vector3};

use crate::error::FusionError;

use super::sample::{ImuBias, ImuSample};

/// Accumulated motion over a window of bias-corrected inertial samples.
///
/// Deltas are gravity-free: the engine applies gravity when it advances the
/// canonical estimate. Consumed exactly once, then the integrator resets to
/// identity/zero.
#[derive(Debug, Clone, Copy)]
pub struct PreintegratedDelta {
    pub delta_rot: UnitQuaternion<f64>,
    pub delta_vel: Vector3<f64>,
    pub delta_pos: Vector3<f64>,
    pub dt: f64,
}

impl PreintegratedDelta {
    pub fn identity() -> Self {
        Self {
            delta_rot: UnitQuaternion::identity(),
            delta_vel: Vector3::zeros(),
            delta_pos: Vector3::zeros(),
            dt: 0.0,
        }
    }
}

/// IMU preintegrator: folds high-rate samples into a single relative-motion
/// delta for the lower-rate estimator.
///
/// Accumulated deltas are bias-dependent, so the integrator must be
/// reconstructed (here: reset via `set_bias`) whenever the active bias
/// changes.
pub struct Preintegrator {
    bias: ImuBias,
    delta: PreintegratedDelta,
}

impl Preintegrator {
    pub fn new(bias: ImuBias) -> Self {
        Self {
            bias,
            delta: PreintegratedDelta::identity(),
        }
    }

    /// Append one sample using first-order discrete propagation
    /// (update-then-append): the rotation delta is advanced by the sample's
    /// angular rate over `dt`, the velocity delta by the rotated specific
    /// force, the position delta by the updated velocity.
    ///
    /// Rejects `dt <= 0` without mutating the accumulated state.
    pub fn integrate_sample(&mut self, sample: &ImuSample, dt: f64) -> Result<(), FusionError> {
        if dt <= 0.0 {
            return Err(FusionError::InvalidTimestamp { dt });
        }

        let corrected = self.bias.correct(sample);

        self.delta.delta_rot *= UnitQuaternion::from_scaled_axis(corrected.gyro * dt);
        self.delta.delta_vel += (self.delta.delta_rot * corrected.accel) * dt;
        self.delta.delta_pos += self.delta.delta_vel * dt;
        self.delta.dt += dt;
        Ok(())
    }

    /// Return the accumulated delta and reset to identity/zero.
    pub fn consume(&mut self) -> PreintegratedDelta {
        std::mem::replace(&mut self.delta, PreintegratedDelta::identity())
    }

    /// Replace the active bias. Discards the accumulated delta, which was
    /// integrated under the previous bias.
    pub fn set_bias(&mut self, bias: ImuBias) {
        self.bias = bias;
        self.delta = PreintegratedDelta::identity();
    }

    pub fn bias(&self) -> ImuBias {
        self.bias
    }

    /// Elapsed time accumulated since the last `consume`.
    pub fn elapsed(&self) -> f64 {
        self.delta.dt
    }
}
