//! Prediction configuration and motion classification types.

use serde::{Deserialize, Serialize};

/// Coarse classification of current device motion, driving adaptive
/// prediction horizons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeadsetState {
    Stationary,
    SlowMovement,
    FastMovement,
    RotationOnly,
}

impl HeadsetState {
    /// Index into per-state ratio arrays.
    pub fn index(self) -> usize {
        match self {
            HeadsetState::Stationary => 0,
            HeadsetState::SlowMovement => 1,
            HeadsetState::FastMovement => 2,
            HeadsetState::RotationOnly => 3,
        }
    }
}

impl Default for HeadsetState {
    fn default() -> Self {
        Self::Stationary
    }
}

/// User interaction mode; rescales the classification thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractionMode {
    /// Tighter thresholds: small motions matter more when seated.
    Seated,
    Standing,
    /// Looser thresholds: walking-scale motion is expected.
    RoomScale,
}

impl InteractionMode {
    /// Multiplier applied to all classification thresholds.
    pub fn threshold_scale(self) -> f64 {
        match self {
            InteractionMode::Seated => 0.5,
            InteractionMode::Standing => 1.0,
            InteractionMode::RoomScale => 1.5,
        }
    }
}

impl Default for InteractionMode {
    fn default() -> Self {
        Self::Standing
    }
}

/// Numerical prediction model selection.
///
/// `Auto` walks the fidelity ladder (inertial, jerk, constant-acceleration,
/// constant-velocity, identity) degrading with available history; the other
/// variants force a single model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictionModel {
    Auto,
    ConstantVelocity,
    ConstantAcceleration,
    Jerk,
    Inertial,
    Kalman,
}

impl Default for PredictionModel {
    fn default() -> Self {
        Self::Auto
    }
}

/// Tunables for the motion predictor. Mutated only through explicit
/// setters on the predictor; read freely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionConfig {
    /// Default forward-prediction horizon (ms).
    pub horizon_ms: f64,
    /// Hard cap on any requested horizon (ms).
    pub max_horizon_ms: f64,
    /// |v| below which the device counts as stationary (m/s).
    pub stationary_threshold: f64,
    /// |v| above which the device counts as fast-moving (m/s).
    pub fast_threshold: f64,
    /// |v| below which rotation-dominant motion counts as rotation-only (m/s).
    pub rotation_only_threshold: f64,
    /// Scale horizons per headset state and behavior statistics.
    pub adaptive_prediction: bool,
    /// Extra horizon added to every request to cover pipeline latency (ms).
    pub latency_offset_ms: f64,
    /// Exponential smoothing factor for finite-difference derivatives.
    pub smoothing_alpha: f64,
    /// Prefer inertial propagation when samples are available.
    pub use_inertial: bool,
    /// Model selection.
    pub model: PredictionModel,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            horizon_ms: 16.0,
            max_horizon_ms: 50.0,
            stationary_threshold: 0.05,
            fast_threshold: 1.0,
            rotation_only_threshold: 0.1,
            adaptive_prediction: true,
            latency_offset_ms: 0.0,
            smoothing_alpha: 0.6,
            use_inertial: true,
            model: PredictionModel::Auto,
        }
    }
}
