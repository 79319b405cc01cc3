//! Fusion engine configuration.

use serde::{Deserialize, Serialize};

/// Tunables for the fusion engine. Fixed at construction; the prediction
/// side has its own `PredictionConfig` with runtime setters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Gravity magnitude used to scale the estimated direction (m/s^2).
    pub gravity_magnitude: f64,
    /// Angular rate above which tracking switches to rapid mode (rad/s).
    pub rapid_angular_rate: f64,
    /// Gravity-compensated acceleration above which tracking switches to
    /// rapid mode (m/s^2).
    pub rapid_acceleration: f64,
    /// Number of buffered inertial samples required for gravity estimation.
    pub init_sample_count: usize,
    /// Visual feature count below which tracking degrades to visual-poor
    /// mode.
    pub min_feature_count: usize,
    /// Blend weight of an accepted visual pose into the canonical pose
    /// (0 = ignore visual, 1 = snap to visual).
    pub visual_blend: f64,
    /// Lost duration after which tracking quality reaches zero (s).
    pub max_lost_duration_s: f64,
    /// Propagate inertial-only over the trailing window when
    /// relocalization fails.
    pub imu_fallback: bool,
    /// Trailing window for IMU-only fallback propagation (s).
    pub imu_fallback_window_s: f64,
    /// Worker wake timeout (ms); bounds the tick period with no input.
    pub tick_timeout_ms: u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            gravity_magnitude: 9.81,
            rapid_angular_rate: 1.5,
            rapid_acceleration: 5.0,
            init_sample_count: 100,
            min_feature_count: 12,
            visual_blend: 0.7,
            max_lost_duration_s: 5.0,
            imu_fallback: true,
            imu_fallback_window_s: 0.5,
            tick_timeout_ms: 10,
        }
    }
}
