//! Rolling user-behavior statistics derived from the pose history.
//!
//! Recomputed whenever the history holds at least `MIN_POSES` entries. The
//! per-state time ratios always sum to 1 across the four headset states.

use crate::predict::config::{HeadsetState, PredictionConfig};
use crate::predict::history::PoseHistory;

/// Minimum history length before statistics are considered meaningful.
pub const MIN_POSES: usize = 10;

/// Hard cap on the adaptively grown horizon (ms).
const GROWN_HORIZON_CAP_MS: f64 = 30.0;

#[derive(Debug, Clone)]
pub struct UserBehaviorModel {
    /// Average linear speed over the window (m/s).
    pub avg_linear_speed: f64,
    /// Average angular speed over the window (rad/s).
    pub avg_angular_speed: f64,
    /// Fraction of recent time spent in each `HeadsetState`
    /// (indexed by `HeadsetState::index`).
    pub state_ratios: [f64; 4],
    valid: bool,
}

impl UserBehaviorModel {
    pub fn new() -> Self {
        Self {
            avg_linear_speed: 0.0,
            avg_angular_speed: 0.0,
            state_ratios: [0.0; 4],
            valid: false,
        }
    }

    /// Statistics are meaningful once enough history has been observed.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Recompute speeds and per-state ratios from consecutive pose pairs.
    /// No-op while the history is shorter than `MIN_POSES`.
    pub fn recompute(&mut self, history: &PoseHistory, config: &PredictionConfig) {
        if history.len() < MIN_POSES {
            return;
        }

        let mut counts = [0usize; 4];
        let mut total_lin = 0.0;
        let mut total_ang = 0.0;
        let mut pairs = 0usize;

        // History is newest-first; walk consecutive pairs.
        for i in 0..history.len() - 1 {
            let newer = history.get(i).unwrap();
            let older = history.get(i + 1).unwrap();
            let dt = newer.timestamp_s - older.timestamp_s;
            if dt <= 0.0 {
                continue;
            }

            let lin_speed = (newer.pose.translation - older.pose.translation).norm() / dt;
            let ang_speed = older.pose.rotation_angle_to(&newer.pose) / dt;

            total_lin += lin_speed;
            total_ang += ang_speed;
            counts[classify_pair(lin_speed, ang_speed, config).index()] += 1;
            pairs += 1;
        }

        if pairs == 0 {
            return;
        }

        self.avg_linear_speed = total_lin / pairs as f64;
        self.avg_angular_speed = total_ang / pairs as f64;
        for (ratio, count) in self.state_ratios.iter_mut().zip(counts) {
            *ratio = count as f64 / pairs as f64;
        }
        self.valid = true;
    }

    /// Horizon after behavior-driven adaptation. Sustained stationary time
    /// shrinks the horizon; sustained fast movement grows it up to a cap.
    pub fn adapted_horizon_ms(&self, horizon_ms: f64) -> f64 {
        if !self.valid {
            return horizon_ms;
        }
        if self.state_ratios[HeadsetState::Stationary.index()] > 0.7 {
            return horizon_ms * 0.5;
        }
        if self.state_ratios[HeadsetState::FastMovement.index()] > 0.5 {
            return (horizon_ms * 1.5).min(GROWN_HORIZON_CAP_MS);
        }
        horizon_ms
    }

    /// Rotation-only threshold after adaptation: sustained rotation-only
    /// time tightens it so the classifier latches the mode sooner.
    pub fn adapted_rotation_threshold(&self, threshold: f64) -> f64 {
        if self.valid && self.state_ratios[HeadsetState::RotationOnly.index()] > 0.5 {
            threshold * 0.5
        } else {
            threshold
        }
    }
}

impl Default for UserBehaviorModel {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify one consecutive-pair interval. Same thresholds as the live
/// classifier, without interaction-mode rescaling.
fn classify_pair(lin_speed: f64, ang_speed: f64, config: &PredictionConfig) -> HeadsetState {
    if lin_speed < config.stationary_threshold && ang_speed < 0.1 {
        HeadsetState::Stationary
    } else if lin_speed > config.fast_threshold {
        HeadsetState::FastMovement
    } else if lin_speed < config.rotation_only_threshold && ang_speed > 0.2 {
        HeadsetState::RotationOnly
    } else {
        HeadsetState::SlowMovement
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::predict::history::TimedPose;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn history_moving(speed: f64, n: usize) -> PoseHistory {
        let mut history = PoseHistory::new(100);
        for i in 0..n {
            let t = i as f64 * 0.02;
            let pose = SE3 {
                rotation: UnitQuaternion::identity(),
                translation: Vector3::new(speed * t, 0.0, 0.0),
            };
            history.push(TimedPose::new(pose, t));
        }
        history
    }

    #[test]
    fn test_ratios_sum_to_one() {
        let mut model = UserBehaviorModel::new();
        let config = PredictionConfig::default();
        model.recompute(&history_moving(0.5, 20), &config);

        assert!(model.is_valid());
        let sum: f64 = model.state_ratios.iter().sum();
        assert_relative_eq!(sum, 1.0, epsilon = 0.01);
    }

    #[test]
    fn test_not_valid_below_min_poses() {
        let mut model = UserBehaviorModel::new();
        let config = PredictionConfig::default();
        model.recompute(&history_moving(0.5, MIN_POSES - 1), &config);
        assert!(!model.is_valid());
    }

    #[test]
    fn test_stationary_shrinks_horizon() {
        let mut model = UserBehaviorModel::new();
        let config = PredictionConfig::default();
        model.recompute(&history_moving(0.0, 20), &config);

        assert!(model.state_ratios[HeadsetState::Stationary.index()] > 0.7);
        assert_relative_eq!(model.adapted_horizon_ms(20.0), 10.0);
    }

    #[test]
    fn test_fast_movement_grows_horizon_with_cap() {
        let mut model = UserBehaviorModel::new();
        let config = PredictionConfig::default();
        model.recompute(&history_moving(2.0, 20), &config);

        assert!(model.state_ratios[HeadsetState::FastMovement.index()] > 0.5);
        assert_relative_eq!(model.adapted_horizon_ms(16.0), 24.0);
        // Growth is capped at 30 ms
        assert_relative_eq!(model.adapted_horizon_ms(40.0), 30.0);
    }

    #[test]
    fn test_average_speed_estimate() {
        let mut model = UserBehaviorModel::new();
        let config = PredictionConfig::default();
        model.recompute(&history_moving(1.5, 20), &config);
        assert_relative_eq!(model.avg_linear_speed, 1.5, epsilon = 0.05);
    }
}
