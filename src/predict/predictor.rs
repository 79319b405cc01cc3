//! Multi-model forward pose prediction.
//!
//! The predictor consumes the pose/inertial histories and produces a pose at
//! a requested future horizon. Model selection walks a fidelity ladder,
//! degrading gracefully with available history:
//!
//! 1. inertial propagation (gyro + gravity-compensated accelerometer)
//! 2. jerk extrapolation (cubic, >= 4 poses)
//! 3. constant acceleration (quadratic, >= 3 poses)
//! 4. constant velocity (linear, >= 2 poses)
//! 5. identity (single pose)
//!
//! A 16-state Kalman estimator runs alongside and can be selected as the
//! active model through `PredictionConfig::model`.

use nalgebra::{UnitQuaternion, Vector3};

use crate::geometry::SE3;
use crate::imu::{GRAVITY, ImuSample};

use super::behavior::UserBehaviorModel;
use super::config::{HeadsetState, InteractionMode, PredictionConfig, PredictionModel};
use super::history::{InertialHistory, PoseHistory, TimedPose};
use super::kalman::KalmanEstimator;

/// Horizon cap while the device is stationary (ms).
const STATIONARY_HORIZON_MS: f64 = 5.0;

/// Fraction of the configured horizon allowed during fast movement.
const FAST_HORIZON_FRACTION: f64 = 0.8;

/// Forward pose predictor over bounded pose/inertial histories.
pub struct MotionPredictor {
    config: PredictionConfig,
    interaction_mode: InteractionMode,
    poses: PoseHistory,
    inertial: InertialHistory,
    kalman: KalmanEstimator,
    behavior: UserBehaviorModel,

    // Exponentially smoothed finite differences over the pose history.
    lin_vel: Vector3<f64>,
    ang_vel: Vector3<f64>,
    lin_acc: Vector3<f64>,
    ang_acc: Vector3<f64>,
    lin_jerk: Vector3<f64>,

    /// Velocity initial condition for inertial propagation, supplied by the
    /// fusion engine's canonical estimate when available.
    engine_velocity: Option<Vector3<f64>>,
    gravity: Vector3<f64>,
    state: HeadsetState,
}

impl MotionPredictor {
    pub fn new(config: PredictionConfig) -> Self {
        Self {
            config,
            interaction_mode: InteractionMode::default(),
            poses: PoseHistory::default(),
            inertial: InertialHistory::default(),
            kalman: KalmanEstimator::default(),
            behavior: UserBehaviorModel::new(),
            lin_vel: Vector3::zeros(),
            ang_vel: Vector3::zeros(),
            lin_acc: Vector3::zeros(),
            ang_acc: Vector3::zeros(),
            lin_jerk: Vector3::zeros(),
            engine_velocity: None,
            gravity: GRAVITY,
            state: HeadsetState::Stationary,
        }
    }

    pub fn config(&self) -> &PredictionConfig {
        &self.config
    }

    /// Replace the configuration. The only mutation path for prediction
    /// tunables.
    pub fn set_config(&mut self, config: PredictionConfig) {
        self.config = config;
    }

    pub fn set_horizon_ms(&mut self, horizon_ms: f64) {
        self.config.horizon_ms = horizon_ms.max(0.0);
    }

    pub fn set_interaction_mode(&mut self, mode: InteractionMode) {
        self.interaction_mode = mode;
    }

    /// World gravity vector used for inertial propagation; set by the
    /// engine once gravity is locked.
    pub fn set_gravity(&mut self, gravity: Vector3<f64>) {
        self.gravity = gravity;
    }

    /// Canonical linear velocity from the fusion engine, used as the
    /// initial condition for inertial propagation.
    pub fn set_velocity(&mut self, velocity: Vector3<f64>) {
        self.engine_velocity = Some(velocity);
    }

    /// Record a pose and refresh derivatives, the Kalman track, behavior
    /// statistics and the motion classification.
    pub fn add_pose(&mut self, pose: SE3, timestamp_s: f64) {
        if !self.poses.push(TimedPose::new(pose.clone(), timestamp_s)) {
            return;
        }
        self.refresh_derivatives();
        self.kalman.update_pose(&pose, timestamp_s);
        self.behavior.recompute(&self.poses, &self.config);
        self.state = self.classify_current();
    }

    /// Record a raw inertial sample and feed the Kalman inertial update.
    pub fn add_inertial(&mut self, gyro: Vector3<f64>, accel: Vector3<f64>, timestamp_s: f64) {
        if !self.inertial.push(ImuSample::new(timestamp_s, accel, gyro)) {
            return;
        }
        if self.kalman.is_initialized() {
            if let Some(latest) = self.poses.latest() {
                let accel_world = latest.pose.rotation * accel + self.gravity;
                self.kalman.update_inertial(gyro, accel_world, timestamp_s);
            }
        }
    }

    /// Current motion classification.
    pub fn classify(&self) -> HeadsetState {
        self.state
    }

    pub fn behavior(&self) -> &UserBehaviorModel {
        &self.behavior
    }

    pub fn pose_history_len(&self) -> usize {
        self.poses.len()
    }

    /// Forward-predict the pose `horizon_ms` past the newest recorded pose.
    /// Returns `None` until at least one pose has been recorded.
    pub fn predict(&self, horizon_ms: f64) -> Option<TimedPose> {
        let latest = self.poses.latest()?;
        let horizon = self.effective_horizon_ms(horizon_ms);
        let t = horizon / 1000.0;

        let pose = match self.config.model {
            PredictionModel::Auto => self.predict_auto(t),
            PredictionModel::Kalman => self
                .kalman
                .predict_pose(horizon)
                .unwrap_or_else(|| latest.pose.clone()),
            PredictionModel::Inertial => {
                self.predict_inertial(t).unwrap_or_else(|| self.predict_auto(t))
            }
            PredictionModel::Jerk => self.predict_jerk(t).unwrap_or_else(|| self.predict_auto(t)),
            PredictionModel::ConstantAcceleration => self
                .predict_constant_acceleration(t)
                .unwrap_or_else(|| self.predict_auto(t)),
            PredictionModel::ConstantVelocity => self
                .predict_constant_velocity(t)
                .unwrap_or_else(|| self.predict_auto(t)),
        };

        Some(TimedPose::new(pose, latest.timestamp_s + t))
    }

    /// Requested horizon after the latency offset, the hard cap, and the
    /// per-state / behavior adaptations.
    fn effective_horizon_ms(&self, horizon_ms: f64) -> f64 {
        let mut horizon = (horizon_ms + self.config.latency_offset_ms)
            .clamp(0.0, self.config.max_horizon_ms);
        if self.config.adaptive_prediction {
            horizon = match self.state {
                HeadsetState::Stationary => horizon.min(STATIONARY_HORIZON_MS),
                HeadsetState::FastMovement => {
                    horizon.min(FAST_HORIZON_FRACTION * self.config.horizon_ms)
                }
                _ => horizon,
            };
            horizon = self.behavior.adapted_horizon_ms(horizon);
        }
        horizon
    }

    fn predict_auto(&self, t: f64) -> SE3 {
        if self.config.use_inertial {
            if let Some(pose) = self.predict_inertial(t) {
                return pose;
            }
        }
        self.predict_jerk(t)
            .or_else(|| self.predict_constant_acceleration(t))
            .or_else(|| self.predict_constant_velocity(t))
            .unwrap_or_else(|| {
                // predict() guarantees at least one pose
                self.poses.latest().unwrap().pose.clone()
            })
    }

    /// Double-integrate the newest inertial sample from the newest pose:
    /// the gyro gives the rotation delta, the gravity-compensated
    /// accelerometer gives the world-frame acceleration.
    fn predict_inertial(&self, t: f64) -> Option<SE3> {
        if !self.config.use_inertial {
            return None;
        }
        let sample = self.inertial.latest()?;
        let latest = self.poses.latest()?;

        let rotation = latest.pose.rotation * UnitQuaternion::from_scaled_axis(sample.gyro * t);
        let accel_world = latest.pose.rotation * sample.accel + self.gravity;
        let velocity = self.engine_velocity.unwrap_or(self.lin_vel);
        let translation =
            latest.pose.translation + velocity * t + 0.5 * accel_world * t * t;

        Some(SE3 {
            rotation,
            translation,
        })
    }

    /// Cubic extrapolation from smoothed velocity, acceleration and jerk.
    fn predict_jerk(&self, t: f64) -> Option<SE3> {
        if self.poses.len() < 4 {
            return None;
        }
        let latest = self.poses.latest()?;

        let translation = latest.pose.translation
            + self.lin_vel * t
            + 0.5 * self.lin_acc * t * t
            + (1.0 / 6.0) * self.lin_jerk * t * t * t;
        let omega = self.ang_vel + 0.5 * self.ang_acc * t;
        let rotation = latest.pose.rotation * UnitQuaternion::from_scaled_axis(omega * t);

        Some(SE3 {
            rotation,
            translation,
        })
    }

    /// Quadratic extrapolation; the angular rate is extrapolated linearly
    /// and averaged with the current rate before integrating.
    fn predict_constant_acceleration(&self, t: f64) -> Option<SE3> {
        if self.poses.len() < 3 {
            return None;
        }
        let latest = self.poses.latest()?;

        let translation =
            latest.pose.translation + self.lin_vel * t + 0.5 * self.lin_acc * t * t;
        let omega_extrapolated = self.ang_vel + self.ang_acc * t;
        let omega = 0.5 * (self.ang_vel + omega_extrapolated);
        let rotation = latest.pose.rotation * UnitQuaternion::from_scaled_axis(omega * t);

        Some(SE3 {
            rotation,
            translation,
        })
    }

    /// Linear extrapolation with the latest smoothed velocities.
    fn predict_constant_velocity(&self, t: f64) -> Option<SE3> {
        if self.poses.len() < 2 {
            return None;
        }
        let latest = self.poses.latest()?;

        Some(SE3 {
            rotation: latest.pose.rotation
                * UnitQuaternion::from_scaled_axis(self.ang_vel * t),
            translation: latest.pose.translation + self.lin_vel * t,
        })
    }

    /// Finite differences across the newest 2-4 poses, exponentially
    /// smoothed. Angular rates are body-frame (right-multiplied deltas).
    fn refresh_derivatives(&mut self) {
        let alpha = self.config.smoothing_alpha;
        let Some((v01, w01, _)) = self.pair_rates(0) else {
            return;
        };
        self.lin_vel = ema(self.lin_vel, v01, alpha);
        self.ang_vel = ema(self.ang_vel, w01, alpha);

        let Some((v12, w12, dt01)) = self.pair_rates(1) else {
            return;
        };
        let raw_lin_acc = (v01 - v12) / dt01;
        let raw_ang_acc = (w01 - w12) / dt01;
        self.lin_acc = ema(self.lin_acc, raw_lin_acc, alpha);
        self.ang_acc = ema(self.ang_acc, raw_ang_acc, alpha);

        let Some((v23, _, dt12)) = self.pair_rates(2) else {
            return;
        };
        let prev_lin_acc = (v12 - v23) / dt12;
        let raw_jerk = (raw_lin_acc - prev_lin_acc) / dt01;
        self.lin_jerk = ema(self.lin_jerk, raw_jerk, alpha);
    }

    /// Linear/angular rate between history entries `i` and `i + 1`, plus the
    /// time step. `None` when the pair is missing or degenerate.
    fn pair_rates(&self, i: usize) -> Option<(Vector3<f64>, Vector3<f64>, f64)> {
        let newer = self.poses.get(i)?;
        let older = self.poses.get(i + 1)?;
        let dt = newer.timestamp_s - older.timestamp_s;
        if dt <= 1e-9 {
            return None;
        }
        let lin = (newer.pose.translation - older.pose.translation) / dt;
        let ang = (older.pose.rotation.inverse() * newer.pose.rotation).scaled_axis() / dt;
        Some((lin, ang, dt))
    }

    fn classify_current(&self) -> HeadsetState {
        let scale = self.interaction_mode.threshold_scale();
        let stationary_threshold = self.config.stationary_threshold * scale;
        let fast_threshold = self.config.fast_threshold * scale;
        let mut rotation_threshold = self.config.rotation_only_threshold * scale;
        if self.config.adaptive_prediction {
            rotation_threshold = self.behavior.adapted_rotation_threshold(rotation_threshold);
        }

        let lin_speed = self.lin_vel.norm();
        let ang_speed = self.ang_vel.norm();

        if lin_speed < stationary_threshold && ang_speed < 0.1 {
            HeadsetState::Stationary
        } else if lin_speed > fast_threshold {
            HeadsetState::FastMovement
        } else if lin_speed < rotation_threshold && ang_speed > 0.2 {
            HeadsetState::RotationOnly
        } else {
            HeadsetState::SlowMovement
        }
    }

    /// Drop all history, derivatives and the Kalman track.
    pub fn reset(&mut self) {
        self.poses.clear();
        self.inertial.clear();
        self.kalman.reset();
        self.behavior.reset();
        self.lin_vel = Vector3::zeros();
        self.ang_vel = Vector3::zeros();
        self.lin_acc = Vector3::zeros();
        self.ang_acc = Vector3::zeros();
        self.lin_jerk = Vector3::zeros();
        self.engine_velocity = None;
        self.state = HeadsetState::Stationary;
    }
}

fn ema(current: Vector3<f64>, sample: Vector3<f64>, alpha: f64) -> Vector3<f64> {
    sample * alpha + current * (1.0 - alpha)
}
