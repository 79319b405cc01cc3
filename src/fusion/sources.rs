//! Capability interfaces onto the external visual and inertial subsystems.
//!
//! The engine composes these instead of inheriting from a tracking base
//! class: the visual subsystem and the IMU transport live in the
//! surrounding application, which hands the engine shared handles at
//! construction.

use crate::geometry::SE3;
use crate::imu::{ImuCalibration, ImuSample};

/// A visual tracking result pushed into the engine's queue.
#[derive(Debug, Clone)]
pub struct VisualUpdate {
    pub pose: SE3,
    pub timestamp_s: f64,
    /// Detected keypoints per camera.
    pub keypoints_per_camera: Vec<usize>,
    /// Matched map points per camera.
    pub map_points_per_camera: Vec<usize>,
}

impl VisualUpdate {
    /// Total matched map points across cameras; the engine's measure of
    /// visual tracking quality.
    pub fn feature_count(&self) -> usize {
        self.map_points_per_camera.iter().sum()
    }
}

/// Capability interface of the visual subsystem.
pub trait VisualTracking: Send + Sync {
    /// Latest pose the visual tracker has, if any.
    fn tracked_pose(&self) -> Option<(SE3, f64)>;

    /// Current matched feature count.
    fn feature_count(&self) -> usize;

    /// Try to relocalize against the map. Called every tick while the
    /// engine is lost; returns the recovered pose on success.
    fn attempt_relocalization(&self) -> Option<SE3>;
}

/// Capability interface of the inertial subsystem.
pub trait InertialSource: Send + Sync {
    /// Sensor extrinsics and noise parameters.
    fn calibration(&self) -> ImuCalibration;

    /// Samples within `[start_s, end_s]`, used for IMU-only fallback
    /// propagation over a trailing window.
    fn measurements_in_range(&self, start_s: f64, end_s: f64) -> Vec<ImuSample>;
}
