//! 16-state Kalman estimator over pose, velocity, angular velocity and
//! linear acceleration.
//!
//! State layout: `[p(3), q(4, wxyz), v(3), w(3), a(3)]`. The predict step is
//! linear-Gaussian except the orientation, which is propagated
//! multiplicatively by integrating angular velocity and renormalized. Two
//! measurement paths exist: a 7-dimensional pose update and a 6-dimensional
//! inertial update.

use nalgebra::{Quaternion, SMatrix, SVector, UnitQuaternion, Vector3};

use crate::geometry::SE3;

/// 16-element filter state vector.
pub type Vector16 = SVector<f64, 16>;
/// 16×16 covariance matrix.
pub type Matrix16 = SMatrix<f64, 16, 16>;
/// 7×7 pose-measurement noise matrix.
pub type Matrix7 = SMatrix<f64, 7, 7>;
/// 6×6 inertial-measurement noise matrix.
pub type Matrix6 = SMatrix<f64, 6, 6>;

const P_OFF: usize = 0;
const Q_OFF: usize = 3;
const V_OFF: usize = 7;
const W_OFF: usize = 10;
const A_OFF: usize = 13;

/// Diagonal noise levels for the filter; fixed once constructed.
#[derive(Debug, Clone, Copy)]
pub struct KalmanNoise {
    pub process_position: f64,
    pub process_orientation: f64,
    pub process_velocity: f64,
    pub process_angular: f64,
    pub process_acceleration: f64,
    pub measure_position: f64,
    pub measure_orientation: f64,
    pub measure_angular: f64,
    pub measure_acceleration: f64,
}

impl Default for KalmanNoise {
    fn default() -> Self {
        Self {
            process_position: 1e-4,
            process_orientation: 1e-4,
            process_velocity: 1e-3,
            process_angular: 1e-2,
            process_acceleration: 1e-1,
            measure_position: 1e-4,
            measure_orientation: 1e-4,
            measure_angular: 1e-3,
            measure_acceleration: 1e-1,
        }
    }
}

pub struct KalmanEstimator {
    x: Vector16,
    p: Matrix16,
    q: Matrix16,
    r_pose: Matrix7,
    r_inertial: Matrix6,
    initialized: bool,
    last_timestamp_s: Option<f64>,
}

impl KalmanEstimator {
    pub fn new(noise: KalmanNoise) -> Self {
        let mut x = Vector16::zeros();
        x[Q_OFF] = 1.0; // identity quaternion (w first)

        let mut q = Matrix16::zeros();
        for i in 0..3 {
            q[(P_OFF + i, P_OFF + i)] = noise.process_position;
            q[(V_OFF + i, V_OFF + i)] = noise.process_velocity;
            q[(W_OFF + i, W_OFF + i)] = noise.process_angular;
            q[(A_OFF + i, A_OFF + i)] = noise.process_acceleration;
        }
        for i in 0..4 {
            q[(Q_OFF + i, Q_OFF + i)] = noise.process_orientation;
        }

        let mut r_pose = Matrix7::zeros();
        for i in 0..3 {
            r_pose[(i, i)] = noise.measure_position;
        }
        for i in 3..7 {
            r_pose[(i, i)] = noise.measure_orientation;
        }

        let mut r_inertial = Matrix6::zeros();
        for i in 0..3 {
            r_inertial[(i, i)] = noise.measure_angular;
            r_inertial[(i + 3, i + 3)] = noise.measure_acceleration;
        }

        Self {
            x,
            p: Matrix16::identity(),
            q,
            r_pose,
            r_inertial,
            initialized: false,
            last_timestamp_s: None,
        }
    }

    /// Clear state and covariance; noise matrices are preserved.
    pub fn reset(&mut self) {
        self.x = Vector16::zeros();
        self.x[Q_OFF] = 1.0;
        self.p = Matrix16::identity();
        self.initialized = false;
        self.last_timestamp_s = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn position(&self) -> Vector3<f64> {
        self.x.fixed_rows::<3>(P_OFF).into_owned()
    }

    pub fn orientation(&self) -> UnitQuaternion<f64> {
        quat_from_state(&self.x)
    }

    pub fn velocity(&self) -> Vector3<f64> {
        self.x.fixed_rows::<3>(V_OFF).into_owned()
    }

    pub fn angular_velocity(&self) -> Vector3<f64> {
        self.x.fixed_rows::<3>(W_OFF).into_owned()
    }

    pub fn acceleration(&self) -> Vector3<f64> {
        self.x.fixed_rows::<3>(A_OFF).into_owned()
    }

    /// Seed the full state directly (used on initialization and when
    /// reloading persisted state).
    pub fn seed(&mut self, pose: &SE3, velocity: Vector3<f64>, timestamp_s: f64) {
        self.x = Vector16::zeros();
        self.x.fixed_rows_mut::<3>(P_OFF).copy_from(&pose.translation);
        write_quat(&mut self.x, &pose.rotation);
        self.x.fixed_rows_mut::<3>(V_OFF).copy_from(&velocity);
        self.p = Matrix16::identity();
        self.initialized = true;
        self.last_timestamp_s = Some(timestamp_s);
    }

    /// Time-propagate state and covariance by `dt` seconds.
    pub fn predict(&mut self, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        let f = transition_matrix(dt);
        self.x = propagate_state(&self.x, dt);
        self.p = f * self.p * f.transpose() + self.q;
    }

    /// 7-dimensional pose measurement update (position + orientation).
    ///
    /// The quaternion innovation is formed from the minimal axis-angle
    /// residual: the measured quaternion is flipped into the hemisphere of
    /// the state estimate before differencing, so the correction always
    /// takes the short way around.
    pub fn update_pose(&mut self, pose: &SE3, timestamp_s: f64) {
        if !self.initialized {
            self.seed(pose, Vector3::zeros(), timestamp_s);
            return;
        }
        if let Some(last) = self.last_timestamp_s {
            self.predict(timestamp_s - last);
        }
        self.last_timestamp_s = Some(timestamp_s);

        let q_state = quat_from_state(&self.x);
        let mut q_meas = *pose.rotation.quaternion();
        if q_state.quaternion().dot(&q_meas) < 0.0 {
            q_meas = -q_meas;
        }

        let mut y = SVector::<f64, 7>::zeros();
        let p_res = pose.translation - self.position();
        y.fixed_rows_mut::<3>(0).copy_from(&p_res);
        y[3] = q_meas.w - self.x[Q_OFF];
        y[4] = q_meas.i - self.x[Q_OFF + 1];
        y[5] = q_meas.j - self.x[Q_OFF + 2];
        y[6] = q_meas.k - self.x[Q_OFF + 3];

        let mut h = SMatrix::<f64, 7, 16>::zeros();
        for i in 0..3 {
            h[(i, P_OFF + i)] = 1.0;
        }
        for i in 0..4 {
            h[(3 + i, Q_OFF + i)] = 1.0;
        }

        let s = h * self.p * h.transpose() + self.r_pose;
        let Some(s_inv) = s.try_inverse() else {
            return;
        };
        let k = self.p * h.transpose() * s_inv;

        self.x += k * y;
        normalize_quat(&mut self.x);
        self.p = (Matrix16::identity() - k * h) * self.p;
    }

    /// 6-dimensional inertial measurement update: angular velocity (body
    /// gyro) and gravity-compensated linear acceleration in the world frame.
    pub fn update_inertial(
        &mut self,
        angular_velocity: Vector3<f64>,
        acceleration: Vector3<f64>,
        timestamp_s: f64,
    ) {
        if !self.initialized {
            return;
        }
        if let Some(last) = self.last_timestamp_s {
            self.predict(timestamp_s - last);
        }
        self.last_timestamp_s = Some(timestamp_s);

        let mut y = SVector::<f64, 6>::zeros();
        y.fixed_rows_mut::<3>(0)
            .copy_from(&(angular_velocity - self.angular_velocity()));
        y.fixed_rows_mut::<3>(3)
            .copy_from(&(acceleration - self.acceleration()));

        let mut h = SMatrix::<f64, 6, 16>::zeros();
        for i in 0..3 {
            h[(i, W_OFF + i)] = 1.0;
            h[(3 + i, A_OFF + i)] = 1.0;
        }

        let s = h * self.p * h.transpose() + self.r_inertial;
        let Some(s_inv) = s.try_inverse() else {
            return;
        };
        let k = self.p * h.transpose() * s_inv;

        self.x += k * y;
        normalize_quat(&mut self.x);
        self.p = (Matrix16::identity() - k * h) * self.p;
    }

    /// Forward-predict the pose by `horizon_ms` without committing anything
    /// to filter state. Runs predict-only steps on a copy.
    pub fn predict_pose(&self, horizon_ms: f64) -> Option<SE3> {
        if !self.initialized {
            return None;
        }
        let mut x = self.x;
        let mut remaining = horizon_ms / 1000.0;
        const STEP_S: f64 = 0.004;
        while remaining > 0.0 {
            let dt = remaining.min(STEP_S);
            x = propagate_state(&x, dt);
            remaining -= dt;
        }
        Some(SE3 {
            rotation: quat_from_state(&x),
            translation: x.fixed_rows::<3>(P_OFF).into_owned(),
        })
    }
}

impl Default for KalmanEstimator {
    fn default() -> Self {
        Self::new(KalmanNoise::default())
    }
}

fn transition_matrix(dt: f64) -> Matrix16 {
    let mut f = Matrix16::identity();
    for i in 0..3 {
        f[(P_OFF + i, V_OFF + i)] = dt;
        f[(V_OFF + i, A_OFF + i)] = dt;
    }
    f
}

fn propagate_state(x: &Vector16, dt: f64) -> Vector16 {
    let mut next = *x;
    let v = x.fixed_rows::<3>(V_OFF).into_owned();
    let w = x.fixed_rows::<3>(W_OFF).into_owned();
    let a = x.fixed_rows::<3>(A_OFF).into_owned();

    let p = x.fixed_rows::<3>(P_OFF).into_owned() + v * dt;
    next.fixed_rows_mut::<3>(P_OFF).copy_from(&p);
    next.fixed_rows_mut::<3>(V_OFF).copy_from(&(v + a * dt));

    let q = quat_from_state(x) * UnitQuaternion::from_scaled_axis(w * dt);
    write_quat(&mut next, &q);
    next
}

fn quat_from_state(x: &Vector16) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(Quaternion::new(
        x[Q_OFF],
        x[Q_OFF + 1],
        x[Q_OFF + 2],
        x[Q_OFF + 3],
    ))
}

fn write_quat(x: &mut Vector16, q: &UnitQuaternion<f64>) {
    x[Q_OFF] = q.w;
    x[Q_OFF + 1] = q.i;
    x[Q_OFF + 2] = q.j;
    x[Q_OFF + 3] = q.k;
}

fn normalize_quat(x: &mut Vector16) {
    let q = Quaternion::new(x[Q_OFF], x[Q_OFF + 1], x[Q_OFF + 2], x[Q_OFF + 3]);
    let n = q.norm();
    if n > 1e-12 {
        x[Q_OFF] = q.w / n;
        x[Q_OFF + 1] = q.i / n;
        x[Q_OFF + 2] = q.j / n;
        x[Q_OFF + 3] = q.k / n;
    } else {
        x[Q_OFF] = 1.0;
        x[Q_OFF + 1] = 0.0;
        x[Q_OFF + 2] = 0.0;
        x[Q_OFF + 3] = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_first_pose_seeds_state() {
        let mut kf = KalmanEstimator::default();
        assert!(!kf.is_initialized());

        let pose = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.0, 0.3),
            translation: Vector3::new(1.0, 2.0, 3.0),
        };
        kf.update_pose(&pose, 0.0);

        assert!(kf.is_initialized());
        assert_relative_eq!(kf.position(), pose.translation, epsilon = 1e-12);
        assert!(pose.rotation.angle_to(&kf.orientation()) < 1e-12);
    }

    #[test]
    fn test_converges_on_constant_velocity_track() {
        let mut kf = KalmanEstimator::default();
        let velocity = Vector3::new(1.0, 0.0, 0.0);
        let dt = 0.02;

        for i in 0..50 {
            let t = i as f64 * dt;
            let pose = SE3 {
                rotation: UnitQuaternion::identity(),
                translation: velocity * t,
            };
            kf.update_pose(&pose, t);
        }

        assert_relative_eq!(kf.velocity().x, 1.0, epsilon = 0.1);
        let predicted = kf.predict_pose(100.0).unwrap();
        let expected_x = 49.0 * dt * 1.0 + 0.1;
        assert_relative_eq!(predicted.translation.x, expected_x, epsilon = 0.05);
    }

    #[test]
    fn test_quaternion_stays_normalized() {
        let mut kf = KalmanEstimator::default();
        kf.update_pose(&SE3::identity(), 0.0);
        for i in 1..100 {
            let t = i as f64 * 0.01;
            let pose = SE3 {
                rotation: UnitQuaternion::from_axis_angle(&Vector3::z_axis(), t),
                translation: Vector3::zeros(),
            };
            kf.update_pose(&pose, t);
            kf.update_inertial(Vector3::new(0.0, 0.0, 1.0), Vector3::zeros(), t);
        }
        assert_relative_eq!(kf.orientation().quaternion().norm(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_hemisphere_flip_takes_short_way() {
        let mut kf = KalmanEstimator::default();
        kf.update_pose(&SE3::identity(), 0.0);

        // Same rotation expressed with a negated quaternion must not yank
        // the estimate across the sphere.
        let q = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.01);
        let q_neg = UnitQuaternion::from_quaternion(-*q.quaternion());
        kf.update_pose(
            &SE3 {
                rotation: q_neg,
                translation: Vector3::zeros(),
            },
            0.01,
        );

        assert!(kf.orientation().angle() < 0.02);
    }

    #[test]
    fn test_inertial_update_pulls_angular_velocity() {
        let mut kf = KalmanEstimator::default();
        kf.update_pose(&SE3::identity(), 0.0);
        for i in 1..50 {
            let t = i as f64 * 0.005;
            kf.update_inertial(Vector3::new(0.0, 0.0, 2.0), Vector3::zeros(), t);
        }
        assert_relative_eq!(kf.angular_velocity().z, 2.0, epsilon = 0.2);
    }

    #[test]
    fn test_predict_pose_does_not_commit() {
        let mut kf = KalmanEstimator::default();
        kf.update_pose(&SE3::identity(), 0.0);
        kf.update_pose(
            &SE3 {
                rotation: UnitQuaternion::identity(),
                translation: Vector3::new(0.1, 0.0, 0.0),
            },
            0.1,
        );

        let before = kf.position();
        let _ = kf.predict_pose(50.0);
        assert_relative_eq!(kf.position(), before, epsilon = 1e-15);
    }
}
