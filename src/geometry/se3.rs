use nalgebra::{Isometry3, Matrix3, Matrix4, Rotation3, Translation3, UnitQuaternion, Vector3};

/// Rigid body transform in SE(3).
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Construct from rotation matrix and translation.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot3 = Rotation3::from_matrix_unchecked(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
        }
    }

    /// Construct from homogeneous 4x4 matrix.
    pub fn from_matrix(mat: Matrix4<f64>) -> Self {
        let rotation_mat = mat.fixed_view::<3, 3>(0, 0).into_owned();
        let translation = Vector3::new(mat[(0, 3)], mat[(1, 3)], mat[(2, 3)]);
        let rot3 = Rotation3::from_matrix_unchecked(rotation_mat);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
        }
    }

    /// Convert to homogeneous 4x4 matrix.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let iso: Isometry3<f64> =
            Isometry3::from_parts(Translation3::from(self.translation), self.rotation);
        iso.to_homogeneous()
    }

    /// Inverse transform.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let t_inv = -(rot_inv * self.translation);
        Self {
            rotation: rot_inv,
            translation: t_inv,
        }
    }

    /// Compose two transforms (self @ other).
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Transform a single point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Interpolate between two transforms (slerp rotation, lerp translation).
    /// `alpha` in [0, 1]; 0 returns `self`, 1 returns `other`.
    pub fn interpolate(&self, other: &SE3, alpha: f64) -> Self {
        let rotation = self
            .rotation
            .try_slerp(&other.rotation, alpha, 1e-9)
            .unwrap_or(other.rotation);
        let translation = self.translation.lerp(&other.translation, alpha);
        Self {
            rotation,
            translation,
        }
    }

    /// Rotation angle (radians) between this transform and another.
    pub fn rotation_angle_to(&self, other: &SE3) -> f64 {
        (self.rotation.inverse() * other.rotation).angle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_compose_inverse_roundtrip() {
        let t = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
            translation: Vector3::new(1.0, 2.0, -0.5),
        };
        let id = t.compose(&t.inverse());
        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-12);
        assert!(id.rotation.angle() < 1e-12);
    }

    #[test]
    fn test_matrix_roundtrip() {
        let t = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.4, 0.1, -0.7),
            translation: Vector3::new(-3.0, 0.25, 8.0),
        };
        let back = SE3::from_matrix(t.to_matrix());
        assert_relative_eq!(back.translation, t.translation, epsilon = 1e-12);
        assert!(t.rotation_angle_to(&back) < 1e-9);
    }

    #[test]
    fn test_interpolate_midpoint() {
        let a = SE3::identity();
        let b = SE3 {
            rotation: UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 1.0),
            translation: Vector3::new(2.0, 0.0, 0.0),
        };
        let mid = a.interpolate(&b, 0.5);
        assert_relative_eq!(mid.translation.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(mid.rotation.angle(), 0.5, epsilon = 1e-9);
    }
}
