//! Binary persistence of the fusion state.
//!
//! Fixed little-endian single-precision layout: pose as a 4x4 row-major
//! matrix (16 floats), linear velocity (3), linear acceleration (3),
//! angular velocity (3), gravity (3), bias as
//! `(accel_x, accel_y, accel_z, gyro_x, gyro_y, gyro_z)` (6) - 48 floats /
//! 192 bytes, preceded by a 4-byte magic and a version word.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use nalgebra::{Matrix4, Vector3};

use crate::error::FusionError;
use crate::geometry::SE3;
use crate::imu::ImuBias;

use super::estimate::CanonicalEstimate;

const MAGIC: &[u8; 4] = b"HMDF";
const VERSION: u32 = 1;
const FLOAT_COUNT: usize = 48;

/// State restored from disk.
#[derive(Debug, Clone)]
pub struct PersistedState {
    pub pose: SE3,
    pub velocity: Vector3<f64>,
    pub acceleration: Vector3<f64>,
    pub angular_velocity: Vector3<f64>,
    pub gravity: Vector3<f64>,
    pub bias: ImuBias,
}

/// Serialize the estimate and bias to `path`.
pub fn save_state(
    path: &Path,
    estimate: &CanonicalEstimate,
    bias: &ImuBias,
) -> Result<(), FusionError> {
    let mut floats = Vec::with_capacity(FLOAT_COUNT);

    let matrix = estimate.pose.to_matrix();
    for row in 0..4 {
        for col in 0..4 {
            floats.push(matrix[(row, col)] as f32);
        }
    }
    push_vec3(&mut floats, &estimate.velocity);
    push_vec3(&mut floats, &estimate.acceleration);
    push_vec3(&mut floats, &estimate.angular_velocity);
    push_vec3(&mut floats, &estimate.gravity);
    push_vec3(&mut floats, &bias.accel);
    push_vec3(&mut floats, &bias.gyro);
    debug_assert_eq!(floats.len(), FLOAT_COUNT);

    let mut file = File::create(path)?;
    file.write_all(MAGIC)?;
    file.write_all(&VERSION.to_le_bytes())?;
    for value in floats {
        file.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

/// Deserialize a state blob written by `save_state`.
pub fn load_state(path: &Path) -> Result<PersistedState, FusionError> {
    let mut file = File::open(path)?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(FusionError::Persistence("bad magic".into()));
    }

    let mut version = [0u8; 4];
    file.read_exact(&mut version)?;
    let version = u32::from_le_bytes(version);
    if version != VERSION {
        return Err(FusionError::Persistence(format!(
            "unsupported version {version}"
        )));
    }

    let mut floats = [0.0f64; FLOAT_COUNT];
    let mut buf = [0u8; 4];
    for value in floats.iter_mut() {
        file.read_exact(&mut buf)?;
        *value = f32::from_le_bytes(buf) as f64;
    }

    let mut matrix = Matrix4::<f64>::identity();
    for row in 0..4 {
        for col in 0..4 {
            matrix[(row, col)] = floats[row * 4 + col];
        }
    }

    Ok(PersistedState {
        pose: SE3::from_matrix(matrix),
        velocity: read_vec3(&floats, 16),
        acceleration: read_vec3(&floats, 19),
        angular_velocity: read_vec3(&floats, 22),
        gravity: read_vec3(&floats, 25),
        bias: ImuBias {
            accel: read_vec3(&floats, 28),
            gyro: read_vec3(&floats, 31),
        },
    })
}

fn push_vec3(floats: &mut Vec<f32>, v: &Vector3<f64>) {
    floats.push(v.x as f32);
    floats.push(v.y as f32);
    floats.push(v.z as f32);
}

fn read_vec3(floats: &[f64], offset: usize) -> Vector3<f64> {
    Vector3::new(floats[offset], floats[offset + 1], floats[offset + 2])
}
