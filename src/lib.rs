pub mod error;
pub mod fusion;
pub mod geometry;
pub mod imu;
pub mod predict;

pub use error::FusionError;
pub use fusion::{FusionConfig, FusionEngine, FusionState};
pub use predict::{HeadsetState, InteractionMode, MotionPredictor, PredictionConfig};
