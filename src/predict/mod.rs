//! Motion prediction: bounded histories, behavior statistics and the
//! multi-model forward predictor with its Kalman estimator.

pub mod behavior;
pub mod config;
pub mod history;
pub mod kalman;
pub mod predictor;

pub use behavior::UserBehaviorModel;
pub use config::{HeadsetState, InteractionMode, PredictionConfig, PredictionModel};
pub use history::{InertialHistory, PoseHistory, TimedPose};
pub use kalman::{KalmanEstimator, KalmanNoise};
pub use predictor::MotionPredictor;
