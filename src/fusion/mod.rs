//! Fusion engine: state machine, canonical estimate, persistence and the
//! capability seams onto the visual and inertial subsystems.

pub mod config;
pub mod engine;
pub mod estimate;
pub mod metrics;
pub mod persistence;
pub mod sources;
pub mod state;

pub use config::FusionConfig;
pub use engine::FusionEngine;
pub use estimate::CanonicalEstimate;
pub use metrics::FusionMetrics;
pub use sources::{InertialSource, VisualTracking, VisualUpdate};
pub use state::FusionState;
