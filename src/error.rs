//! Error taxonomy for the fusion pipeline.
//!
//! Per-sample and per-call failures are recovered locally and surfaced as
//! `Result` returns; none of them ever aborts the worker thread. Tracking
//! loss is a first-class state on the engine, not an error. Only
//! `Persistence` is expected to propagate as a hard failure to the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FusionError {
    /// A sample arrived with a non-positive or non-increasing time step.
    #[error("invalid timestamp: dt = {dt} s")]
    InvalidTimestamp { dt: f64 },

    /// Initialization prerequisites are not yet met (not enough buffered
    /// samples, no visual pose observed, ...).
    #[error("insufficient data: {0}")]
    InsufficientData(&'static str),

    /// Gravity direction could not be estimated from the buffered samples.
    #[error("initialization failed: {0}")]
    InitializationFailure(&'static str),

    /// A steady-state update was starved of inertial data.
    #[error("tracking loss: no inertial data available")]
    TrackingLoss,

    /// Relocalization attempt failed; retried every tick while lost.
    #[error("relocalization failed")]
    RelocalizationFailure,

    /// I/O error while saving or loading persisted state.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// A configuration change was rejected (e.g. changing calibration while
    /// the worker is running).
    #[error("configuration rejected: {0}")]
    ConfigurationRejected(&'static str),
}

impl From<std::io::Error> for FusionError {
    fn from(e: std::io::Error) -> Self {
        FusionError::Persistence(e.to_string())
    }
}
