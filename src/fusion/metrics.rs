//! Per-instance performance counters.
//!
//! Owned by the engine and updated under its metrics lock; there is no
//! process-wide mutable state.

/// Counters accumulated by the worker thread.
#[derive(Debug, Default, Clone)]
pub struct FusionMetrics {
    /// Worker ticks executed.
    pub ticks: u64,
    /// Inertial samples integrated into the estimate.
    pub samples_integrated: u64,
    /// Samples rejected for non-increasing timestamps.
    pub samples_rejected: u64,
    /// Visual updates accepted (newer than the last accepted one).
    pub visual_accepted: u64,
    /// Visual updates dropped as stale.
    pub visual_rejected: u64,
    /// Relocalization attempts while lost.
    pub relocalization_attempts: u64,
    /// Duration of the most recent tick (ms).
    pub last_tick_ms: f64,
    /// Exponential moving average of tick duration (ms).
    pub avg_tick_ms: f64,
}

impl FusionMetrics {
    pub fn record_tick(&mut self, elapsed_ms: f64) {
        self.ticks += 1;
        self.last_tick_ms = elapsed_ms;
        if self.ticks == 1 {
            self.avg_tick_ms = elapsed_ms;
        } else {
            self.avg_tick_ms = 0.1 * elapsed_ms + 0.9 * self.avg_tick_ms;
        }
    }
}
