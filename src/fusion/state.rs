//! Fusion tracking state machine.

/// State of the fusion engine. Exactly one state is active at a time and
/// transitions are the only way it changes. `Lost` and `Relocalizing` are
/// recoverable, not terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionState {
    /// Neither an inertial sample nor a visual pose has been observed yet.
    Uninitialized,
    /// Buffering inertial data for gravity estimation and waiting for
    /// visual tracking to report enough features.
    Initializing,
    /// Steady-state tracking with good visual support.
    TrackingNominal,
    /// Angular rate or acceleration exceeded the rapid-motion thresholds;
    /// inertial data dominates.
    TrackingRapid,
    /// Visual feature count below minimum; tracking on visual updates of
    /// degraded quality.
    TrackingVisual,
    /// Steady-state update starved of inertial data.
    Lost,
    /// Actively retrying relocalization every tick.
    Relocalizing,
}

impl FusionState {
    /// True for the three steady-state tracking variants.
    pub fn is_tracking(self) -> bool {
        matches!(
            self,
            FusionState::TrackingNominal | FusionState::TrackingRapid | FusionState::TrackingVisual
        )
    }
}

impl Default for FusionState {
    fn default() -> Self {
        Self::Uninitialized
    }
}
