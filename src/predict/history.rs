//! Bounded, time-ordered histories of poses and inertial samples.
//!
//! Newest-first: `push` prepends at the front, eviction happens at the back
//! when either the capacity or the age window is exceeded. Entries are
//! immutable once recorded.

use std::collections::VecDeque;

use crate::geometry::SE3;
use crate::imu::ImuSample;

/// Default capacity of both histories.
pub const DEFAULT_CAPACITY: usize = 100;

/// Entries older than this relative to the newest are pruned (seconds).
pub const AGE_WINDOW_S: f64 = 1.0;

/// A pose tagged with its timestamp (seconds).
#[derive(Debug, Clone)]
pub struct TimedPose {
    pub pose: SE3,
    pub timestamp_s: f64,
}

impl TimedPose {
    pub fn new(pose: SE3, timestamp_s: f64) -> Self {
        Self { pose, timestamp_s }
    }
}

/// Newest-first bounded pose history.
#[derive(Debug, Clone)]
pub struct PoseHistory {
    entries: VecDeque<TimedPose>,
    capacity: usize,
}

impl PoseHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a pose at the front; rejects timestamps older than the newest
    /// entry so the history stays monotonic.
    pub fn push(&mut self, pose: TimedPose) -> bool {
        if let Some(newest) = self.entries.front() {
            if pose.timestamp_s < newest.timestamp_s {
                return false;
            }
        }
        self.entries.push_front(pose);
        self.prune();
        true
    }

    fn prune(&mut self) {
        while self.entries.len() > self.capacity {
            self.entries.pop_back();
        }
        if let Some(newest_ts) = self.entries.front().map(|p| p.timestamp_s) {
            while self
                .entries
                .back()
                .is_some_and(|p| newest_ts - p.timestamp_s > AGE_WINDOW_S)
            {
                self.entries.pop_back();
            }
        }
    }

    /// Most recent entry.
    pub fn latest(&self) -> Option<&TimedPose> {
        self.entries.front()
    }

    /// Entry `i` steps back from the newest (0 = newest).
    pub fn get(&self, i: usize) -> Option<&TimedPose> {
        self.entries.get(i)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = &TimedPose> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for PoseHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Newest-first bounded inertial history.
#[derive(Debug, Clone)]
pub struct InertialHistory {
    entries: VecDeque<ImuSample>,
    capacity: usize,
}

impl InertialHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: ImuSample) -> bool {
        if let Some(newest) = self.entries.front() {
            if sample.timestamp_s < newest.timestamp_s {
                return false;
            }
        }
        self.entries.push_front(sample);
        while self.entries.len() > self.capacity {
            self.entries.pop_back();
        }
        if let Some(newest_ts) = self.entries.front().map(|s| s.timestamp_s) {
            while self
                .entries
                .back()
                .is_some_and(|s| newest_ts - s.timestamp_s > AGE_WINDOW_S)
            {
                self.entries.pop_back();
            }
        }
        true
    }

    pub fn latest(&self) -> Option<&ImuSample> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImuSample> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for InertialHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn pose_at(t: f64) -> TimedPose {
        TimedPose::new(SE3::identity(), t)
    }

    #[test]
    fn test_newest_first_order() {
        let mut history = PoseHistory::new(10);
        history.push(pose_at(0.0));
        history.push(pose_at(0.1));
        history.push(pose_at(0.2));

        assert_eq!(history.len(), 3);
        assert_eq!(history.latest().unwrap().timestamp_s, 0.2);
        assert_eq!(history.get(2).unwrap().timestamp_s, 0.0);
    }

    #[test]
    fn test_capacity_eviction() {
        let mut history = PoseHistory::new(3);
        for i in 0..5 {
            history.push(pose_at(i as f64 * 0.01));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.get(2).unwrap().timestamp_s, 0.02);
    }

    #[test]
    fn test_age_window_pruning() {
        let mut history = PoseHistory::new(100);
        history.push(pose_at(0.0));
        history.push(pose_at(0.5));
        history.push(pose_at(1.6));

        // The t=0.0 and t=0.5 entries are older than 1s relative to 1.6
        assert_eq!(history.len(), 1);
        assert_eq!(history.latest().unwrap().timestamp_s, 1.6);
    }

    #[test]
    fn test_rejects_backwards_timestamps() {
        let mut history = PoseHistory::new(10);
        assert!(history.push(pose_at(1.0)));
        assert!(!history.push(pose_at(0.5)));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_inertial_history_eviction() {
        let mut history = InertialHistory::new(2);
        for i in 0..4 {
            history.push(ImuSample::new(
                i as f64 * 0.01,
                Vector3::zeros(),
                Vector3::zeros(),
            ));
        }
        assert_eq!(history.len(), 2);
        assert_eq!(history.latest().unwrap().timestamp_s, 0.03);
    }
}
