//! Fusion engine: queues, worker thread and the tracking state machine.
//!
//! External collaborators push inertial samples and visual tracking results
//! into the engine's queues. A single background worker drains both, drives
//! the state machine, integrates inertial data through the preintegrator,
//! advances the canonical estimate and feeds the motion predictor. Any
//! thread may read the canonical estimate or ask for a forward-predicted
//! pose without blocking the worker.
//!
//! Locking is split into exactly three regions: the input queues, the
//! canonical-estimate bundle (which also carries the predictor, so
//! multi-field updates stay atomic) and the metrics accumulator.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use nalgebra::Vector3;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::FusionError;
use crate::geometry::SE3;
use crate::imu::{ImuBias, ImuCalibration, ImuSample, Preintegrator};
use crate::predict::{InteractionMode, MotionPredictor, PredictionConfig, TimedPose};

use super::config::FusionConfig;
use super::estimate::CanonicalEstimate;
use super::metrics::FusionMetrics;
use super::persistence;
use super::sources::{InertialSource, VisualTracking, VisualUpdate};
use super::state::FusionState;

/// Angular rate below which the device is still enough to refine the gyro
/// bias (rad/s).
const BIAS_REFINE_GYRO_THRESHOLD: f64 = 0.02;

/// EMA weight of a stationary gyro reading folded into the bias.
const BIAS_REFINE_ALPHA: f64 = 0.005;

/// Input queues, locked region 1.
#[derive(Default)]
struct InputQueues {
    inertial: Vec<ImuSample>,
    visual: Vec<VisualUpdate>,
}

/// Canonical estimate bundle, locked region 2. The predictor lives here so
/// pose updates and history appends happen under one lock.
struct EstimateRegion {
    canonical: CanonicalEstimate,
    bias: ImuBias,
    state: FusionState,
    init_progress: f32,
    lost_since: Option<Instant>,
    last_error: Option<String>,
    predictor: MotionPredictor,
}

struct Shared {
    config: FusionConfig,
    queues: Mutex<InputQueues>,
    estimate: RwLock<EstimateRegion>,
    metrics: Mutex<FusionMetrics>,
    running: AtomicBool,
    /// Worker drops its local buffers and re-reads the bias on the next
    /// tick (set by `reset` and `load_state`).
    resync_requested: AtomicBool,
    wake_tx: Sender<()>,
    visual_source: Option<Arc<dyn VisualTracking>>,
    inertial_source: Option<Arc<dyn InertialSource>>,
}

/// Visual-inertial fusion engine. Owns its motion predictor; the visual and
/// inertial subsystems are shared handles whose lifetime is managed by the
/// surrounding application.
pub struct FusionEngine {
    shared: Arc<Shared>,
    wake_rx: Receiver<()>,
    worker: Option<JoinHandle<()>>,
    calibration: Option<ImuCalibration>,
}

impl FusionEngine {
    pub fn new(
        config: FusionConfig,
        prediction: PredictionConfig,
        visual_source: Option<Arc<dyn VisualTracking>>,
        inertial_source: Option<Arc<dyn InertialSource>>,
    ) -> Self {
        let (wake_tx, wake_rx) = bounded::<()>(1);
        let shared = Arc::new(Shared {
            config,
            queues: Mutex::new(InputQueues::default()),
            estimate: RwLock::new(EstimateRegion {
                canonical: CanonicalEstimate::new(),
                bias: ImuBias::zero(),
                state: FusionState::Uninitialized,
                init_progress: 0.0,
                lost_since: None,
                last_error: None,
                predictor: MotionPredictor::new(prediction),
            }),
            metrics: Mutex::new(FusionMetrics::default()),
            running: AtomicBool::new(false),
            resync_requested: AtomicBool::new(false),
            wake_tx,
            visual_source,
            inertial_source,
        });
        Self {
            shared,
            wake_rx,
            worker: None,
            calibration: None,
        }
    }

    /// Fetch calibration from the inertial source. Rejected while the
    /// worker is running: calibration must not change mid-flight.
    pub fn initialize(&mut self) -> Result<(), FusionError> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Err(FusionError::ConfigurationRejected(
                "calibration change while running",
            ));
        }
        if let Some(source) = &self.shared.inertial_source {
            let calibration = source.calibration();
            debug!(
                sigma_gyro = calibration.noise.sigma_gyro,
                sigma_accel = calibration.noise.sigma_accel,
                "imu calibration loaded"
            );
            self.calibration = Some(calibration);
        }
        Ok(())
    }

    /// Spawn the worker thread. Idempotent.
    pub fn start(&mut self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self.shared.clone();
        let wake_rx = self.wake_rx.clone();
        self.worker = Some(thread::spawn(move || {
            Worker::new(shared, wake_rx).run();
        }));
    }

    /// Stop the worker and wait for it to exit. In-flight preintegration is
    /// discarded, not persisted.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.shared.wake_tx.try_send(());
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    /// Atomically clear queues, the canonical estimate, histories and the
    /// state machine. Bias and Kalman state do not survive a reset; reload
    /// them from persisted state if needed.
    pub fn reset(&mut self) -> bool {
        {
            let mut queues = self.shared.queues.lock();
            queues.inertial.clear();
            queues.visual.clear();
        }
        {
            let mut region = self.shared.estimate.write();
            region.canonical = CanonicalEstimate::new();
            region.bias = ImuBias::zero();
            region.state = FusionState::Uninitialized;
            region.init_progress = 0.0;
            region.lost_since = None;
            region.last_error = None;
            region.predictor.reset();
        }
        self.shared.resync_requested.store(true, Ordering::SeqCst);
        let _ = self.shared.wake_tx.try_send(());
        info!("fusion engine reset");
        true
    }

    /// Enqueue a batch of raw inertial samples. Non-blocking apart from a
    /// short-held queue lock.
    pub fn process_inertial_measurements(&self, samples: &[ImuSample]) -> bool {
        if samples.is_empty() {
            return false;
        }
        self.shared.queues.lock().inertial.extend_from_slice(samples);
        let _ = self.shared.wake_tx.try_send(());
        true
    }

    /// Enqueue a visual tracking result. Stale results (timestamp not newer
    /// than the last accepted one) are dropped by the worker.
    pub fn process_visual_tracking(
        &self,
        pose: SE3,
        timestamp_s: f64,
        keypoints_per_camera: Vec<usize>,
        map_points_per_camera: Vec<usize>,
    ) -> bool {
        self.shared.queues.lock().visual.push(VisualUpdate {
            pose,
            timestamp_s,
            keypoints_per_camera,
            map_points_per_camera,
        });
        let _ = self.shared.wake_tx.try_send(());
        true
    }

    pub fn state(&self) -> FusionState {
        self.shared.estimate.read().state
    }

    pub fn is_tracking_good(&self) -> bool {
        let region = self.shared.estimate.read();
        region.state.is_tracking() && quality_of(&region, &self.shared.config) >= 0.5
    }

    /// Tracking quality in [0, 1]. Sustained loss beyond the configured
    /// maximum duration drives this to zero; it is the quality signal, not
    /// an error.
    pub fn tracking_quality(&self) -> f32 {
        let region = self.shared.estimate.read();
        quality_of(&region, &self.shared.config)
    }

    /// Initialization progress in [0, 100].
    pub fn initialization_progress(&self) -> f32 {
        self.shared.estimate.read().init_progress
    }

    pub fn current_pose(&self) -> TimedPose {
        let region = self.shared.estimate.read();
        TimedPose::new(region.canonical.pose.clone(), region.canonical.timestamp_s)
    }

    /// Forward-predicted pose at `horizon_ms`. Falls back to the current
    /// pose while the predictor has no history.
    pub fn predicted_pose(&self, horizon_ms: f64) -> TimedPose {
        let region = self.shared.estimate.read();
        region.predictor.predict(horizon_ms).unwrap_or_else(|| {
            TimedPose::new(region.canonical.pose.clone(), region.canonical.timestamp_s)
        })
    }

    pub fn current_velocity(&self) -> Vector3<f64> {
        self.shared.estimate.read().canonical.velocity
    }

    pub fn current_acceleration(&self) -> Vector3<f64> {
        self.shared.estimate.read().canonical.acceleration
    }

    pub fn current_angular_velocity(&self) -> Vector3<f64> {
        self.shared.estimate.read().canonical.angular_velocity
    }

    /// Unit gravity direction in the reference frame (points toward the
    /// ground).
    pub fn gravity_direction(&self) -> Vector3<f64> {
        self.shared.estimate.read().canonical.gravity_direction()
    }

    pub fn current_bias(&self) -> ImuBias {
        self.shared.estimate.read().bias
    }

    pub fn set_prediction_horizon(&self, horizon_ms: f64) {
        self.shared
            .estimate
            .write()
            .predictor
            .set_horizon_ms(horizon_ms);
    }

    pub fn set_interaction_mode(&self, mode: InteractionMode) {
        self.shared
            .estimate
            .write()
            .predictor
            .set_interaction_mode(mode);
    }

    /// Persist the canonical estimate and bias. `Persistence` errors
    /// propagate to the caller.
    pub fn save_state(&self, path: &Path) -> Result<(), FusionError> {
        let region = self.shared.estimate.read();
        persistence::save_state(path, &region.canonical, &region.bias)
    }

    /// Restore a persisted estimate and bias; the engine resumes in
    /// `TrackingNominal` with the restored state as the authoritative pose.
    pub fn load_state(&mut self, path: &Path) -> Result<(), FusionError> {
        let loaded = persistence::load_state(path)?;
        {
            let mut region = self.shared.estimate.write();
            region.canonical.pose = loaded.pose.clone();
            region.canonical.timestamp_s = 0.0;
            region.canonical.velocity = loaded.velocity;
            region.canonical.acceleration = loaded.acceleration;
            region.canonical.angular_velocity = loaded.angular_velocity;
            region.canonical.gravity = loaded.gravity;
            region.bias = loaded.bias;
            region.state = FusionState::TrackingNominal;
            region.init_progress = 100.0;
            region.lost_since = None;
            region.predictor.reset();
            region.predictor.set_gravity(loaded.gravity);
            region.predictor.set_velocity(loaded.velocity);
        }
        self.shared.resync_requested.store(true, Ordering::SeqCst);
        let _ = self.shared.wake_tx.try_send(());
        info!("fusion state loaded");
        Ok(())
    }

    /// Calibration loaded by `initialize`, if any.
    pub fn calibration(&self) -> Option<&ImuCalibration> {
        self.calibration.as_ref()
    }

    /// Snapshot of the performance counters.
    pub fn metrics(&self) -> FusionMetrics {
        self.shared.metrics.lock().clone()
    }

    /// Message of the most recent locally-recovered error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.shared.estimate.read().last_error.clone()
    }
}

impl Drop for FusionEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn quality_of(region: &EstimateRegion, config: &FusionConfig) -> f32 {
    match region.state {
        FusionState::TrackingNominal => 1.0,
        FusionState::TrackingRapid => 0.8,
        FusionState::TrackingVisual => 0.6,
        FusionState::Initializing => 0.3 * region.init_progress / 100.0,
        FusionState::Uninitialized => 0.0,
        FusionState::Lost | FusionState::Relocalizing => {
            let elapsed = region
                .lost_since
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0);
            let remaining = 1.0 - (elapsed / config.max_lost_duration_s).min(1.0);
            0.4 * remaining as f32
        }
    }
}

/// Worker-private state. Everything here is touched only by the worker
/// thread; cross-thread data lives in `Shared`.
struct Worker {
    shared: Arc<Shared>,
    wake_rx: Receiver<()>,
    preintegrator: Preintegrator,
    init_buffer: Vec<ImuSample>,
    seen_inertial: bool,
    seen_visual: bool,
    gravity_locked: bool,
    last_sample_ts: Option<f64>,
    last_visual_ts: Option<f64>,
    latest_visual: Option<VisualUpdate>,
}

impl Worker {
    fn new(shared: Arc<Shared>, wake_rx: Receiver<()>) -> Self {
        let bias = shared.estimate.read().bias;
        Self {
            shared,
            wake_rx,
            preintegrator: Preintegrator::new(bias),
            init_buffer: Vec::new(),
            seen_inertial: false,
            seen_visual: false,
            gravity_locked: false,
            last_sample_ts: None,
            last_visual_ts: None,
            latest_visual: None,
        }
    }

    fn run(mut self) {
        info!("fusion worker started");
        let timeout = Duration::from_millis(self.shared.config.tick_timeout_ms);
        while self.shared.running.load(Ordering::SeqCst) {
            match self.wake_rx.recv_timeout(timeout) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if !self.shared.running.load(Ordering::SeqCst) {
                break;
            }
            let t_start = Instant::now();
            if self.shared.resync_requested.swap(false, Ordering::SeqCst) {
                self.resync();
            }
            self.tick();
            self.shared
                .metrics
                .lock()
                .record_tick(t_start.elapsed().as_secs_f64() * 1000.0);
        }
        info!("fusion worker stopped");
    }

    /// Drop local buffers and re-read the bias after a reset or state load.
    fn resync(&mut self) {
        let bias = self.shared.estimate.read().bias;
        self.preintegrator.set_bias(bias);
        self.init_buffer.clear();
        self.seen_inertial = false;
        self.seen_visual = false;
        self.gravity_locked = false;
        self.last_sample_ts = None;
        self.last_visual_ts = None;
        self.latest_visual = None;
    }

    /// One state-machine cycle: drain inputs, dispatch on the current state.
    fn tick(&mut self) {
        let (mut samples, visuals) = {
            let mut queues = self.shared.queues.lock();
            (
                std::mem::take(&mut queues.inertial),
                std::mem::take(&mut queues.visual),
            )
        };
        samples.sort_by(|a, b| a.timestamp_s.total_cmp(&b.timestamp_s));
        let visual = self.accept_visual(visuals);

        if !samples.is_empty() {
            self.seen_inertial = true;
        }

        let state = self.shared.estimate.read().state;
        match state {
            FusionState::Uninitialized => {
                self.buffer_init_samples(&samples);
                if self.seen_inertial && self.seen_visual {
                    self.transition(state, FusionState::Initializing);
                    self.shared.estimate.write().init_progress = 10.0;
                }
            }
            FusionState::Initializing => {
                self.buffer_init_samples(&samples);
                self.try_initialize();
            }
            FusionState::TrackingNominal
            | FusionState::TrackingRapid
            | FusionState::TrackingVisual => {
                self.steady_state_update(state, &samples, visual.as_ref());
            }
            FusionState::Lost | FusionState::Relocalizing => {
                self.handle_lost(state);
            }
        }
    }

    /// Keep only visual updates newer than the last accepted one; return
    /// the newest survivor.
    fn accept_visual(&mut self, visuals: Vec<VisualUpdate>) -> Option<VisualUpdate> {
        let mut accepted: Option<VisualUpdate> = None;
        let mut rejected = 0u64;
        for update in visuals {
            let newer_than_last = self
                .last_visual_ts
                .is_none_or(|last| update.timestamp_s > last);
            if newer_than_last {
                self.last_visual_ts = Some(update.timestamp_s);
                accepted = Some(update);
            } else {
                rejected += 1;
            }
        }
        if rejected > 0 {
            debug!(rejected, "dropped stale visual updates");
        }
        if let Some(update) = &accepted {
            self.seen_visual = true;
            self.latest_visual = Some(update.clone());
            let mut metrics = self.shared.metrics.lock();
            metrics.visual_accepted += 1;
            metrics.visual_rejected += rejected;
        } else if rejected > 0 {
            self.shared.metrics.lock().visual_rejected += rejected;
        }
        accepted
    }

    /// Accumulate samples for gravity estimation, keeping timestamps
    /// monotonic.
    fn buffer_init_samples(&mut self, samples: &[ImuSample]) {
        for sample in samples {
            let monotonic = self
                .init_buffer
                .last()
                .is_none_or(|last| sample.timestamp_s > last.timestamp_s);
            if monotonic {
                self.init_buffer.push(*sample);
            } else {
                self.shared.metrics.lock().samples_rejected += 1;
            }
        }
    }

    /// Initialization policy: gravity first, then pose/velocity from the
    /// visual lock. Velocity starts at zero - sessions begin near
    /// stationary - and is refined by subsequent updates.
    fn try_initialize(&mut self) {
        let needed = self.shared.config.init_sample_count;

        if !self.gravity_locked {
            let fill = (self.init_buffer.len() as f32 / needed as f32).min(1.0);
            self.shared.estimate.write().init_progress = 10.0 + 35.0 * fill;

            if self.init_buffer.len() < needed {
                return;
            }
            let mean: Vector3<f64> = self
                .init_buffer
                .iter()
                .map(|s| s.accel)
                .sum::<Vector3<f64>>()
                / self.init_buffer.len() as f64;
            if mean.norm() < 1e-3 {
                // Gravity unobservable; drop the oldest half and keep
                // collecting.
                warn!("gravity unobservable from {} samples", self.init_buffer.len());
                let keep_from = self.init_buffer.len() / 2;
                self.init_buffer.drain(..keep_from);
                self.set_error(FusionError::InitializationFailure(
                    "gravity unobservable from buffered samples",
                ));
                return;
            }
            // A stationary accelerometer reads +g*up; gravity points the
            // other way.
            let gravity = -mean.normalize() * self.shared.config.gravity_magnitude;
            let mut region = self.shared.estimate.write();
            region.canonical.gravity = gravity;
            region.predictor.set_gravity(gravity);
            region.init_progress = 50.0;
            drop(region);
            self.gravity_locked = true;
            info!(
                gx = gravity.x,
                gy = gravity.y,
                gz = gravity.z,
                "gravity locked from {} samples",
                self.init_buffer.len()
            );
        }

        let Some(visual) = self.latest_visual.clone() else {
            return;
        };
        if visual.feature_count() < self.shared.config.min_feature_count {
            self.set_error(FusionError::InsufficientData(
                "visual feature count below minimum",
            ));
            return;
        }

        let start_ts = self
            .init_buffer
            .last()
            .map(|s| s.timestamp_s)
            .unwrap_or(visual.timestamp_s);
        {
            let mut region = self.shared.estimate.write();
            region.canonical.pose = visual.pose.clone();
            region.canonical.timestamp_s = start_ts.max(visual.timestamp_s);
            region.canonical.velocity = Vector3::zeros();
            region.init_progress = 100.0;
            let ts = region.canonical.timestamp_s;
            let pose = region.canonical.pose.clone();
            region.predictor.set_velocity(Vector3::zeros());
            region.predictor.add_pose(pose, ts);
        }
        self.last_sample_ts = Some(start_ts);
        self.init_buffer.clear();
        self.transition(FusionState::Initializing, FusionState::TrackingNominal);
    }

    /// Drain the batch through the preintegrator and advance the canonical
    /// estimate. An empty batch means the update is starved and tracking is
    /// lost.
    fn steady_state_update(
        &mut self,
        state: FusionState,
        samples: &[ImuSample],
        visual: Option<&VisualUpdate>,
    ) {
        if samples.is_empty() {
            self.set_error(FusionError::TrackingLoss);
            self.shared.estimate.write().lost_since = Some(Instant::now());
            self.transition(state, FusionState::Lost);
            return;
        }

        let (integrated, rejected) = self.integrate_batch(samples);
        {
            let mut metrics = self.shared.metrics.lock();
            metrics.samples_integrated += integrated;
            metrics.samples_rejected += rejected;
        }

        let delta = self.preintegrator.consume();
        let newest = samples[samples.len() - 1];

        let (next_state, refined_bias) = {
            let mut region = self.shared.estimate.write();
            let bias = region.bias;
            let gravity = region.canonical.gravity;

            if delta.dt > 0.0 {
                let rotation = region.canonical.pose.rotation;
                let dv_world = rotation * delta.delta_vel + gravity * delta.dt;
                let translation_step =
                    region.canonical.velocity * delta.dt + 0.5 * dv_world * delta.dt;
                region.canonical.pose.translation += translation_step;
                region.canonical.pose.rotation = rotation * delta.delta_rot;
                region.canonical.velocity += dv_world;
            }
            region.canonical.angular_velocity = newest.gyro - bias.gyro;
            region.canonical.acceleration =
                region.canonical.pose.rotation * (newest.accel - bias.accel) + gravity;
            region.canonical.timestamp_s = region.canonical.timestamp_s.max(newest.timestamp_s);

            if let Some(update) = visual {
                let blend = self.shared.config.visual_blend;
                region.canonical.pose = region.canonical.pose.interpolate(&update.pose, blend);
            }

            let velocity = region.canonical.velocity;
            let pose = region.canonical.pose.clone();
            let ts = region.canonical.timestamp_s;
            region.predictor.set_velocity(velocity);
            region.predictor.add_pose(pose, ts);
            for sample in samples {
                let corrected = bias.correct(sample);
                region
                    .predictor
                    .add_inertial(corrected.gyro, corrected.accel, corrected.timestamp_s);
            }

            // Mode selection on the freshly updated estimate.
            let angular_rate = region.canonical.angular_velocity.norm();
            let acceleration = region.canonical.acceleration.norm();
            let feature_count = self
                .latest_visual
                .as_ref()
                .map(|v| v.feature_count())
                .unwrap_or(0);

            let next_state = if angular_rate > self.shared.config.rapid_angular_rate
                || acceleration > self.shared.config.rapid_acceleration
            {
                FusionState::TrackingRapid
            } else if feature_count < self.shared.config.min_feature_count {
                FusionState::TrackingVisual
            } else {
                FusionState::TrackingNominal
            };

            // Stationary gyro readings are pure bias; fold them in slowly.
            let refined_bias = if angular_rate < BIAS_REFINE_GYRO_THRESHOLD {
                let mut bias = region.bias;
                bias.gyro = bias.gyro * (1.0 - BIAS_REFINE_ALPHA) + newest.gyro * BIAS_REFINE_ALPHA;
                region.bias = bias;
                Some(bias)
            } else {
                None
            };

            (next_state, refined_bias)
        };

        // The accumulated delta is bias-dependent; a bias change rebuilds
        // the preintegrator.
        if let Some(bias) = refined_bias {
            self.preintegrator.set_bias(bias);
        }

        if next_state != state {
            self.transition(state, next_state);
        }
    }

    /// Integrate a sorted batch; per-sample rejects are logged and counted,
    /// never propagated.
    fn integrate_batch(&mut self, samples: &[ImuSample]) -> (u64, u64) {
        let mut integrated = 0u64;
        let mut rejected = 0u64;
        for sample in samples {
            let Some(prev_ts) = self.last_sample_ts else {
                // First sample after a resync establishes the baseline.
                self.last_sample_ts = Some(sample.timestamp_s);
                continue;
            };
            let dt = sample.timestamp_s - prev_ts;
            match self.preintegrator.integrate_sample(sample, dt) {
                Ok(()) => {
                    self.last_sample_ts = Some(sample.timestamp_s);
                    integrated += 1;
                }
                Err(err) => {
                    debug!(ts = sample.timestamp_s, %err, "rejected inertial sample");
                    rejected += 1;
                }
            }
        }
        (integrated, rejected)
    }

    /// Lost/relocalizing policy: retry relocalization every tick, fall back
    /// to inertial-only propagation over the trailing window when allowed.
    fn handle_lost(&mut self, state: FusionState) {
        self.shared.metrics.lock().relocalization_attempts += 1;

        let recovered = self
            .shared
            .visual_source
            .as_ref()
            .and_then(|source| source.attempt_relocalization());

        if let Some(pose) = recovered {
            {
                let mut region = self.shared.estimate.write();
                region.canonical.pose = pose;
                region.canonical.velocity = Vector3::zeros();
                region.lost_since = None;
            }
            self.transition(state, FusionState::TrackingNominal);
            return;
        }
        self.set_error(FusionError::RelocalizationFailure);

        if self.shared.config.imu_fallback {
            if self.imu_fallback_propagation() {
                self.shared.estimate.write().lost_since = None;
                self.transition(state, FusionState::TrackingRapid);
                return;
            }
        } else if state == FusionState::Lost {
            self.transition(state, FusionState::Relocalizing);
        }
    }

    /// Propagate inertial-only over the trailing window pulled from the
    /// inertial source. Returns false when no usable samples exist.
    fn imu_fallback_propagation(&mut self) -> bool {
        let Some(source) = self.shared.inertial_source.clone() else {
            return false;
        };
        let end = match self.last_sample_ts {
            Some(ts) => ts + self.shared.config.imu_fallback_window_s,
            None => return false,
        };
        let start = self.last_sample_ts.unwrap_or(0.0);
        let window = source.measurements_in_range(start, end);
        if window.is_empty() {
            return false;
        }

        let mut samples: Vec<ImuSample> = window
            .into_iter()
            .filter(|s| s.timestamp_s > start)
            .collect();
        if samples.is_empty() {
            return false;
        }
        samples.sort_by(|a, b| a.timestamp_s.total_cmp(&b.timestamp_s));

        let (integrated, rejected) = self.integrate_batch(&samples);
        {
            let mut metrics = self.shared.metrics.lock();
            metrics.samples_integrated += integrated;
            metrics.samples_rejected += rejected;
        }
        if integrated == 0 {
            return false;
        }

        let delta = self.preintegrator.consume();
        let newest = samples[samples.len() - 1];
        let mut region = self.shared.estimate.write();
        let bias = region.bias;
        let gravity = region.canonical.gravity;
        let rotation = region.canonical.pose.rotation;
        let dv_world = rotation * delta.delta_vel + gravity * delta.dt;
        let translation_step = region.canonical.velocity * delta.dt + 0.5 * dv_world * delta.dt;
        region.canonical.pose.translation += translation_step;
        region.canonical.pose.rotation = rotation * delta.delta_rot;
        region.canonical.velocity += dv_world;
        region.canonical.angular_velocity = newest.gyro - bias.gyro;
        region.canonical.acceleration =
            region.canonical.pose.rotation * (newest.accel - bias.accel) + gravity;
        region.canonical.timestamp_s = region.canonical.timestamp_s.max(newest.timestamp_s);
        let velocity = region.canonical.velocity;
        let pose = region.canonical.pose.clone();
        let ts = region.canonical.timestamp_s;
        region.predictor.set_velocity(velocity);
        region.predictor.add_pose(pose, ts);
        true
    }

    fn transition(&self, from: FusionState, to: FusionState) {
        if from == to {
            return;
        }
        info!(?from, ?to, "fusion state transition");
        self.shared.estimate.write().state = to;
    }

    fn set_error(&self, err: FusionError) {
        self.shared.estimate.write().last_error = Some(err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    struct StubVisual {
        relocalize_to: Mutex<Option<SE3>>,
    }

    impl StubVisual {
        fn never() -> Arc<Self> {
            Arc::new(Self {
                relocalize_to: Mutex::new(None),
            })
        }

        fn recovering(pose: SE3) -> Arc<Self> {
            Arc::new(Self {
                relocalize_to: Mutex::new(Some(pose)),
            })
        }
    }

    impl VisualTracking for StubVisual {
        fn tracked_pose(&self) -> Option<(SE3, f64)> {
            None
        }
        fn feature_count(&self) -> usize {
            0
        }
        fn attempt_relocalization(&self) -> Option<SE3> {
            self.relocalize_to.lock().clone()
        }
    }

    struct StubInertial {
        samples: Vec<ImuSample>,
    }

    impl InertialSource for StubInertial {
        fn calibration(&self) -> ImuCalibration {
            ImuCalibration::default()
        }
        fn measurements_in_range(&self, start_s: f64, end_s: f64) -> Vec<ImuSample> {
            self.samples
                .iter()
                .filter(|s| s.timestamp_s >= start_s && s.timestamp_s <= end_s)
                .copied()
                .collect()
        }
    }

    /// Worker with direct tick access: deterministic state-machine testing
    /// without the background thread.
    fn harness(
        config: FusionConfig,
        visual: Option<Arc<dyn VisualTracking>>,
        inertial: Option<Arc<dyn InertialSource>>,
    ) -> (FusionEngine, Worker) {
        let engine = FusionEngine::new(config, PredictionConfig::default(), visual, inertial);
        let worker = Worker::new(engine.shared.clone(), engine.wake_rx.clone());
        (engine, worker)
    }

    fn stationary_samples(count: usize, start_ts: f64, rate_hz: f64) -> Vec<ImuSample> {
        (0..count)
            .map(|i| {
                ImuSample::new(
                    start_ts + i as f64 / rate_hz,
                    Vector3::new(0.0, 0.0, 9.81),
                    Vector3::zeros(),
                )
            })
            .collect()
    }

    fn drive_to_nominal(engine: &FusionEngine, worker: &mut Worker) -> f64 {
        engine.process_visual_tracking(SE3::identity(), 0.0, vec![200], vec![60]);
        let samples = stationary_samples(120, 0.0, 200.0);
        let last_ts = samples.last().unwrap().timestamp_s;
        engine.process_inertial_measurements(&samples);
        worker.tick(); // Uninitialized -> Initializing
        worker.tick(); // gravity lock + visual lock -> TrackingNominal
        last_ts
    }

    #[test]
    fn test_initialization_reaches_nominal() {
        let (engine, mut worker) = harness(FusionConfig::default(), None, None);
        assert_eq!(engine.state(), FusionState::Uninitialized);

        drive_to_nominal(&engine, &mut worker);
        assert_eq!(engine.state(), FusionState::TrackingNominal);
        assert_relative_eq!(engine.initialization_progress(), 100.0);
    }

    #[test]
    fn test_gravity_direction_within_one_degree() {
        let (engine, mut worker) = harness(FusionConfig::default(), None, None);
        drive_to_nominal(&engine, &mut worker);

        let direction = engine.gravity_direction();
        let angle = direction.angle(&Vector3::new(0.0, 0.0, -1.0));
        assert!(angle < 1.0_f64.to_radians(), "angle = {angle}");
    }

    #[test]
    fn test_initialization_progress_staging() {
        let (engine, mut worker) = harness(FusionConfig::default(), None, None);

        // Data availability only: visual seen, too few samples for gravity.
        engine.process_visual_tracking(SE3::identity(), 0.0, vec![200], vec![60]);
        engine.process_inertial_measurements(&stationary_samples(10, 0.0, 200.0));
        worker.tick();
        assert_eq!(engine.state(), FusionState::Initializing);
        worker.tick();
        let progress = engine.initialization_progress();
        assert!((10.0..50.0).contains(&progress), "progress = {progress}");

        // Gravity lock completes with the full buffer.
        engine.process_inertial_measurements(&stationary_samples(110, 0.06, 200.0));
        worker.tick();
        assert_relative_eq!(engine.initialization_progress(), 100.0);
    }

    #[test]
    fn test_rapid_motion_transition() {
        let (engine, mut worker) = harness(FusionConfig::default(), None, None);
        let last_ts = drive_to_nominal(&engine, &mut worker);

        // 2 rad/s exceeds the 1.5 rad/s default threshold.
        let spinning: Vec<ImuSample> = (1..=5)
            .map(|i| {
                ImuSample::new(
                    last_ts + i as f64 * 0.005,
                    Vector3::new(0.0, 0.0, 9.81),
                    Vector3::new(2.0, 0.0, 0.0),
                )
            })
            .collect();
        engine.process_inertial_measurements(&spinning);
        worker.tick();
        assert_eq!(engine.state(), FusionState::TrackingRapid);
    }

    #[test]
    fn test_starved_update_goes_lost() {
        let config = FusionConfig {
            imu_fallback: false,
            ..Default::default()
        };
        let (engine, mut worker) = harness(config, None, None);
        drive_to_nominal(&engine, &mut worker);

        // No inertial data queued: the next steady-state update is starved.
        worker.tick();
        assert_eq!(engine.state(), FusionState::Lost);
        assert!(engine.last_error().unwrap().contains("tracking loss"));
    }

    #[test]
    fn test_lost_without_fallback_moves_to_relocalizing() {
        let config = FusionConfig {
            imu_fallback: false,
            ..Default::default()
        };
        let (engine, mut worker) = harness(config, Some(StubVisual::never()), None);
        drive_to_nominal(&engine, &mut worker);

        worker.tick(); // -> Lost
        worker.tick(); // relocalization fails -> Relocalizing
        assert_eq!(engine.state(), FusionState::Relocalizing);
        assert!(engine.tracking_quality() < 0.5);
        assert!(!engine.is_tracking_good());
    }

    #[test]
    fn test_relocalization_success_restores_nominal() {
        let recovered = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(1.0, 0.0, 0.5),
        };
        let config = FusionConfig {
            imu_fallback: false,
            ..Default::default()
        };
        let (engine, mut worker) = harness(config, Some(StubVisual::recovering(recovered.clone())), None);
        drive_to_nominal(&engine, &mut worker);

        worker.tick(); // -> Lost
        worker.tick(); // relocalization succeeds
        assert_eq!(engine.state(), FusionState::TrackingNominal);
        assert_relative_eq!(
            engine.current_pose().pose.translation,
            recovered.translation,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_imu_fallback_keeps_tracking_rapid() {
        let mut fallback_samples = Vec::new();
        // Samples covering the trailing window past the last update.
        for i in 0..50 {
            fallback_samples.push(ImuSample::new(
                0.6 + i as f64 * 0.005,
                Vector3::new(0.0, 0.0, 9.81),
                Vector3::zeros(),
            ));
        }
        let inertial: Arc<dyn InertialSource> = Arc::new(StubInertial {
            samples: fallback_samples,
        });
        let (engine, mut worker) = harness(
            FusionConfig::default(),
            Some(StubVisual::never()),
            Some(inertial),
        );
        drive_to_nominal(&engine, &mut worker);

        worker.tick(); // starved -> Lost
        worker.tick(); // fallback propagation -> TrackingRapid
        assert_eq!(engine.state(), FusionState::TrackingRapid);
    }

    #[test]
    fn test_visual_updates_only_accepted_newer() {
        let (engine, mut worker) = harness(FusionConfig::default(), None, None);
        drive_to_nominal(&engine, &mut worker);

        engine.process_visual_tracking(SE3::identity(), 0.5, vec![100], vec![50]);
        engine.process_visual_tracking(SE3::identity(), 0.2, vec![100], vec![50]);
        engine.process_inertial_measurements(&stationary_samples(5, 0.7, 200.0));
        worker.tick();

        let metrics = engine.metrics();
        assert_eq!(metrics.visual_rejected, 1);
    }

    #[test]
    fn test_non_monotonic_samples_rejected_not_fatal() {
        let (engine, mut worker) = harness(FusionConfig::default(), None, None);
        let last_ts = drive_to_nominal(&engine, &mut worker);

        let mut samples = stationary_samples(5, last_ts + 0.005, 200.0);
        // Duplicate timestamp: zero dt must be rejected per-sample.
        let duplicated = samples[2];
        samples.push(duplicated);
        engine.process_inertial_measurements(&samples);
        worker.tick();

        assert!(engine.state().is_tracking());
        assert!(engine.metrics().samples_rejected >= 1);
    }

    #[test]
    fn test_save_load_roundtrip_restores_pose_and_bias() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fusion.bin");

        let (engine, mut worker) = harness(FusionConfig::default(), None, None);
        drive_to_nominal(&engine, &mut worker);
        engine.save_state(&path).unwrap();

        let mut fresh = FusionEngine::new(
            FusionConfig::default(),
            PredictionConfig::default(),
            None,
            None,
        );
        fresh.load_state(&path).unwrap();

        assert!(fresh.state().is_tracking());
        assert_relative_eq!(
            fresh.current_pose().pose.translation,
            engine.current_pose().pose.translation,
            epsilon = 1e-6
        );
        let (a, b) = (fresh.current_bias(), engine.current_bias());
        assert_relative_eq!(a.accel, b.accel, epsilon = 1e-7);
        assert_relative_eq!(a.gyro, b.gyro, epsilon = 1e-7);
    }

    #[test]
    fn test_reset_clears_state() {
        let (mut engine, mut worker) = harness(FusionConfig::default(), None, None);
        drive_to_nominal(&engine, &mut worker);
        assert!(engine.state().is_tracking());

        assert!(engine.reset());
        assert_eq!(engine.state(), FusionState::Uninitialized);
        assert_relative_eq!(engine.initialization_progress(), 0.0);
        assert_relative_eq!(engine.current_bias().accel, Vector3::zeros());
    }

    #[test]
    fn test_initialize_rejected_while_running() {
        let inertial: Arc<dyn InertialSource> = Arc::new(StubInertial { samples: vec![] });
        let mut engine = FusionEngine::new(
            FusionConfig::default(),
            PredictionConfig::default(),
            None,
            Some(inertial),
        );
        engine.start();
        let err = engine.initialize().unwrap_err();
        assert!(matches!(err, FusionError::ConfigurationRejected(_)));
        engine.stop();
    }

    #[test]
    fn test_worker_thread_lifecycle() {
        let mut engine = FusionEngine::new(
            FusionConfig::default(),
            PredictionConfig::default(),
            None,
            None,
        );
        engine.initialize().unwrap();
        engine.start();

        engine.process_visual_tracking(SE3::identity(), 0.0, vec![200], vec![60]);
        engine.process_inertial_measurements(&stationary_samples(120, 0.0, 200.0));

        // The worker ticks at least every tick_timeout; give it a few.
        let deadline = Instant::now() + Duration::from_millis(500);
        while engine.state() != FusionState::TrackingNominal && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(engine.state(), FusionState::TrackingNominal);
        assert!(engine.metrics().ticks > 0);

        engine.stop();
    }

    #[test]
    fn test_stationary_gyro_refines_bias() {
        let (engine, mut worker) = harness(FusionConfig::default(), None, None);
        let last_ts = drive_to_nominal(&engine, &mut worker);

        // A constant 0.01 rad/s reading while stationary is bias, not
        // motion; the engine folds it in slowly.
        let mut ts = last_ts;
        for _ in 0..200 {
            let batch: Vec<ImuSample> = (1..=2)
                .map(|i| {
                    ImuSample::new(
                        ts + i as f64 * 0.005,
                        Vector3::new(0.0, 0.0, 9.81),
                        Vector3::new(0.01, 0.0, 0.0),
                    )
                })
                .collect();
            ts = batch.last().unwrap().timestamp_s;
            engine.process_inertial_measurements(&batch);
            worker.tick();
        }

        let bias = engine.current_bias();
        assert!(bias.gyro.x > 0.001, "gyro bias x = {}", bias.gyro.x);
        assert!(bias.gyro.x <= 0.01);
    }

    #[test]
    fn test_predicted_pose_moves_with_velocity() {
        let (engine, mut worker) = harness(FusionConfig::default(), None, None);
        let last_ts = drive_to_nominal(&engine, &mut worker);

        // Constant specific force of 1 m/s^2 along x on top of gravity
        // support: the estimate accelerates, and prediction leads the
        // current pose along x.
        let mut ts = last_ts;
        for _ in 0..10 {
            let batch: Vec<ImuSample> = (1..=4)
                .map(|i| {
                    ImuSample::new(
                        ts + i as f64 * 0.005,
                        Vector3::new(1.0, 0.0, 9.81),
                        Vector3::zeros(),
                    )
                })
                .collect();
            ts = batch.last().unwrap().timestamp_s;
            engine.process_inertial_measurements(&batch);
            worker.tick();
        }
        assert!(engine.current_velocity().x > 0.0);

        let now = engine.current_pose();
        let ahead = engine.predicted_pose(16.0);
        assert!(ahead.pose.translation.x > now.pose.translation.x);
        assert!(ahead.timestamp_s > now.timestamp_s);
    }
}
