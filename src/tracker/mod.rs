// src/tracker/mod.rs - MPC tracker supervisor: state machine, periodic tasks,
// services, and the frame-change handler

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::avoidance::{
    self, AvoidanceState, FrameTransformer, PeerRegistry, priority_from_name,
};
use crate::config::{ConfigError, TrackerConfig};
use crate::constraints::ConstraintManager;
use crate::geometry;
use crate::model::{AxisState, PlantModel};
use crate::reference::{self, WiggleState};
use crate::solver::{AxisLimits, AxisSolver};
use crate::trajectory::TrajectoryStore;
use crate::types::{
    DynamicsConstraints, FuturePoint, FutureTrajectory, PositionCommand, Reference,
    ReferencePoint, ServiceReply, TrackerDiagnostics, TrackerStatus, TrajectoryReference,
    VehicleState,
};

/// Poll period while waiting for a periodic activity to finish its current
/// iteration.
const SPIN_WAIT: Duration = Duration::from_millis(10);

/// Hover watchdog rate [Hz].
const HOVER_RATE: f64 = 10.0;

/// Speed below which the hover watchdog disarms itself [m/s].
const HOVER_SPEED_THRESHOLD: f64 = 0.1;

/// Capability set shared by all tracker kinds; the host selects one
/// implementation and drives it through this interface.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Process one state estimate and produce the next position command.
    /// Returns `None` while inactive.
    fn update(&self, state: &VehicleState) -> Option<PositionCommand>;

    async fn activate(&self, last_command: Option<&PositionCommand>) -> ServiceReply;
    async fn deactivate(&self);
    async fn reset_static(&self) -> bool;

    fn status(&self) -> TrackerStatus;

    async fn set_reference(&self, reference: &Reference) -> ServiceReply;
    async fn set_trajectory_reference(&self, trajectory: &TrajectoryReference) -> ServiceReply;

    async fn hover(&self) -> ServiceReply;
    async fn start_trajectory_tracking(&self) -> ServiceReply;
    async fn stop_trajectory_tracking(&self) -> ServiceReply;
    async fn resume_trajectory_tracking(&self) -> ServiceReply;
    async fn goto_trajectory_start(&self) -> ServiceReply;

    async fn set_constraints(&self, constraints: &DynamicsConstraints) -> ServiceReply;
    async fn switch_odometry_source(&self, new_state: &VehicleState) -> ServiceReply;
    async fn enable_callbacks(&self, enabled: bool) -> ServiceReply;
}

/// Desired positions over the horizon, before reshaping.
#[derive(Debug, Clone)]
struct HorizonReference {
    x: Vec<f64>,
    y: Vec<f64>,
    z: Vec<f64>,
    heading: Vec<f64>,
}

impl HorizonReference {
    fn filled(horizon: usize) -> Self {
        Self {
            x: vec![0.0; horizon],
            y: vec![0.0; horizon],
            z: vec![0.0; horizon],
            heading: vec![0.0; horizon],
        }
    }

    fn fill(&mut self, x: f64, y: f64, z: f64, heading: f64) {
        self.x.iter_mut().for_each(|v| *v = x);
        self.y.iter_mut().for_each(|v| *v = y);
        self.z.iter_mut().for_each(|v| *v = z);
        self.heading.iter_mut().for_each(|v| *v = heading);
    }
}

/// Predicted plant evolution over the horizon, one chain per axis.
#[derive(Debug, Clone)]
struct PredictedHorizon {
    x: Vec<AxisState>,
    y: Vec<AxisState>,
    z: Vec<AxisState>,
    #[allow(dead_code)]
    heading: Vec<AxisState>,
}

impl PredictedHorizon {
    fn positions(&self) -> Vec<[f64; 3]> {
        (0..self.x.len())
            .map(|i| [self.x[i].position, self.y[i].position, self.z[i].position])
            .collect()
    }
}

/// Position along the loaded trajectory.
#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    idx: usize,
    sub_idx: usize,
}

/// Runtime-adjustable knobs, snapshotted at the start of each MPC tick.
#[derive(Debug, Clone)]
pub struct DynamicParams {
    pub braking_enabled: bool,
    pub q_vel_braking: f64,
    pub q_vel_no_braking: f64,
    pub wiggle_enabled: bool,
    pub wiggle_amplitude: f64,
    pub wiggle_frequency: f64,
}

#[derive(Debug)]
struct Timing {
    mpc_start: Instant,
    total_delay: f64,
}

/// One peer's last diagnostics with its local receive time.
#[derive(Debug, Clone)]
struct PeerDiagEntry {
    collision_avoidance_active: bool,
    received: Instant,
}

/// Seconds since the Unix epoch; the clock trajectory stamps are compared
/// against.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

struct AxisSolvers {
    x: AxisSolver,
    y: AxisSolver,
    z: AxisSolver,
    heading: AxisSolver,
}

// Shared state. Mutex domains are fine-grained; where more than one must be
// held, acquisition follows the field order below (plant first, dynamic
// params last) to keep the lock graph acyclic.
struct Inner {
    config: TrackerConfig,
    dt1: f64,
    priority: u32,
    transformer: Arc<dyn FrameTransformer>,

    plant: Mutex<PlantModel>,
    horizon_ref: Mutex<HorizonReference>,
    whole_trajectory: Mutex<Option<TrajectoryStore>>,
    cursor: Mutex<Cursor>,
    constraints: Mutex<ConstraintManager>,
    predicted: Mutex<Option<PredictedHorizon>>,
    peers: Mutex<PeerRegistry>,
    peer_diags: Mutex<HashMap<String, PeerDiagEntry>>,
    vehicle_state: Mutex<Option<VehicleState>>,
    dynamic: Mutex<DynamicParams>,

    solvers: Mutex<AxisSolvers>,
    avoidance_state: Mutex<AvoidanceState>,
    wiggle: Mutex<WiggleState>,
    mpc_input: Mutex<([f64; 3], f64)>,
    timing: Mutex<Timing>,
    last_command: Mutex<Option<PositionCommand>>,

    is_active: AtomicBool,
    callbacks_enabled: AtomicBool,
    tracking_in_progress: AtomicBool,
    hover_armed: AtomicBool,
    hover_running: AtomicBool,
    cursor_armed: AtomicBool,
    cursor_running: AtomicBool,
    mpc_running: AtomicBool,
    odometry_reset_in_progress: AtomicBool,
    mpc_computed: AtomicBool,
    mpc_result_invalid: AtomicBool,
    brake: AtomicBool,
    avoidance_enabled: AtomicBool,
    transform_warned: AtomicBool,
    passthrough_warned: AtomicBool,

    iterations_over_limit: AtomicU64,
    trajectory_count: AtomicU64,

    future_tx: broadcast::Sender<FutureTrajectory>,
    diagnostics_tx: broadcast::Sender<TrackerDiagnostics>,
    status_string_tx: broadcast::Sender<String>,
}

/// The MPC trajectory tracker.
///
/// Construction wires the solvers and shared state; [`MpcTracker::start`]
/// spawns the periodic activities on the tokio runtime. Hosts that prefer
/// to drive the tracker synchronously (simulation, tests) skip `start` and
/// call [`MpcTracker::mpc_tick`] / [`MpcTracker::trajectory_tick`]
/// themselves.
pub struct MpcTracker {
    inner: Arc<Inner>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MpcTracker {
    pub fn new(
        config: TrackerConfig,
        transformer: Arc<dyn FrameTransformer>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let dt1 = config.dt1();
        let dt2 = config.mpc.dt2;
        let horizon = config.mpc.horizon_len;

        let solvers = AxisSolvers {
            x: AxisSolver::new(&config.mpc.xy, dt1, dt2, horizon),
            y: AxisSolver::new(&config.mpc.xy, dt1, dt2, horizon),
            z: AxisSolver::new(&config.mpc.z, dt1, dt2, horizon),
            heading: AxisSolver::new(&config.mpc.heading, dt1, dt2, horizon),
        };

        let priority = priority_from_name(&config.uav_name);
        tracing::info!(uav = %config.uav_name, priority, "numerical priority of this vehicle");

        let dynamic = DynamicParams {
            braking_enabled: config.braking.enabled,
            q_vel_braking: config.braking.q_vel_braking,
            q_vel_no_braking: config.braking.q_vel_no_braking,
            wiggle_enabled: config.wiggle.enabled,
            wiggle_amplitude: config.wiggle.amplitude,
            wiggle_frequency: config.wiggle.frequency,
        };

        let (future_tx, _) = broadcast::channel(16);
        let (diagnostics_tx, _) = broadcast::channel(16);
        let (status_string_tx, _) = broadcast::channel(16);
        let (shutdown_tx, _) = broadcast::channel(1);

        let avoidance_enabled = config.avoidance.enabled;
        let min_height = config.safety.min_height;

        let inner = Arc::new(Inner {
            dt1,
            priority,
            transformer,
            plant: Mutex::new(PlantModel::new(dt1)),
            horizon_ref: Mutex::new(HorizonReference::filled(horizon)),
            whole_trajectory: Mutex::new(None),
            cursor: Mutex::new(Cursor::default()),
            constraints: Mutex::new(ConstraintManager::new()),
            predicted: Mutex::new(None),
            peers: Mutex::new(PeerRegistry::new()),
            peer_diags: Mutex::new(HashMap::new()),
            vehicle_state: Mutex::new(None),
            dynamic: Mutex::new(dynamic),
            solvers: Mutex::new(solvers),
            avoidance_state: Mutex::new(AvoidanceState::new(min_height)),
            wiggle: Mutex::new(WiggleState::default()),
            mpc_input: Mutex::new(([0.0; 3], 0.0)),
            timing: Mutex::new(Timing { mpc_start: Instant::now(), total_delay: 0.0 }),
            last_command: Mutex::new(None),
            is_active: AtomicBool::new(false),
            callbacks_enabled: AtomicBool::new(true),
            tracking_in_progress: AtomicBool::new(false),
            hover_armed: AtomicBool::new(false),
            hover_running: AtomicBool::new(false),
            cursor_armed: AtomicBool::new(false),
            cursor_running: AtomicBool::new(false),
            mpc_running: AtomicBool::new(false),
            odometry_reset_in_progress: AtomicBool::new(false),
            mpc_computed: AtomicBool::new(false),
            mpc_result_invalid: AtomicBool::new(false),
            brake: AtomicBool::new(false),
            avoidance_enabled: AtomicBool::new(avoidance_enabled),
            transform_warned: AtomicBool::new(false),
            passthrough_warned: AtomicBool::new(false),
            iterations_over_limit: AtomicU64::new(0),
            trajectory_count: AtomicU64::new(0),
            future_tx,
            diagnostics_tx,
            status_string_tx,
            config,
        });

        Ok(Self { inner, shutdown_tx })
    }

    /// Spawn the periodic activities: MPC tick, trajectory cursor,
    /// avoidance publishing, diagnostics, and the hover watchdog.
    pub fn start(&self) {
        self.spawn_mpc_loop();
        self.spawn_cursor_loop();
        self.spawn_avoidance_loop();
        self.spawn_diagnostics_loop();
        self.spawn_hover_loop();
        tracing::info!("tracker tasks started");
    }

    /// Stop all spawned tasks.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn spawn_mpc_loop(&self) {
        let inner = self.inner.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = Duration::from_secs_f64(inner.dt1);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("MPC loop shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        inner.mpc_iteration();
                    }
                }
            }
        });
    }

    fn spawn_cursor_loop(&self) {
        let inner = self.inner.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                // while disarmed, poll for arming; while armed, fire every
                // trajectory sample period
                let period = if inner.cursor_armed.load(Ordering::SeqCst) {
                    let dt = inner
                        .whole_trajectory
                        .lock()
                        .unwrap()
                        .as_ref()
                        .map(|t| t.dt())
                        .unwrap_or(0.2);
                    Duration::from_secs_f64(dt)
                } else {
                    Duration::from_millis(50)
                };

                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("trajectory cursor loop shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(period) => {
                        if inner.cursor_armed.load(Ordering::SeqCst) {
                            inner.trajectory_cursor_step();
                        }
                    }
                }
            }
        });
    }

    fn spawn_avoidance_loop(&self) {
        let inner = self.inner.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = Duration::from_secs_f64(1.0 / inner.config.avoidance.publish_rate);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => {
                        inner.publish_future();
                    }
                }
            }
        });
    }

    fn spawn_diagnostics_loop(&self) {
        let inner = self.inner.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = Duration::from_secs_f64(1.0 / inner.config.diagnostics.rate);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => {
                        inner.publish_diagnostics();
                    }
                }
            }
        });
    }

    fn spawn_hover_loop(&self) {
        let inner = self.inner.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = Duration::from_secs_f64(1.0 / HOVER_RATE);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => {
                        inner.hover_watchdog_step();
                    }
                }
            }
        });
    }

    // | ------------- synchronous driving (sim / tests) ------------- |

    /// Run one MPC iteration now. The spawned MPC loop calls this at the
    /// control rate.
    pub fn mpc_tick(&self) {
        self.inner.mpc_iteration();
    }

    /// Advance the trajectory cursor by one sample. The spawned cursor loop
    /// calls this every trajectory sample period while armed.
    pub fn trajectory_tick(&self) {
        if self.inner.cursor_armed.load(Ordering::SeqCst) {
            self.inner.trajectory_cursor_step();
        }
    }

    /// One hover-watchdog check, normally run at 10 Hz.
    pub fn hover_tick(&self) {
        self.inner.hover_watchdog_step();
    }

    /// Publish the predicted future once. The spawned avoidance loop calls
    /// this at the configured publish rate.
    pub fn avoidance_tick(&self) {
        self.inner.publish_future();
    }

    /// Publish diagnostics once. The spawned diagnostics loop calls this at
    /// the configured rate.
    pub fn diagnostics_tick(&self) {
        self.inner.publish_diagnostics();
    }

    // | --------------------- inbound callbacks --------------------- |

    /// Ingest a peer's predicted future (shared world frame).
    pub fn peer_trajectory(&self, mut trajectory: FutureTrajectory) {
        let inner = &self.inner;

        if trajectory.uav_name == inner.config.uav_name {
            return;
        }
        let allowed = inner.config.avoidance.peer_names.is_empty()
            || inner.config.avoidance.peer_names.iter().any(|n| *n == trajectory.uav_name);
        if !allowed {
            return;
        }

        let frame_id = match inner.vehicle_state.lock().unwrap().as_ref() {
            Some(state) => state.frame_id.clone(),
            None => return,
        };

        for point in trajectory.points.iter_mut() {
            match inner.transformer.shared_to_local(&frame_id, [point.x, point.y, point.z]) {
                Some(local) => {
                    point.x = local[0];
                    point.y = local[1];
                    point.z = local[2];
                }
                None => {
                    if !inner.transform_warned.swap(true, Ordering::SeqCst) {
                        tracing::warn!(
                            peer = %trajectory.uav_name,
                            "can not transform peer trajectory to the current frame"
                        );
                    }
                    return;
                }
            }
        }

        // peer clocks are not synchronized; freshness is judged from the
        // local receive time
        inner.peers.lock().unwrap().insert(trajectory, Instant::now());
    }

    /// Ingest a peer's diagnostics message.
    pub fn peer_diagnostics(&self, diagnostics: &TrackerDiagnostics) {
        if diagnostics.uav_name == self.inner.config.uav_name {
            return;
        }
        self.inner.peer_diags.lock().unwrap().insert(
            diagnostics.uav_name.clone(),
            PeerDiagEntry {
                collision_avoidance_active: diagnostics.collision_avoidance_active,
                received: Instant::now(),
            },
        );
    }

    /// Toggle participation in mutual collision avoidance.
    pub fn toggle_collision_avoidance(&self, enabled: bool) -> ServiceReply {
        self.inner.avoidance_enabled.store(enabled, Ordering::SeqCst);
        tracing::info!(enabled, "collision avoidance switched");
        ServiceReply::ok("collision avoidance set")
    }

    /// Toggle the wiggle excitation.
    pub fn toggle_wiggle(&self, enabled: bool) -> ServiceReply {
        self.inner.dynamic.lock().unwrap().wiggle_enabled = enabled;
        ServiceReply::ok("wiggle updated")
    }

    /// Replace the runtime-adjustable parameters.
    pub fn update_dynamic_params(&self, params: DynamicParams) {
        *self.inner.dynamic.lock().unwrap() = params;
        tracing::info!("dynamic parameters updated");
    }

    // | ------------------------- outputs --------------------------- |

    pub fn subscribe_predicted_future(&self) -> broadcast::Receiver<FutureTrajectory> {
        self.inner.future_tx.subscribe()
    }

    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<TrackerDiagnostics> {
        self.inner.diagnostics_tx.subscribe()
    }

    pub fn subscribe_status_strings(&self) -> broadcast::Receiver<String> {
        self.inner.status_string_tx.subscribe()
    }

    async fn disarm_hover(&self) {
        self.inner.toggle_hover(false);
        while self.inner.hover_running.load(Ordering::SeqCst) {
            tokio::time::sleep(SPIN_WAIT).await;
        }
    }

    async fn disarm_cursor(&self) {
        self.inner.cursor_armed.store(false, Ordering::SeqCst);
        while self.inner.cursor_running.load(Ordering::SeqCst) {
            tokio::time::sleep(SPIN_WAIT).await;
        }
    }
}

#[async_trait]
impl Tracker for MpcTracker {
    fn update(&self, state: &VehicleState) -> Option<PositionCommand> {
        let inner = &self.inner;

        *inner.vehicle_state.lock().unwrap() = Some(state.clone());

        // up to here the update runs even when inactive
        if !inner.is_active.load(Ordering::SeqCst) {
            return None;
        }

        if !inner.mpc_computed.load(Ordering::SeqCst)
            || inner.mpc_result_invalid.load(Ordering::SeqCst)
        {
            // keep the downstream controller fed with an identity
            // pass-through until the first valid MPC result exists
            if !inner.passthrough_warned.swap(true, Ordering::SeqCst) {
                tracing::warn!("MPC not ready, returning the current estimate as the command");
            }
            let command = passthrough_command(state);
            *inner.last_command.lock().unwrap() = Some(command.clone());
            return Some(command);
        }

        let (u, u_heading) = *inner.mpc_input.lock().unwrap();

        let (translation, heading) = {
            let mut plant = inner.plant.lock().unwrap();
            plant.step(u, u_heading);
            (plant.translation, plant.heading)
        };

        let mut command = PositionCommand {
            stamp: state.stamp,
            frame_id: state.frame_id.clone(),
            ..PositionCommand::default()
        };

        if translation.is_finite() {
            command.position = [
                translation.x.position,
                translation.y.position,
                translation.z.position,
            ];
            command.velocity = [
                translation.x.velocity,
                translation.y.velocity,
                translation.z.velocity,
            ];
            command.acceleration = [
                translation.x.acceleration,
                translation.y.acceleration,
                translation.z.acceleration,
            ];
            command.jerk = [translation.x.jerk, translation.y.jerk, translation.z.jerk];
            command.use_position_horizontal = true;
            command.use_position_vertical = true;
            command.use_velocity_horizontal = true;
            command.use_velocity_vertical = true;
            command.use_acceleration = true;
            command.use_jerk = true;
        } else {
            tracing::error!("MPC plant output is not finite, zeroing the derivatives");
            // hold the last finite position, zero everything else
            let last = inner.last_command.lock().unwrap();
            command.position = last
                .as_ref()
                .map(|c| c.position)
                .unwrap_or(state.position);
            command.use_position_horizontal = true;
            command.use_position_vertical = true;
            command.use_velocity_horizontal = true;
            command.use_velocity_vertical = true;
            command.use_acceleration = true;
        }

        if heading.is_finite() {
            command.heading = heading.position;
            command.heading_rate = heading.velocity;
            command.heading_acceleration = heading.acceleration;
            command.heading_jerk = heading.jerk;
            command.use_heading = true;
            command.use_heading_rate = true;
            command.use_heading_acceleration = true;
            command.use_heading_jerk = true;
        } else {
            tracing::error!("MPC heading output is not finite");
            command.heading_rate = 0.0;
            command.use_heading_rate = true;
        }

        *inner.last_command.lock().unwrap() = Some(command.clone());
        Some(command)
    }

    async fn activate(&self, last_command: Option<&PositionCommand>) -> ServiceReply {
        let inner = &self.inner;

        if !inner.constraints.lock().unwrap().got_constraints() {
            let message = "can not activate, missing constraints";
            tracing::error!("{message}");
            return ServiceReply::fail(message);
        }

        let Some(state) = inner.vehicle_state.lock().unwrap().clone() else {
            let message = "can not activate, missing the state estimate";
            tracing::error!("{message}");
            return ServiceReply::fail(message);
        };

        let mut translation = crate::model::TranslationState::default();
        let mut heading = AxisState::default();

        if let Some(cmd) = last_command {
            if cmd.use_position_horizontal {
                translation.x.position = cmd.position[0];
                translation.y.position = cmd.position[1];
            } else {
                translation.x.position = state.position[0];
                translation.y.position = state.position[1];
            }

            if cmd.use_position_vertical {
                translation.z.position = cmd.position[2];
            } else {
                translation.z.position = state.position[2];
            }

            if cmd.use_velocity_horizontal {
                translation.x.velocity = cmd.velocity[0];
                translation.y.velocity = cmd.velocity[1];
            } else {
                translation.x.velocity = state.velocity[0];
                translation.y.velocity = state.velocity[1];
            }

            if cmd.use_velocity_vertical {
                translation.z.velocity = cmd.velocity[2];
            } else {
                translation.z.velocity = state.velocity[2];
            }

            if cmd.use_acceleration {
                translation.x.acceleration = cmd.acceleration[0];
                translation.y.acceleration = cmd.acceleration[1];
                translation.z.acceleration = cmd.acceleration[2];
            }

            heading.position = if cmd.use_heading { cmd.heading } else { state.heading };
            heading.velocity = if cmd.use_heading_rate {
                cmd.heading_rate
            } else {
                state.angular_velocity[2]
            };

            tracing::info!("activated with the last tracker command");
        } else {
            translation.x.position = state.position[0];
            translation.y.position = state.position[1];
            translation.z.position = state.position[2];
            translation.x.velocity = state.velocity[0];
            translation.y.velocity = state.velocity[1];
            translation.z.velocity = state.velocity[2];
            heading.position = state.heading;
            heading.velocity = state.angular_velocity[2];

            tracing::info!("activated with the state estimate");
        }

        {
            let mut plant = inner.plant.lock().unwrap();
            plant.translation = translation;
            plant.heading = heading;
            plant.reset_step_timing();
        }

        inner.tracking_in_progress.store(false, Ordering::SeqCst);
        self.disarm_cursor().await;

        {
            let mut timing = inner.timing.lock().unwrap();
            timing.mpc_start = Instant::now();
            timing.total_delay = 0.0;
        }
        inner.iterations_over_limit.store(0, Ordering::SeqCst);
        inner.mpc_computed.store(false, Ordering::SeqCst);

        // seed the horizon reference with the current position, otherwise
        // the first iterations pull the vehicle toward the origin
        inner.set_relative_goal(0.0, 0.0, 0.0, 0.0, false);

        inner.toggle_hover(true);
        inner.is_active.store(true, Ordering::SeqCst);

        ServiceReply::ok("activated")
    }

    async fn deactivate(&self) {
        let inner = &self.inner;

        self.disarm_hover().await;
        inner.is_active.store(false, Ordering::SeqCst);
        inner.tracking_in_progress.store(false, Ordering::SeqCst);
        inner.mpc_computed.store(false, Ordering::SeqCst);
        self.disarm_cursor().await;

        *inner.cursor.lock().unwrap() = Cursor::default();

        tracing::info!("deactivated");
        inner.publish_diagnostics();
    }

    async fn reset_static(&self) -> bool {
        let inner = &self.inner;

        if !inner.is_active.load(Ordering::SeqCst) {
            tracing::error!("can not reset, not active");
            return false;
        }

        let Some(state) = inner.vehicle_state.lock().unwrap().clone() else {
            tracing::error!("can not reset, missing the state estimate");
            return false;
        };

        {
            let mut plant = inner.plant.lock().unwrap();
            tracing::info!("resetting with the state estimate, no dynamics");
            plant.translation = crate::model::TranslationState {
                x: AxisState::at_rest(state.position[0]),
                y: AxisState::at_rest(state.position[1]),
                z: AxisState::at_rest(state.position[2]),
            };
            plant.heading = AxisState::at_rest(state.heading);
            plant.reset_step_timing();
        }

        inner.tracking_in_progress.store(false, Ordering::SeqCst);
        self.disarm_cursor().await;

        {
            let mut timing = inner.timing.lock().unwrap();
            timing.mpc_start = Instant::now();
            timing.total_delay = 0.0;
        }

        inner.set_relative_goal(0.0, 0.0, 0.0, 0.0, false);

        tracing::info!("reset");
        true
    }

    fn status(&self) -> TrackerStatus {
        let inner = &self.inner;

        let (translation, heading) = {
            let plant = inner.plant.lock().unwrap();
            (plant.translation, plant.heading)
        };

        let (des_x, des_y, des_z, des_heading) = {
            let r = inner.horizon_ref.lock().unwrap();
            (r.x[0], r.y[0], r.z[0], r.heading[0])
        };

        let tracking = inner.tracking_in_progress.load(Ordering::SeqCst);
        let hovering = inner.hover_armed.load(Ordering::SeqCst);
        let active = inner.is_active.load(Ordering::SeqCst);

        let position_error = ((translation.x.position - des_x).powi(2)
            + (translation.y.position - des_y).powi(2)
            + (translation.z.position - des_z).powi(2))
        .sqrt();
        let have_position_error =
            position_error > inner.config.diagnostics.position_tracking_threshold;
        let have_heading_error = geometry::diff(heading.position, des_heading)
            > inner.config.diagnostics.heading_tracking_threshold;
        let have_nonzero_velocity = translation.x.velocity.abs() > 0.1
            || translation.y.velocity.abs() > 0.1
            || translation.z.velocity.abs() > 0.1
            || heading.velocity.abs() > 0.1;

        let cursor = *inner.cursor.lock().unwrap();
        let trajectory = inner.whole_trajectory.lock().unwrap();

        TrackerStatus {
            active,
            callbacks_enabled: active
                && inner.callbacks_enabled.load(Ordering::SeqCst)
                && !hovering,
            have_goal: tracking
                || hovering
                || have_position_error
                || have_heading_error
                || have_nonzero_velocity,
            tracking_trajectory: tracking,
            trajectory_length: trajectory.as_ref().map(|t| t.size()).unwrap_or(0),
            trajectory_idx: cursor.idx,
            trajectory_reference: if tracking {
                trajectory.as_ref().map(|t| t.point(cursor.idx))
            } else {
                None
            },
        }
    }

    async fn set_reference(&self, reference: &Reference) -> ServiceReply {
        self.disarm_hover().await;
        self.inner.set_goal(
            reference.position[0],
            reference.position[1],
            reference.position[2],
            reference.heading,
            reference.use_heading,
        );
        self.disarm_cursor().await;
        ServiceReply::ok("reference set")
    }

    async fn set_trajectory_reference(&self, trajectory: &TrajectoryReference) -> ServiceReply {
        let inner = &self.inner;

        let current_heading = inner.plant.lock().unwrap().heading.position;

        let loaded = match TrajectoryStore::load(
            trajectory,
            now_secs(),
            inner.dt1,
            inner.config.mpc.horizon_len,
            current_heading,
            inner.config.trajectory.loop_endpoint_tolerance,
        ) {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::error!("trajectory rejected: {e}");
                return ServiceReply::fail(e.to_string());
            }
        };

        let fly_now = loaded.fly_now;
        let size = loaded.store.size();

        if fly_now {
            self.disarm_hover().await;
        }

        {
            // replace the store atomically and reset the cursor to the
            // (possibly nonzero) sub-sample offset from the stamp
            let mut store = inner.whole_trajectory.lock().unwrap();
            let mut cursor = inner.cursor.lock().unwrap();
            *store = Some(loaded.store);
            cursor.idx = 0;
            cursor.sub_idx = loaded.subsample_offset;
        }

        inner.trajectory_count.fetch_add(1, Ordering::SeqCst);

        if fly_now {
            inner.tracking_in_progress.store(true, Ordering::SeqCst);
            inner.cursor_armed.store(true, Ordering::SeqCst);
        }

        tracing::info!(samples = size, fly_now, "trajectory loaded");
        inner.publish_diagnostics();

        ServiceReply::ok("trajectory loaded")
    }

    async fn hover(&self) -> ServiceReply {
        self.inner.tracking_in_progress.store(false, Ordering::SeqCst);
        self.disarm_cursor().await;
        self.inner.toggle_hover(true);
        ServiceReply::ok("initiating hover")
    }

    async fn start_trajectory_tracking(&self) -> ServiceReply {
        let inner = &self.inner;

        if inner.whole_trajectory.lock().unwrap().is_none() {
            let message = "can not start trajectory tracking, the trajectory is not set";
            tracing::warn!("{message}");
            return ServiceReply::fail(message);
        }

        self.disarm_hover().await;

        {
            let mut cursor = inner.cursor.lock().unwrap();
            cursor.idx = 0;
            cursor.sub_idx = 0;
        }
        inner.tracking_in_progress.store(true, Ordering::SeqCst);
        inner.cursor_armed.store(true, Ordering::SeqCst);

        inner.publish_diagnostics();
        tracing::info!("trajectory tracking started");
        ServiceReply::ok("trajectory tracking started")
    }

    async fn stop_trajectory_tracking(&self) -> ServiceReply {
        let inner = &self.inner;

        if inner.tracking_in_progress.swap(false, Ordering::SeqCst) {
            self.disarm_cursor().await;
            inner.toggle_hover(true);
            tracing::info!("stopping trajectory tracking");
            inner.publish_diagnostics();
            ServiceReply::ok("stopping trajectory tracking")
        } else {
            ServiceReply::ok("already at stop")
        }
    }

    async fn resume_trajectory_tracking(&self) -> ServiceReply {
        let inner = &self.inner;

        let size = match inner.whole_trajectory.lock().unwrap().as_ref() {
            Some(t) => t.size(),
            None => {
                let message = "can not resume trajectory tracking, the trajectory is not set";
                tracing::warn!("{message}");
                return ServiceReply::fail(message);
            }
        };

        let idx = inner.cursor.lock().unwrap().idx;
        if idx >= size - 1 {
            let message = "can not resume trajectory tracking, the trajectory is already finished";
            tracing::warn!("{message}");
            return ServiceReply::fail(message);
        }

        self.disarm_hover().await;
        inner.tracking_in_progress.store(true, Ordering::SeqCst);
        inner.cursor_armed.store(true, Ordering::SeqCst);

        inner.publish_diagnostics();
        tracing::info!("trajectory tracking resumed");
        ServiceReply::ok("trajectory tracking resumed")
    }

    async fn goto_trajectory_start(&self) -> ServiceReply {
        let inner = &self.inner;

        let start = match inner.whole_trajectory.lock().unwrap().as_ref() {
            Some(t) => (t.point(0), t.use_heading()),
            None => {
                let message = "can not fly to the start, the trajectory is not set";
                tracing::warn!("{message}");
                return ServiceReply::fail(message);
            }
        };

        self.disarm_hover().await;
        inner.tracking_in_progress.store(false, Ordering::SeqCst);
        self.disarm_cursor().await;

        let (point, use_heading) = start;
        inner.set_goal(point.x, point.y, point.z, point.heading, use_heading);

        inner.publish_diagnostics();
        ServiceReply::ok("flying to the start of the trajectory")
    }

    async fn set_constraints(&self, constraints: &DynamicsConstraints) -> ServiceReply {
        self.inner.constraints.lock().unwrap().ingest(*constraints);
        tracing::info!("updating constraints");
        ServiceReply::ok("constraints updated")
    }

    async fn switch_odometry_source(&self, new_state: &VehicleState) -> ServiceReply {
        let inner = &self.inner;

        inner.odometry_reset_in_progress.store(true, Ordering::SeqCst);
        inner.mpc_result_invalid.store(true, Ordering::SeqCst);

        // wait out any in-flight MPC iteration; the flag above keeps new
        // ones from starting
        while inner.mpc_running.load(Ordering::SeqCst) {
            tracing::debug!("waiting for the MPC iteration to finish");
            tokio::time::sleep(SPIN_WAIT).await;
        }

        let Some(old_state) = inner.vehicle_state.lock().unwrap().clone() else {
            inner.odometry_reset_in_progress.store(false, Ordering::SeqCst);
            return ServiceReply::fail("can not switch odometry, no previous state estimate");
        };

        let dx = new_state.position[0] - old_state.position[0];
        let dy = new_state.position[1] - old_state.position[1];
        let dz = new_state.position[2] - old_state.position[2];
        let dheading = new_state.heading - old_state.heading;

        tracing::info!(dx, dy, dz, dheading, "odometry reset");

        let rotation = nalgebra::Rotation2::new(dheading);
        let old_x = old_state.position[0];
        let old_y = old_state.position[1];
        let new_x = new_state.position[0];
        let new_y = new_state.position[1];

        let rotate = move |x: f64, y: f64| {
            let v = rotation * nalgebra::Vector2::new(x - old_x, y - old_y);
            (new_x + v.x, new_y + v.y)
        };

        {
            // joint critical section; acquisition follows the global lock
            // order (plant, reference, trajectory, state)
            let mut plant = inner.plant.lock().unwrap();
            let mut horizon_ref = inner.horizon_ref.lock().unwrap();
            let mut trajectory = inner.whole_trajectory.lock().unwrap();
            let mut vehicle_state = inner.vehicle_state.lock().unwrap();

            if let Some(store) = trajectory.as_mut() {
                store.for_each_sample_mut(|x, y, z, heading| {
                    let (rx, ry) = rotate(*x, *y);
                    *x = rx;
                    *y = ry;
                    *z += dz;
                    *heading += dheading;
                });
            }

            for i in 0..horizon_ref.x.len() {
                let (rx, ry) = rotate(horizon_ref.x[i], horizon_ref.y[i]);
                horizon_ref.x[i] = rx;
                horizon_ref.y[i] = ry;
                horizon_ref.z[i] += dz;
                horizon_ref.heading[i] += dheading;
            }

            let (px, py) = rotate(plant.translation.x.position, plant.translation.y.position);
            plant.translation.x.position = px;
            plant.translation.y.position = py;
            plant.translation.z.position += dz;

            plant.translation.x.velocity = new_state.velocity[0];
            plant.translation.y.velocity = new_state.velocity[1];
            // the vertical velocity is kept from the previous frame

            plant.translation.x.acceleration = 0.0;
            plant.translation.y.acceleration = 0.0;
            plant.translation.z.acceleration = 0.0;

            plant.heading.position += dheading;
            plant.heading.velocity = new_state.angular_velocity[2];

            *vehicle_state = Some(new_state.clone());
        }

        inner.odometry_reset_in_progress.store(false, Ordering::SeqCst);
        tracing::info!("odometry reset finished, restarting the MPC");

        ServiceReply::ok("odometry source switched")
    }

    async fn enable_callbacks(&self, enabled: bool) -> ServiceReply {
        let previous = self.inner.callbacks_enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            ServiceReply::ok(format!(
                "callbacks {}",
                if enabled { "enabled" } else { "disabled" }
            ))
        } else {
            ServiceReply::ok(format!(
                "callbacks were already {}",
                if enabled { "enabled" } else { "disabled" }
            ))
        }
    }
}

impl Inner {
    // | ---------------------- reference setting -------------------- |

    fn set_single_point_reference(&self, x: f64, y: f64, z: f64, heading: f64) {
        self.horizon_ref.lock().unwrap().fill(x, y, z, heading);
    }

    fn set_goal(&self, x: f64, y: f64, z: f64, heading: f64, use_heading: bool) {
        let desired_heading = if use_heading {
            geometry::wrap(heading)
        } else {
            self.plant.lock().unwrap().heading.position
        };

        self.tracking_in_progress.store(false, Ordering::SeqCst);
        self.cursor_armed.store(false, Ordering::SeqCst);

        self.set_single_point_reference(x, y, z, desired_heading);
        self.publish_diagnostics();
    }

    fn set_relative_goal(&self, dx: f64, dy: f64, dz: f64, dheading: f64, use_heading: bool) {
        let (x, y, z, heading) = {
            let plant = self.plant.lock().unwrap();
            (
                plant.translation.x.position + dx,
                plant.translation.y.position + dy,
                plant.translation.z.position + dz,
                plant.heading.position + if use_heading { dheading } else { 0.0 },
            )
        };

        self.tracking_in_progress.store(false, Ordering::SeqCst);
        self.cursor_armed.store(false, Ordering::SeqCst);

        self.set_single_point_reference(x, y, z, heading);
        self.publish_diagnostics();
    }

    fn toggle_hover(&self, armed: bool) {
        let was = self.hover_armed.swap(armed, Ordering::SeqCst);
        if armed && !was {
            tracing::debug!("hover watchdog armed");
        } else if !armed && was {
            tracing::debug!("hover watchdog disarmed");
        }
    }

    // | ----------------------- periodic bodies --------------------- |

    fn hover_watchdog_step(&self) {
        if !self.hover_armed.load(Ordering::SeqCst) {
            return;
        }
        self.hover_running.store(true, Ordering::SeqCst);

        self.set_relative_goal(0.0, 0.0, 0.0, 0.0, false);

        let translation = self.plant.lock().unwrap().translation;
        if translation.x.velocity.abs() < HOVER_SPEED_THRESHOLD
            && translation.y.velocity.abs() < HOVER_SPEED_THRESHOLD
            && translation.z.velocity.abs() < HOVER_SPEED_THRESHOLD
        {
            self.hover_armed.store(false, Ordering::SeqCst);
            tracing::info!("hover: speed is low, stopping the watchdog");
        }

        self.hover_running.store(false, Ordering::SeqCst);
    }

    fn trajectory_cursor_step(&self) {
        self.cursor_running.store(true, Ordering::SeqCst);

        let size = self
            .whole_trajectory
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| (t.size(), t.looping()));

        if let Some((size, looping)) = size {
            let mut cursor = self.cursor.lock().unwrap();
            cursor.sub_idx = 0;
            cursor.idx += 1;

            if cursor.idx == size {
                if looping {
                    cursor.idx = 0;
                    tracing::info!("trajectory looped");
                } else {
                    cursor.idx = size - 1;
                    self.tracking_in_progress.store(false, Ordering::SeqCst);
                    self.cursor_armed.store(false, Ordering::SeqCst);
                    tracing::info!("done tracking trajectory");
                }
            }
        }

        self.cursor_running.store(false, Ordering::SeqCst);
        self.publish_diagnostics();
    }

    /// One full MPC cycle: horizon reference refresh, constraint
    /// reconciliation, the four axis solves, and timing bookkeeping.
    fn mpc_iteration(&self) {
        if self.odometry_reset_in_progress.load(Ordering::SeqCst) {
            tracing::error!("MPC iteration skipped, odometry reset in progress");
            return;
        }
        if !self.is_active.load(Ordering::SeqCst) {
            return;
        }

        self.mpc_running.store(true, Ordering::SeqCst);
        let tick_start = Instant::now();
        let started_invalid = self.mpc_result_invalid.load(Ordering::SeqCst);

        if self.tracking_in_progress.load(Ordering::SeqCst) {
            let sample = {
                let trajectory = self.whole_trajectory.lock().unwrap();
                let mut cursor = self.cursor.lock().unwrap();
                trajectory.as_ref().map(|store| {
                    let sample = store.sample_horizon(
                        cursor.idx,
                        cursor.sub_idx,
                        self.dt1,
                        self.config.mpc.dt2,
                        self.config.mpc.horizon_len,
                    );
                    cursor.sub_idx += 1;
                    sample
                })
            };

            if let Some(sample) = sample {
                let mut reference = self.horizon_ref.lock().unwrap();
                reference.x = sample.x;
                reference.y = sample.y;
                reference.z = sample.z;
                reference.heading = sample.heading;
            }
        }

        {
            let (translation, heading) = {
                let plant = self.plant.lock().unwrap();
                (plant.translation, plant.heading)
            };
            self.constraints.lock().unwrap().reconcile(&translation, &heading);
        }

        self.calculate_mpc();

        let elapsed = tick_start.elapsed().as_secs_f64();
        if elapsed > self.dt1 {
            let mut timing = self.timing.lock().unwrap();
            timing.total_delay += elapsed - self.dt1;
            let uptime = timing.mpc_start.elapsed().as_secs_f64();
            let percent = 100.0 * timing.total_delay / uptime.max(1e-6);
            if percent >= 1.0 {
                tracing::warn!("MPC is running {percent:.2} % slower than it should");
            }
        }

        self.mpc_computed.store(true, Ordering::SeqCst);
        self.passthrough_warned.store(false, Ordering::SeqCst);

        if started_invalid {
            self.mpc_result_invalid.store(false, Ordering::SeqCst);
            tracing::info!("calculated the first MPC result after invalidation");
        }

        self.mpc_running.store(false, Ordering::SeqCst);
    }

    fn calculate_mpc(&self) {
        let constraints = self.constraints.lock().unwrap().effective();
        let (translation, heading_state) = {
            let plant = self.plant.lock().unwrap();
            (plant.translation, plant.heading)
        };
        let desired = self.horizon_ref.lock().unwrap().clone();
        let dynamic = self.dynamic.lock().unwrap().clone();
        let estimator_global = self
            .vehicle_state
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.estimator_horizontal.is_global())
            .unwrap_or(false);

        let horizon = self.config.mpc.horizon_len;
        let dt2 = self.config.mpc.dt2;
        let min_height = self.config.safety.min_height;

        let lowest_z = desired.z.iter().cloned().fold(f64::INFINITY, f64::min);

        // avoidance: compare the previous predicted horizon against peers
        let (altitude_floor, speed_scale) = if self.avoidance_enabled.load(Ordering::SeqCst)
            && estimator_global
        {
            let predicted_positions = self
                .predicted
                .lock()
                .unwrap()
                .as_ref()
                .map(|p| p.positions());

            match predicted_positions {
                Some(positions) => {
                    let now = Instant::now();
                    let peers = self.peers.lock().unwrap();
                    let mut avoidance_state = self.avoidance_state.lock().unwrap();
                    let scan = avoidance::check_trajectory_for_collisions(
                        &mut avoidance_state,
                        &self.config.avoidance,
                        self.priority,
                        &positions,
                        &peers,
                        min_height,
                        now,
                    );
                    let scale = avoidance::horizontal_speed_scale(
                        &mut avoidance_state,
                        &self.config.avoidance,
                        scan.first_collision_index.filter(|i| *i < horizon),
                        now,
                    );
                    (scan.altitude_floor, scale)
                }
                None => (self.avoidance_state.lock().unwrap().collision_free_altitude, 1.0),
            }
        } else {
            (min_height, 1.0)
        };

        let mut max_speed_x = constraints.horizontal_speed * speed_scale;
        let mut max_speed_y = constraints.horizontal_speed * speed_scale;

        if altitude_floor > lowest_z {
            // climbing over somebody: hard horizontal slow-down
            max_speed_x = constraints.horizontal_speed * self.config.avoidance.horizontal_speed_coef;
            max_speed_y = constraints.horizontal_speed * self.config.avoidance.horizontal_speed_coef;
        }

        // vertical reference: speed saturation, then the avoidance floor
        let mut des_z_filtered = reference::filter_reference_z(
            &desired.z,
            translation.z.position,
            constraints.vertical_ascending_speed,
            constraints.vertical_descending_speed,
            self.dt1,
            dt2,
        );
        reference::apply_altitude_floor(&mut des_z_filtered, altitude_floor);

        let z_limits = AxisLimits {
            max_velocity: constraints.vertical_ascending_speed,
            min_velocity: constraints.vertical_descending_speed,
            max_acceleration: constraints.vertical_ascending_acceleration,
            min_acceleration: constraints.vertical_descending_acceleration,
            max_jerk: constraints.vertical_ascending_jerk,
            min_jerk: constraints.vertical_descending_jerk,
            max_snap: constraints.vertical_ascending_snap,
            min_snap: constraints.vertical_descending_snap,
        };

        let q_vel = if self.brake.load(Ordering::SeqCst) {
            dynamic.q_vel_braking
        } else {
            dynamic.q_vel_no_braking
        };

        let mut solvers = self.solvers.lock().unwrap();
        solvers.x.set_vel_q(q_vel);
        solvers.y.set_vel_q(q_vel);
        solvers.z.set_vel_q(q_vel);
        solvers.heading.set_vel_q(q_vel);

        let solution_z = solvers.z.solve(&translation.z, &des_z_filtered, &z_limits);
        if !solution_z.converged {
            self.iterations_over_limit.fetch_add(1, Ordering::SeqCst);
        }

        // while climbing over somebody, trade the remaining horizontal
        // speed against the predicted climb rate
        let ascend = solution_z.states[0].velocity / constraints.vertical_ascending_speed.max(1e-6);
        if ascend > 0.0 && altitude_floor > lowest_z {
            let factor = (1.0 - ascend).max(0.0);
            max_speed_x *= factor;
            max_speed_y *= factor;
        }

        let (mut des_x_filtered, mut des_y_filtered) = reference::filter_reference_xy(
            &desired.x,
            &desired.y,
            translation.x.position,
            translation.y.position,
            max_speed_x,
            max_speed_y,
            self.dt1,
            dt2,
        );

        if dynamic.wiggle_enabled {
            let mut wiggle = self.wiggle.lock().unwrap();
            reference::apply_wiggle(
                &mut des_x_filtered,
                &mut des_y_filtered,
                &mut wiggle,
                dynamic.wiggle_amplitude,
                dynamic.wiggle_frequency,
                dt2,
                self.dt1,
            );
        }

        let xy_limits = AxisLimits::symmetric(
            0.0, // placeholder, set per axis below
            constraints.horizontal_acceleration,
            constraints.horizontal_jerk,
            constraints.horizontal_snap,
        );
        let x_limits = AxisLimits {
            max_velocity: max_speed_x,
            min_velocity: max_speed_x,
            ..xy_limits
        };
        let y_limits = AxisLimits {
            max_velocity: max_speed_y,
            min_velocity: max_speed_y,
            ..xy_limits
        };

        let solution_x = solvers.x.solve(&translation.x, &des_x_filtered, &x_limits);
        if !solution_x.converged {
            self.iterations_over_limit.fetch_add(1, Ordering::SeqCst);
        }

        let solution_y = solvers.y.solve(&translation.y, &des_y_filtered, &y_limits);
        if !solution_y.converged {
            self.iterations_over_limit.fetch_add(1, Ordering::SeqCst);
        }

        let mut des_heading = desired.heading.clone();
        reference::unwrap_heading(&mut des_heading, heading_state.position);

        let heading_limits = AxisLimits::symmetric(
            constraints.heading_speed,
            constraints.heading_acceleration,
            constraints.heading_jerk,
            constraints.heading_snap,
        );
        let solution_heading = solvers.heading.solve(&heading_state, &des_heading, &heading_limits);
        if !solution_heading.converged {
            self.iterations_over_limit.fetch_add(1, Ordering::SeqCst);
        }

        drop(solvers);

        // the solver clamps its inputs, this guards the arithmetic after it
        let mut u = [
            solution_x.first_input,
            solution_y.first_input,
            solution_z.first_input,
        ];
        let snap_bounds = [
            (constraints.horizontal_snap, constraints.horizontal_snap),
            (constraints.horizontal_snap, constraints.horizontal_snap),
            (constraints.vertical_ascending_snap, constraints.vertical_descending_snap),
        ];
        for (value, (upper, lower)) in u.iter_mut().zip(snap_bounds) {
            if *value > upper * 1.01 || *value < -lower * 1.01 {
                tracing::warn!("saturating snap: {value}");
            }
            *value = value.clamp(-lower, upper);
        }
        let u_heading = solution_heading
            .first_input
            .clamp(-constraints.heading_snap, constraints.heading_snap);

        *self.mpc_input.lock().unwrap() = (u, u_heading);

        *self.predicted.lock().unwrap() = Some(PredictedHorizon {
            x: solution_x.states,
            y: solution_y.states,
            z: solution_z.states,
            heading: solution_heading.states,
        });

        // decide braking for the next tick: brake when the reshaped
        // reference is flat across the horizon
        let near = horizon / 5;
        let far = horizon * 3 / 4;
        let last = horizon - 1;
        let flat = |v: &[f64]| {
            (v[near] - v[last]).abs() <= 0.1 && (v[far] - v[last]).abs() <= 0.1
        };
        let braking = dynamic.braking_enabled
            && flat(&des_x_filtered)
            && flat(&des_y_filtered)
            && flat(&des_z_filtered)
            && geometry::diff(des_heading[near], des_heading[last]) <= 0.1
            && geometry::diff(des_heading[far], des_heading[last]) <= 0.1;
        self.brake.store(braking, Ordering::SeqCst);
    }

    // | --------------------------- outputs -------------------------- |

    /// Publish this vehicle's predicted future in the shared world frame.
    fn publish_future(&self) {
        if !self.is_active.load(Ordering::SeqCst) {
            return;
        }

        let Some(positions) = self.predicted.lock().unwrap().as_ref().map(|p| p.positions())
        else {
            return;
        };

        let (frame_id, estimator_global) = match self.vehicle_state.lock().unwrap().as_ref() {
            Some(state) => (state.frame_id.clone(), state.estimator_horizontal.is_global()),
            None => return,
        };

        let mut points = Vec::with_capacity(positions.len());
        for position in positions {
            match self.transformer.local_to_shared(&frame_id, position) {
                Some(world) => {
                    points.push(FuturePoint { x: world[0], y: world[1], z: world[2] })
                }
                None => {
                    if !self.transform_warned.swap(true, Ordering::SeqCst) {
                        tracing::warn!("can not transform the predicted future to the shared frame");
                    }
                    return;
                }
            }
        }

        let future = FutureTrajectory {
            uav_name: self.config.uav_name.clone(),
            priority: self.priority,
            collision_avoidance: self.avoidance_enabled.load(Ordering::SeqCst)
                && estimator_global,
            stamp: now_secs(),
            points,
        };

        let _ = self.future_tx.send(future);
    }

    fn publish_diagnostics(&self) {
        let setpoint = {
            let r = self.horizon_ref.lock().unwrap();
            ReferencePoint { x: r.x[0], y: r.y[0], z: r.z[0], heading: r.heading[0] }
        };

        let frame_id = self
            .vehicle_state
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.frame_id.clone())
            .unwrap_or_default();

        let timeout = Duration::from_secs_f64(self.config.avoidance.trajectory_timeout);
        let now = Instant::now();
        let avoidance_active_uavs: Vec<String> = {
            let diags = self.peer_diags.lock().unwrap();
            diags
                .iter()
                .filter(|(_, entry)| {
                    entry.collision_avoidance_active
                        && now.duration_since(entry.received) < timeout
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        let mpc_delay_percent = {
            let timing = self.timing.lock().unwrap();
            let uptime = timing.mpc_start.elapsed().as_secs_f64();
            if uptime > 0.0 { 100.0 * timing.total_delay / uptime } else { 0.0 }
        };

        let diagnostics = TrackerDiagnostics {
            stamp: now_secs(),
            frame_id,
            uav_name: self.config.uav_name.clone(),
            active: self.is_active.load(Ordering::SeqCst),
            collision_avoidance_active: self.avoidance_enabled.load(Ordering::SeqCst),
            avoiding_collision: self.avoidance_state.lock().unwrap().avoiding,
            setpoint,
            avoidance_active_uavs: avoidance_active_uavs.clone(),
            mpc_delay_percent,
            solver_iterations_over_limit: self.iterations_over_limit.load(Ordering::SeqCst),
        };

        let _ = self.diagnostics_tx.send(diagnostics);

        let status = if avoidance_active_uavs.is_empty() {
            "I see: NOTHING".to_string()
        } else {
            format!("I see: {}", avoidance_active_uavs.join(", "))
        };
        let _ = self.status_string_tx.send(status);
    }
}

/// Identity pass-through command mirroring the estimator, used before the
/// first MPC result exists.
fn passthrough_command(state: &VehicleState) -> PositionCommand {
    PositionCommand {
        stamp: state.stamp,
        frame_id: state.frame_id.clone(),
        position: state.position,
        velocity: state.velocity,
        acceleration: [0.0; 3],
        jerk: [0.0; 3],
        heading: state.heading,
        heading_rate: state.angular_velocity[2],
        heading_acceleration: 0.0,
        heading_jerk: 0.0,
        use_position_horizontal: true,
        use_position_vertical: true,
        use_velocity_horizontal: true,
        use_velocity_vertical: true,
        use_acceleration: true,
        use_jerk: false,
        use_heading: true,
        use_heading_rate: true,
        use_heading_acceleration: false,
        use_heading_jerk: false,
    }
}
