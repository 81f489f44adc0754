// src/types/mod.rs - wire-level data model shared by the tracker and its host

use serde::{Deserialize, Serialize};

/// Source of the horizontal position estimate.
///
/// Mutual collision avoidance only makes sense when all participants share a
/// globally consistent frame, so it is gated on GPS-class estimators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EstimatorKind {
    Gps,
    Rtk,
    #[default]
    Other,
}

impl EstimatorKind {
    /// Whether this estimator provides a frame shared with other vehicles.
    pub fn is_global(self) -> bool {
        matches!(self, EstimatorKind::Gps | EstimatorKind::Rtk)
    }
}

/// One sample of the state estimate stream.
///
/// Timestamps are seconds; the tracker never compares them against its own
/// clock except where explicitly noted (trajectory staleness).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VehicleState {
    pub stamp: f64,
    pub frame_id: String,
    /// Position [x, y, z] in the estimator frame.
    pub position: [f64; 3],
    /// Heading (rotation about z) in radians.
    pub heading: f64,
    /// Linear velocity [x, y, z].
    pub velocity: [f64; 3],
    /// Angular velocity [x, y, z]; `z` carries the heading rate.
    pub angular_velocity: [f64; 3],
    pub estimator_horizontal: EstimatorKind,
}

/// Fourth-order position command emitted every control step.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PositionCommand {
    pub stamp: f64,
    pub frame_id: String,

    pub position: [f64; 3],
    pub velocity: [f64; 3],
    pub acceleration: [f64; 3],
    pub jerk: [f64; 3],

    pub heading: f64,
    pub heading_rate: f64,
    pub heading_acceleration: f64,
    pub heading_jerk: f64,

    pub use_position_horizontal: bool,
    pub use_position_vertical: bool,
    pub use_velocity_horizontal: bool,
    pub use_velocity_vertical: bool,
    pub use_acceleration: bool,
    pub use_jerk: bool,
    pub use_heading: bool,
    pub use_heading_rate: bool,
    pub use_heading_acceleration: bool,
    pub use_heading_jerk: bool,
}

/// A single setpoint reference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Reference {
    pub position: [f64; 3],
    pub heading: f64,
    pub use_heading: bool,
}

/// One sample of a time-parametrized trajectory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ReferencePoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub heading: f64,
}

/// A time-sampled trajectory reference.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrajectoryReference {
    /// Nominal time of sample 0, seconds. Zero means "starts now".
    pub header_stamp: f64,
    pub frame_id: String,
    /// Sample period, seconds. Zero/unset falls back to a legacy default.
    pub dt: f64,
    /// Start tracking immediately on load instead of waiting for a start call.
    pub fly_now: bool,
    /// Wrap the sample index at the end instead of stopping.
    #[serde(rename = "loop")]
    pub looping: bool,
    /// Honour the heading column; otherwise the current heading is held.
    pub use_heading: bool,
    pub points: Vec<ReferencePoint>,
}

/// Kinematic envelope for all four controlled axes.
///
/// Vertical limits are split into ascending/descending magnitudes; both are
/// positive numbers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct DynamicsConstraints {
    pub horizontal_speed: f64,
    pub horizontal_acceleration: f64,
    pub horizontal_jerk: f64,
    pub horizontal_snap: f64,

    pub vertical_ascending_speed: f64,
    pub vertical_ascending_acceleration: f64,
    pub vertical_ascending_jerk: f64,
    pub vertical_ascending_snap: f64,

    pub vertical_descending_speed: f64,
    pub vertical_descending_acceleration: f64,
    pub vertical_descending_jerk: f64,
    pub vertical_descending_snap: f64,

    pub heading_speed: f64,
    pub heading_acceleration: f64,
    pub heading_jerk: f64,
    pub heading_snap: f64,
}

/// One point of a published predicted future, in the shared world frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct FuturePoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// A vehicle's predicted future over the MPC horizon, exchanged between
/// peers for mutual collision avoidance.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FutureTrajectory {
    pub uav_name: String,
    /// Lower number wins the right of way.
    pub priority: u32,
    /// Whether the sender is participating in collision avoidance.
    pub collision_avoidance: bool,
    pub stamp: f64,
    pub points: Vec<FuturePoint>,
}

/// Periodic tracker health report, also consumed from peers.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrackerDiagnostics {
    pub stamp: f64,
    pub frame_id: String,
    pub uav_name: String,

    pub active: bool,
    pub collision_avoidance_active: bool,
    pub avoiding_collision: bool,

    /// First sample of the current horizon reference.
    pub setpoint: ReferencePoint,

    /// Peers whose avoidance-active diagnostics are fresh.
    pub avoidance_active_uavs: Vec<String>,

    /// Fraction of uptime lost to MPC overruns, percent.
    pub mpc_delay_percent: f64,
    /// Solver runs that hit the per-axis iteration limit since activation.
    pub solver_iterations_over_limit: u64,
}

/// Snapshot answer to a status query.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrackerStatus {
    pub active: bool,
    pub callbacks_enabled: bool,
    pub have_goal: bool,
    pub tracking_trajectory: bool,
    pub trajectory_length: usize,
    pub trajectory_idx: usize,
    /// Current whole-trajectory sample while tracking.
    pub trajectory_reference: Option<ReferencePoint>,
}

/// Outcome of a service-like request.
#[derive(Debug, Clone)]
pub struct ServiceReply {
    pub success: bool,
    pub message: String,
}

impl ServiceReply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into() }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into() }
    }
}
