// src/lib.rs - MPC trajectory tracker for multirotor aerial vehicles

pub mod avoidance;
pub mod config;
pub mod constraints;
pub mod geometry;
pub mod model;
pub mod reference;
pub mod solver;
pub mod tracker;
pub mod trajectory;
pub mod types;

pub use avoidance::{FrameTransformer, IdentityTransformer};
pub use config::TrackerConfig;
pub use tracker::{DynamicParams, MpcTracker, Tracker, now_secs};
pub use types::{
    DynamicsConstraints, EstimatorKind, FuturePoint, FutureTrajectory, PositionCommand,
    Reference, ReferencePoint, ServiceReply, TrackerDiagnostics, TrackerStatus,
    TrajectoryReference, VehicleState,
};
