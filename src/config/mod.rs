// src/config/mod.rs - tracker configuration loaded from TOML

use std::f64::consts::PI;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level tracker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackerConfig {
    #[serde(default = "default_uav_name")]
    pub uav_name: String,

    #[serde(default)]
    pub mpc: MpcConfig,

    #[serde(default)]
    pub braking: BrakingConfig,

    #[serde(default)]
    pub wiggle: WiggleConfig,

    #[serde(default)]
    pub avoidance: AvoidanceConfig,

    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    #[serde(default)]
    pub safety: SafetyConfig,

    #[serde(default)]
    pub trajectory: TrajectoryConfig,
}

/// MPC rate, horizon, and the per-axis solver tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MpcConfig {
    /// Control rate [Hz]; the control period dt1 is its inverse.
    #[serde(default = "default_mpc_rate")]
    pub rate: f64,

    /// Number of horizon samples.
    #[serde(default = "default_horizon_len")]
    pub horizon_len: usize,

    /// Inter-sample spacing within the horizon [s], >= dt1.
    #[serde(default = "default_dt2")]
    pub dt2: f64,

    #[serde(default = "default_xy_solver")]
    pub xy: AxisSolverConfig,

    #[serde(default = "default_z_solver")]
    pub z: AxisSolverConfig,

    #[serde(default = "default_heading_solver")]
    pub heading: AxisSolverConfig,
}

/// Tuning of one axis solver.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AxisSolverConfig {
    /// Diagonal state weights [position, velocity, acceleration, jerk].
    pub q: [f64; 4],
    /// Input (snap) weight.
    pub r: f64,
    /// Iteration budget per solve.
    pub max_iterations: usize,
    /// Log per-solve iteration counts at debug level.
    #[serde(default)]
    pub verbose: bool,
}

/// Velocity-weight swap applied when the reference is stationary.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrakingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_q_vel_braking")]
    pub q_vel_braking: f64,
    #[serde(default)]
    pub q_vel_no_braking: f64,
}

/// Persistent-excitation perturbation of the horizontal reference.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct WiggleConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_wiggle_amplitude")]
    pub amplitude: f64,
    #[serde(default = "default_wiggle_frequency")]
    pub frequency: f64,
}

/// Mutual collision avoidance parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AvoidanceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Horizontal collision radius [m].
    #[serde(default = "default_avoidance_radius")]
    pub radius: f64,

    /// Vertical collision threshold [m].
    #[serde(default = "default_altitude_threshold")]
    pub altitude_threshold: f64,

    /// Climb offset above a conflicting peer [m].
    #[serde(default = "default_height_correction")]
    pub height_correction: f64,

    /// Maximum age of a peer trajectory [s].
    #[serde(default = "default_trajectory_timeout")]
    pub trajectory_timeout: f64,

    /// Horizon index below which the speed is scaled fully.
    #[serde(default = "default_slow_down_fully")]
    pub collision_slow_down_fully: usize,

    /// Horizon index below which the speed scaling starts.
    #[serde(default = "default_slow_down_start")]
    pub collision_slow_down_start: usize,

    /// Horizon index below which a detected conflict triggers climbing.
    #[serde(default = "default_start_climbing")]
    pub collision_start_climbing: usize,

    /// Horizontal speed multiplier while avoiding, in (0, 1].
    #[serde(default = "default_horizontal_speed_coef")]
    pub horizontal_speed_coef: f64,

    /// Predicted-future publish rate [Hz].
    #[serde(default = "default_avoidance_publish_rate")]
    pub publish_rate: f64,

    /// Names of all vehicles in the fleet; this vehicle is filtered out.
    #[serde(default)]
    pub peer_names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiagnosticsConfig {
    #[serde(default = "default_diagnostics_rate")]
    pub rate: f64,

    /// Position error above which the "have goal" flag is raised [m].
    #[serde(default = "default_position_tracking_threshold")]
    pub position_tracking_threshold: f64,

    /// Heading error above which the "have goal" flag is raised [rad].
    #[serde(default = "default_heading_tracking_threshold")]
    pub heading_tracking_threshold: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SafetyConfig {
    /// Lower bound of the flight volume [m]; the avoidance floor never
    /// decays below it.
    #[serde(default)]
    pub min_height: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrajectoryConfig {
    /// Maximum distance between the first and last sample of a looping
    /// trajectory [m].
    #[serde(default = "default_loop_endpoint_tolerance")]
    pub loop_endpoint_tolerance: f64,
}

// Default value functions
fn default_uav_name() -> String { "uav1".to_string() }
fn default_mpc_rate() -> f64 { 100.0 }
fn default_horizon_len() -> usize { 40 }
fn default_dt2() -> f64 { 0.2 }
fn default_true() -> bool { true }
fn default_q_vel_braking() -> f64 { 8000.0 }
fn default_wiggle_amplitude() -> f64 { 0.5 }
fn default_wiggle_frequency() -> f64 { 0.2 }
fn default_avoidance_radius() -> f64 { 5.0 }
fn default_altitude_threshold() -> f64 { 2.5 }
fn default_height_correction() -> f64 { 3.0 }
fn default_trajectory_timeout() -> f64 { 2.0 }
fn default_slow_down_fully() -> usize { 5 }
fn default_slow_down_start() -> usize { 20 }
fn default_start_climbing() -> usize { 20 }
fn default_horizontal_speed_coef() -> f64 { 0.25 }
fn default_avoidance_publish_rate() -> f64 { 10.0 }
fn default_diagnostics_rate() -> f64 { 2.0 }
fn default_position_tracking_threshold() -> f64 { 0.5 }
fn default_heading_tracking_threshold() -> f64 { 0.2 }
fn default_loop_endpoint_tolerance() -> f64 { PI }

fn default_xy_solver() -> AxisSolverConfig {
    AxisSolverConfig { q: [5000.0, 0.0, 0.0, 0.0], r: 500.0, max_iterations: 25, verbose: false }
}

fn default_z_solver() -> AxisSolverConfig {
    AxisSolverConfig { q: [5000.0, 0.0, 0.0, 0.0], r: 500.0, max_iterations: 25, verbose: false }
}

fn default_heading_solver() -> AxisSolverConfig {
    AxisSolverConfig { q: [3000.0, 0.0, 0.0, 0.0], r: 500.0, max_iterations: 25, verbose: false }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            uav_name: default_uav_name(),
            mpc: MpcConfig::default(),
            braking: BrakingConfig::default(),
            wiggle: WiggleConfig::default(),
            avoidance: AvoidanceConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            safety: SafetyConfig::default(),
            trajectory: TrajectoryConfig::default(),
        }
    }
}

impl Default for MpcConfig {
    fn default() -> Self {
        Self {
            rate: default_mpc_rate(),
            horizon_len: default_horizon_len(),
            dt2: default_dt2(),
            xy: default_xy_solver(),
            z: default_z_solver(),
            heading: default_heading_solver(),
        }
    }
}

impl Default for BrakingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            q_vel_braking: default_q_vel_braking(),
            q_vel_no_braking: 0.0,
        }
    }
}

impl Default for AvoidanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            radius: default_avoidance_radius(),
            altitude_threshold: default_altitude_threshold(),
            height_correction: default_height_correction(),
            trajectory_timeout: default_trajectory_timeout(),
            collision_slow_down_fully: default_slow_down_fully(),
            collision_slow_down_start: default_slow_down_start(),
            collision_start_climbing: default_start_climbing(),
            horizontal_speed_coef: default_horizontal_speed_coef(),
            publish_rate: default_avoidance_publish_rate(),
            peer_names: Vec::new(),
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            rate: default_diagnostics_rate(),
            position_tracking_threshold: default_position_tracking_threshold(),
            heading_tracking_threshold: default_heading_tracking_threshold(),
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self { min_height: 0.0 }
    }
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self { loop_endpoint_tolerance: default_loop_endpoint_tolerance() }
    }
}

impl TrackerConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        let config: TrackerConfig = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded tracker configuration from {}", path.as_ref().display());
        Ok(config)
    }

    /// Control period dt1 [s].
    pub fn dt1(&self) -> f64 {
        1.0 / self.mpc.rate
    }

    /// Validate value ranges and cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mpc.rate < 10.0 {
            return Err(ConfigError::Invalid("mpc.rate must be >= 10 Hz".into()));
        }
        if self.mpc.horizon_len < 2 {
            return Err(ConfigError::Invalid("mpc.horizon_len must be >= 2".into()));
        }
        if self.mpc.dt2 < self.dt1() {
            return Err(ConfigError::Invalid(
                "mpc.dt2 must not be smaller than the control period".into(),
            ));
        }
        for (name, axis) in [
            ("xy", &self.mpc.xy),
            ("z", &self.mpc.z),
            ("heading", &self.mpc.heading),
        ] {
            if axis.q.iter().any(|q| !q.is_finite() || *q < 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "mpc.{name}.q entries must be finite and non-negative"
                )));
            }
            if !axis.r.is_finite() || axis.r <= 0.0 {
                return Err(ConfigError::Invalid(format!("mpc.{name}.r must be positive")));
            }
            if axis.max_iterations == 0 {
                return Err(ConfigError::Invalid(format!(
                    "mpc.{name}.max_iterations must be positive"
                )));
            }
        }
        if self.avoidance.horizontal_speed_coef <= 0.0 || self.avoidance.horizontal_speed_coef > 1.0
        {
            return Err(ConfigError::Invalid(
                "avoidance.horizontal_speed_coef must be in (0, 1]".into(),
            ));
        }
        if self.avoidance.collision_slow_down_fully >= self.avoidance.collision_slow_down_start {
            return Err(ConfigError::Invalid(
                "avoidance.collision_slow_down_fully must be below collision_slow_down_start"
                    .into(),
            ));
        }
        if self.avoidance.publish_rate <= 0.0 || self.diagnostics.rate <= 0.0 {
            return Err(ConfigError::Invalid("publish rates must be positive".into()));
        }
        if self.trajectory.loop_endpoint_tolerance <= 0.0 {
            return Err(ConfigError::Invalid(
                "trajectory.loop_endpoint_tolerance must be positive".into(),
            ));
        }
        Ok(())
    }
}
