// src/avoidance/mod.rs - mutual collision avoidance between cooperating vehicles

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::AvoidanceConfig;
use crate::geometry;
use crate::types::FutureTrajectory;

/// Decay of the avoidance altitude floor per control tick when no conflict
/// is active [m].
const FLOOR_DECAY_PER_TICK: f64 = 0.02;

/// How long a larger slow-down factor is held before it may relax.
const COEF_HOLD: Duration = Duration::from_secs(2);

/// Conversion between the local estimator frame and the frame shared by all
/// avoidance participants.
///
/// The host supplies the implementation; a failed conversion makes the
/// caller drop the affected message.
pub trait FrameTransformer: Send + Sync {
    /// Local frame -> shared world frame.
    fn local_to_shared(&self, frame_id: &str, point: [f64; 3]) -> Option<[f64; 3]>;
    /// Shared world frame -> local frame.
    fn shared_to_local(&self, frame_id: &str, point: [f64; 3]) -> Option<[f64; 3]>;
}

/// Transformer for hosts whose estimator frame already is the shared frame.
pub struct IdentityTransformer;

impl FrameTransformer for IdentityTransformer {
    fn local_to_shared(&self, _frame_id: &str, point: [f64; 3]) -> Option<[f64; 3]> {
        Some(point)
    }

    fn shared_to_local(&self, _frame_id: &str, point: [f64; 3]) -> Option<[f64; 3]> {
        Some(point)
    }
}

/// Numeric priority derived from a vehicle name; lower keeps the right of
/// way. Names without a numeric suffix sort last.
pub fn priority_from_name(name: &str) -> u32 {
    let digits: String = name.chars().skip_while(|c| !c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(u32::MAX)
}

/// Most recent future trajectory of one peer, restamped with local receive
/// time because peer clocks are not assumed synchronized.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub trajectory: FutureTrajectory,
    pub received: Instant,
}

/// Registry of peer futures keyed by vehicle name.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    entries: HashMap<String, PeerEntry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    pub fn insert(&mut self, trajectory: FutureTrajectory, received: Instant) {
        self.entries
            .insert(trajectory.uav_name.clone(), PeerEntry { trajectory, received });
    }

    /// Entries younger than `timeout`; expired peers are skipped, not
    /// removed, so a revived peer keeps its slot.
    pub fn iter_fresh(
        &self,
        timeout: Duration,
        now: Instant,
    ) -> impl Iterator<Item = &PeerEntry> {
        self.entries
            .values()
            .filter(move |e| now.duration_since(e.received) < timeout)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Mutable avoidance bookkeeping owned by the tracker.
#[derive(Debug, Clone)]
pub struct AvoidanceState {
    /// Current lower bound on the vertical reference.
    pub collision_free_altitude: f64,
    /// Currently climbing over somebody.
    pub avoiding: bool,
    coef_scaler: f64,
    coef_time: Option<Instant>,
}

impl AvoidanceState {
    pub fn new(min_height: f64) -> Self {
        Self {
            collision_free_altitude: min_height,
            avoiding: false,
            coef_scaler: 0.0,
            coef_time: None,
        }
    }
}

/// Result of scanning the predicted horizon against all fresh peers.
#[derive(Debug, Clone, Copy)]
pub struct CollisionScan {
    /// Earliest horizon index with an inflated-radius contact.
    pub first_collision_index: Option<usize>,
    /// Altitude floor to impose on the vertical reference.
    pub altitude_floor: f64,
}

fn check_collision(cfg: &AvoidanceConfig, a: [f64; 3], b: [f64; 3]) -> bool {
    geometry::dist_xy(a[0], a[1], b[0], b[1]) < cfg.radius
        && (a[2] - b[2]).abs() < cfg.altitude_threshold
}

fn check_collision_inflated(cfg: &AvoidanceConfig, a: [f64; 3], b: [f64; 3]) -> bool {
    geometry::dist_xy(a[0], a[1], b[0], b[1]) < cfg.radius + 1.0
        && (a[2] - b[2]).abs() < cfg.altitude_threshold + 1.0
}

/// Compare our predicted horizon against every fresh peer and arbitrate.
///
/// We yield when the peer has avoidance disabled or carries a smaller
/// priority number; the floor is only raised for conflicts early enough in
/// the horizon (`collision_start_climbing`) so the climb happens before the
/// closest approach. Without any active conflict the floor decays toward
/// the safety-area minimum.
pub fn check_trajectory_for_collisions(
    state: &mut AvoidanceState,
    cfg: &AvoidanceConfig,
    my_priority: u32,
    predicted: &[[f64; 3]],
    peers: &PeerRegistry,
    min_height: f64,
    now: Instant,
) -> CollisionScan {
    let timeout = Duration::from_secs_f64(cfg.trajectory_timeout);

    let mut first_collision_index: Option<usize> = None;
    state.avoiding = false;

    for peer in peers.iter_fresh(timeout, now) {
        let trajectory = &peer.trajectory;

        for (v, ours) in predicted.iter().enumerate() {
            let Some(point) = trajectory.points.get(v) else {
                break;
            };
            let theirs = [point.x, point.y, point.z];

            if check_collision(cfg, *ours, theirs) {
                if !trajectory.collision_avoidance || trajectory.priority < my_priority {
                    // we yield
                    state.avoiding = true;
                    let safe_altitude = theirs[2] + cfg.height_correction;
                    if safe_altitude > state.collision_free_altitude
                        && v <= cfg.collision_start_climbing
                    {
                        state.collision_free_altitude = safe_altitude;
                    }
                    tracing::error!(
                        peer = %trajectory.uav_name,
                        "avoiding collision, raising the altitude floor"
                    );
                } else {
                    tracing::warn!(
                        peer = %trajectory.uav_name,
                        "detected collision, not avoiding (our priority is lower)"
                    );
                }
            }

            if check_collision_inflated(cfg, *ours, theirs)
                && first_collision_index.is_none_or(|idx| v < idx)
            {
                first_collision_index = Some(v);
            }
        }
    }

    if !state.avoiding {
        state.collision_free_altitude =
            (state.collision_free_altitude - FLOOR_DECAY_PER_TICK).max(min_height);
    }

    CollisionScan { first_collision_index, altitude_floor: state.collision_free_altitude }
}

/// Horizontal speed multiplier for the current conflict distance.
///
/// Contacts at or below `collision_slow_down_fully` scale the speed all the
/// way to `horizontal_speed_coef`; up to `collision_slow_down_start` the
/// scaling fades in quadratically; beyond it no scaling applies. A newly
/// larger scaler takes effect immediately, a smaller one only after the
/// previous value has been held for two seconds.
pub fn horizontal_speed_scale(
    state: &mut AvoidanceState,
    cfg: &AvoidanceConfig,
    first_collision_index: Option<usize>,
    now: Instant,
) -> f64 {
    let Some(index) = first_collision_index else {
        return 1.0;
    };

    let mut raw = 0.0;
    if index <= cfg.collision_slow_down_fully {
        raw = 1.0;
    } else if index <= cfg.collision_slow_down_start {
        let span = (cfg.collision_slow_down_start - cfg.collision_slow_down_fully) as f64;
        let t = 1.0 - (index - cfg.collision_slow_down_fully) as f64 / span;
        raw = t * t;
    }
    let raw = raw.clamp(0.0, 1.0);

    if raw > state.coef_scaler {
        state.coef_scaler = raw;
        state.coef_time = Some(now);
    }
    if let Some(t) = state.coef_time {
        if now.duration_since(t) > COEF_HOLD {
            state.coef_scaler = raw;
            state.coef_time = Some(now);
        }
    }

    cfg.horizontal_speed_coef * state.coef_scaler + (1.0 - state.coef_scaler)
}
