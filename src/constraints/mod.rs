// src/constraints/mod.rs - safe application of new kinematic limits

use crate::model::{AxisState, TranslationState};
use crate::types::DynamicsConstraints;

/// Two-stage constraint switchover.
///
/// Speed limits only shape the reference pre-saturation, so they migrate
/// into the effective set immediately. Acceleration, jerk, and snap bound
/// the solver directly; tightening them while the plant is outside the new
/// envelope would make the MPC infeasible, so they stay pending until the
/// plant has slowed into range.
#[derive(Debug, Clone, Default)]
pub struct ConstraintManager {
    requested: Option<DynamicsConstraints>,
    effective: DynamicsConstraints,
    all_applied: bool,
}

impl ConstraintManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any constraints have ever been received.
    pub fn got_constraints(&self) -> bool {
        self.requested.is_some()
    }

    /// The set the MPC currently enforces.
    pub fn effective(&self) -> DynamicsConstraints {
        self.effective
    }

    /// The most recently requested set.
    pub fn requested(&self) -> Option<DynamicsConstraints> {
        self.requested
    }

    /// Accept a new envelope: speeds now, higher derivatives pending.
    pub fn ingest(&mut self, constraints: DynamicsConstraints) {
        self.effective.horizontal_speed = constraints.horizontal_speed;
        self.effective.vertical_ascending_speed = constraints.vertical_ascending_speed;
        self.effective.vertical_descending_speed = constraints.vertical_descending_speed;
        self.effective.heading_speed = constraints.heading_speed;

        // first ever set also seeds the higher derivatives, there is nothing
        // older to protect
        if self.requested.is_none() {
            self.effective = constraints;
            self.all_applied = true;
        } else {
            self.all_applied = false;
        }

        self.requested = Some(constraints);
    }

    /// Commit pending higher derivatives once the plant state fits the new
    /// envelope on every axis. Returns true when a commit happened.
    pub fn reconcile(&mut self, translation: &TranslationState, heading: &AxisState) -> bool {
        let Some(requested) = self.requested else {
            return false;
        };
        if self.all_applied {
            return false;
        }

        let t = translation;
        let within = t.x.velocity.abs() < requested.horizontal_speed
            && t.x.acceleration.abs() < requested.horizontal_acceleration
            && t.x.jerk.abs() < requested.horizontal_jerk
            && t.y.velocity.abs() < requested.horizontal_speed
            && t.y.acceleration.abs() < requested.horizontal_acceleration
            && t.y.jerk.abs() < requested.horizontal_jerk
            && t.z.velocity < requested.vertical_ascending_speed
            && t.z.velocity > -requested.vertical_descending_speed
            && t.z.acceleration < requested.vertical_ascending_acceleration
            && t.z.acceleration > -requested.vertical_descending_acceleration
            && t.z.jerk < requested.vertical_ascending_jerk
            && t.z.jerk > -requested.vertical_descending_jerk
            && heading.velocity.abs() < requested.heading_speed
            && heading.acceleration.abs() < requested.heading_acceleration
            && heading.jerk.abs() < requested.heading_jerk;

        if !within {
            tracing::warn!("slowing down to apply new constraints");
            return false;
        }

        self.effective.horizontal_acceleration = requested.horizontal_acceleration;
        self.effective.horizontal_jerk = requested.horizontal_jerk;
        self.effective.horizontal_snap = requested.horizontal_snap;

        self.effective.vertical_ascending_acceleration = requested.vertical_ascending_acceleration;
        self.effective.vertical_ascending_jerk = requested.vertical_ascending_jerk;
        self.effective.vertical_ascending_snap = requested.vertical_ascending_snap;

        self.effective.vertical_descending_acceleration =
            requested.vertical_descending_acceleration;
        self.effective.vertical_descending_jerk = requested.vertical_descending_jerk;
        self.effective.vertical_descending_snap = requested.vertical_descending_snap;

        self.effective.heading_acceleration = requested.heading_acceleration;
        self.effective.heading_jerk = requested.heading_jerk;
        self.effective.heading_snap = requested.heading_snap;

        self.all_applied = true;
        tracing::info!("all constraints applied");
        true
    }
}
