// src/model/mod.rs - fourth-order integrator plant advanced at the control rate

use std::time::Instant;

use crate::geometry;

/// Accepted range for a measured step; anything outside falls back to the
/// nominal control period to guard against clock glitches.
const MIN_STEP_S: f64 = 0.001;
const MAX_STEP_S: f64 = 2.0;

/// State of one integrator chain: position and its first three derivatives.
///
/// For the heading chain the fields read heading / rate / acceleration /
/// jerk; the integration rules are identical.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AxisState {
    pub position: f64,
    pub velocity: f64,
    pub acceleration: f64,
    pub jerk: f64,
}

impl AxisState {
    pub fn at_rest(position: f64) -> Self {
        Self { position, ..Self::default() }
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite()
            && self.velocity.is_finite()
            && self.acceleration.is_finite()
            && self.jerk.is_finite()
    }

    /// One step of the discrete chain with snap input `u`.
    ///
    /// Rows of the transition:
    ///   p' = p + dt*v + 0.5*dt^2*a
    ///   v' = v + dt*a + 0.5*dt^2*j
    ///   a' = a + dt*j
    ///   j' = j + dt*u
    pub fn step(&self, u: f64, dt: f64) -> Self {
        Self {
            position: self.position + dt * self.velocity + 0.5 * dt * dt * self.acceleration,
            velocity: self.velocity + dt * self.acceleration + 0.5 * dt * dt * self.jerk,
            acceleration: self.acceleration + dt * self.jerk,
            jerk: self.jerk + dt * u,
        }
    }
}

/// Translational plant state, one chain per axis.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranslationState {
    pub x: AxisState,
    pub y: AxisState,
    pub z: AxisState,
}

impl TranslationState {
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Simulated plant the MPC controls.
///
/// The step length is the measured wall time since the previous step; the
/// first step after (re)activation and any implausible measurement use the
/// nominal control period instead.
#[derive(Debug, Clone)]
pub struct PlantModel {
    nominal_dt: f64,
    last_step: Option<Instant>,
    pub translation: TranslationState,
    pub heading: AxisState,
}

impl PlantModel {
    pub fn new(nominal_dt: f64) -> Self {
        Self {
            nominal_dt,
            last_step: None,
            translation: TranslationState::default(),
            heading: AxisState::default(),
        }
    }

    /// Forget the previous step time so the next step is seeded with the
    /// nominal period.
    pub fn reset_step_timing(&mut self) {
        self.last_step = None;
    }

    /// Advance by the wall time elapsed since the previous call.
    pub fn step(&mut self, u: [f64; 3], u_heading: f64) {
        let now = Instant::now();
        let dt = match self.last_step {
            Some(prev) => {
                let measured = now.duration_since(prev).as_secs_f64();
                if (MIN_STEP_S..MAX_STEP_S).contains(&measured) {
                    measured
                } else {
                    self.nominal_dt
                }
            }
            None => self.nominal_dt,
        };
        self.last_step = Some(now);
        self.step_with_dt(u, u_heading, dt);
    }

    /// Advance by an explicit step length.
    pub fn step_with_dt(&mut self, u: [f64; 3], u_heading: f64, dt: f64) {
        self.translation.x = self.translation.x.step(u[0], dt);
        self.translation.y = self.translation.y.step(u[1], dt);
        self.translation.z = self.translation.z.step(u[2], dt);

        self.heading = self.heading.step(u_heading, dt);
        self.heading.position = geometry::wrap(self.heading.position);
    }

    pub fn is_finite(&self) -> bool {
        self.translation.is_finite() && self.heading.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn test_axis_step_integrates_upward() {
        let mut s = AxisState::at_rest(0.0);
        // constant positive snap accumulates jerk, acceleration, velocity
        for _ in 0..100 {
            s = s.step(1.0, 0.01);
        }
        assert!(s.jerk > 0.9 && s.jerk < 1.1);
        assert!(s.acceleration > 0.0);
        assert!(s.velocity > 0.0);
        assert!(s.position > 0.0);
    }

    #[test]
    fn test_zero_input_keeps_rest() {
        let mut plant = PlantModel::new(0.01);
        plant.translation.x = AxisState::at_rest(1.5);
        plant.heading.position = 0.7;
        plant.step_with_dt([0.0; 3], 0.0, 0.01);
        assert_eq!(plant.translation.x.position, 1.5);
        assert_eq!(plant.heading.position, 0.7);
    }

    #[test]
    fn test_heading_wraps_after_step() {
        let mut plant = PlantModel::new(0.01);
        plant.heading.position = PI - 0.001;
        plant.heading.velocity = 1.0;
        plant.step_with_dt([0.0; 3], 0.0, 0.01);
        assert!(plant.heading.position <= PI);
        assert!(plant.heading.position > -PI);
        // went past +pi, so it must have wrapped to the negative side
        assert!(plant.heading.position < 0.0);
    }

    #[test]
    fn test_first_wall_clock_step_uses_nominal_dt() {
        let mut plant = PlantModel::new(0.01);
        plant.translation.x.velocity = 1.0;
        plant.step([0.0; 3], 0.0);
        assert!((plant.translation.x.position - 0.01).abs() < 1e-9);

        // back-to-back steps are faster than the 1 ms guard, so the nominal
        // period is substituted again
        plant.step([0.0; 3], 0.0);
        assert!((plant.translation.x.position - 0.02).abs() < 1e-9);
    }
}
