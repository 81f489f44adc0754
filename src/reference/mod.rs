// src/reference/mod.rs - reshaping of desired positions into a feasible MPC reference

use std::f64::consts::{PI, TAU};

use crate::geometry;

/// Phase memory of the wiggle perturbation.
#[derive(Debug, Clone, Copy, Default)]
pub struct WiggleState {
    pub phase: f64,
}

/// Saturate the vertical reference so consecutive samples never demand more
/// than the ascending/descending speed allows.
///
/// The first step covers the control period, later steps the horizon
/// spacing. Both speed limits are positive magnitudes.
pub fn filter_reference_z(
    desired: &[f64],
    current_z: f64,
    max_ascending_speed: f64,
    max_descending_speed: f64,
    dt1: f64,
    dt2: f64,
) -> Vec<f64> {
    let mut filtered = Vec::with_capacity(desired.len());
    let mut previous = current_z;

    for (i, &des) in desired.iter().enumerate() {
        let dt = if i == 0 { dt1 } else { dt2 };
        let difference = des - previous;
        let max_sample = if difference > 0.0 {
            max_ascending_speed * dt
        } else {
            max_descending_speed * dt
        };

        let next = previous + difference.clamp(-max_sample, max_sample);
        filtered.push(next);
        previous = next;
    }

    filtered
}

/// Replace every vertical sample below `floor` with the floor value.
pub fn apply_altitude_floor(desired_z: &mut [f64], floor: f64) {
    for z in desired_z.iter_mut() {
        if *z < floor {
            *z = floor;
        }
    }
}

/// Saturate the horizontal reference to the available speed.
///
/// The per-sample motion budget is projected onto the desired direction of
/// motion, so a diagonal move does not get sqrt(2) times the speed of an
/// axis-aligned one.
pub fn filter_reference_xy(
    desired_x: &[f64],
    desired_y: &[f64],
    current_x: f64,
    current_y: f64,
    max_speed_x: f64,
    max_speed_y: f64,
    dt1: f64,
    dt2: f64,
) -> (Vec<f64>, Vec<f64>) {
    debug_assert_eq!(desired_x.len(), desired_y.len());

    let mut filtered_x = Vec::with_capacity(desired_x.len());
    let mut filtered_y = Vec::with_capacity(desired_y.len());
    let mut previous_x = current_x;
    let mut previous_y = current_y;

    for i in 0..desired_x.len() {
        let dt = if i == 0 { dt1 } else { dt2 };
        let mut max_sample_x = max_speed_x * dt;
        let mut max_sample_y = max_speed_y * dt;

        let difference_x = desired_x[i] - previous_x;
        let difference_y = desired_y[i] - previous_y;

        let direction = difference_y.atan2(difference_x);
        let max_dir_sample_x = (max_sample_x * direction.cos()).abs();
        let max_dir_sample_y = (max_sample_y * direction.sin()).abs();

        if max_sample_x > max_dir_sample_x {
            max_sample_x = max_dir_sample_x;
        }
        if max_sample_y > max_dir_sample_y {
            max_sample_y = max_dir_sample_y;
        }

        let next_x = previous_x + difference_x.clamp(-max_sample_x, max_sample_x);
        let next_y = previous_y + difference_y.clamp(-max_sample_y, max_sample_y);

        filtered_x.push(next_x);
        filtered_y.push(next_y);
        previous_x = next_x;
        previous_y = next_y;
    }

    (filtered_x, filtered_y)
}

/// Superimpose the circular wiggle perturbation and advance its phase by one
/// control period.
pub fn apply_wiggle(
    x: &mut [f64],
    y: &mut [f64],
    state: &mut WiggleState,
    amplitude: f64,
    frequency: f64,
    sample_dt: f64,
    dt1: f64,
) {
    for i in 0..x.len() {
        let arg = frequency * TAU * i as f64 * sample_dt + state.phase;
        x[i] += amplitude * arg.cos();
        y[i] += amplitude * arg.sin();
    }

    state.phase += frequency * dt1 * TAU;
    if state.phase > PI {
        state.phase -= TAU;
    }
}

/// Unwrap the heading reference into a sequence continuous with the current
/// plant heading, so the solver never sees a +-pi jump.
pub fn unwrap_heading(desired: &mut [f64], current_heading: f64) {
    if desired.is_empty() {
        return;
    }
    desired[0] = geometry::unwrap(desired[0], current_heading);
    for i in 1..desired.len() {
        desired[i] = geometry::unwrap(desired[i], desired[i - 1]);
    }
}
