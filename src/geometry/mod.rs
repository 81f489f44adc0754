// src/geometry/mod.rs - circular arithmetic for headings and small distance helpers

use std::f64::consts::{PI, TAU};

use nalgebra::{Vector2, Vector3};

/// Wrap an angle into (-pi, pi].
pub fn wrap(angle: f64) -> f64 {
    let mut a = angle % TAU;
    if a <= -PI {
        a += TAU;
    } else if a > PI {
        a -= TAU;
    }
    a
}

/// Unwrap `angle` so it lies within half a turn of `reference`.
///
/// The result is `angle + k*2pi` for the integer `k` that brings it closest
/// to `reference`; used to hand the MPC a continuous heading sequence across
/// the +-pi seam.
pub fn unwrap(angle: f64, reference: f64) -> f64 {
    reference + wrap(angle - reference)
}

/// Absolute circular distance between two angles, in [0, pi].
pub fn diff(a: f64, b: f64) -> f64 {
    wrap(a - b).abs()
}

/// Interpolate between two angles along the shorter arc.
pub fn interp(from: f64, to: f64, coeff: f64) -> f64 {
    wrap(from + coeff * wrap(to - from))
}

/// Planar distance between two points.
pub fn dist_xy(ax: f64, ay: f64, bx: f64, by: f64) -> f64 {
    Vector2::new(bx - ax, by - ay).norm()
}

/// Euclidean distance between two 3-D points.
pub fn dist_xyz(a: (f64, f64, f64), b: (f64, f64, f64)) -> f64 {
    Vector3::new(b.0 - a.0, b.1 - a.1, b.2 - a.2).norm()
}
