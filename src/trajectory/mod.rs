// src/trajectory/mod.rs - time-sampled trajectory store and horizon interpolation

use thiserror::Error;

use crate::geometry;
use crate::types::{ReferencePoint, TrajectoryReference};

/// Sample period assumed for legacy trajectories that do not carry one.
const LEGACY_DT: f64 = 0.2;

#[derive(Debug, Error)]
pub enum TrajectoryError {
    #[error("the trajectory dt ({dt:.3} s) is smaller than the tracker's control period ({dt1:.3} s)")]
    DtTooSmall { dt: f64, dt1: f64 },

    #[error("trajectory timestamp is too old (time difference = {age:.2} s)")]
    TooOld { age: f64 },

    #[error("can not loop trajectory, the first and last points are too far apart ({distance:.2} m)")]
    LoopEndpointsTooFar { distance: f64 },

    #[error("trajectory is empty")]
    Empty,
}

/// An accepted trajectory, split per axis and padded for the horizon.
///
/// Stores are immutable in normal operation and replaced wholesale on each
/// load; the only in-place mutation is the frame-change rewrite.
#[derive(Debug, Clone)]
pub struct TrajectoryStore {
    x: Vec<f64>,
    y: Vec<f64>,
    z: Vec<f64>,
    heading: Vec<f64>,
    /// Number of real samples; the vectors carry `size + horizon` entries.
    size: usize,
    dt: f64,
    looping: bool,
    use_heading: bool,
}

/// Horizon-length reference slice produced by the interpolator.
#[derive(Debug, Clone)]
pub struct HorizonSample {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    pub heading: Vec<f64>,
}

/// Outcome of a successful load.
#[derive(Debug)]
pub struct LoadedTrajectory {
    pub store: TrajectoryStore,
    /// Start tracking immediately.
    pub fly_now: bool,
    /// Initial sub-sample cursor compensating the fractional part of the
    /// trajectory age.
    pub subsample_offset: usize,
}

impl TrajectoryStore {
    /// Validate and ingest a trajectory message.
    ///
    /// `now` is the current time in the same clock as the message stamp and
    /// `current_heading` fills the heading column when the message does not
    /// track heading.
    pub fn load(
        msg: &TrajectoryReference,
        now: f64,
        dt1: f64,
        horizon: usize,
        current_heading: f64,
        loop_endpoint_tolerance: f64,
    ) -> Result<LoadedTrajectory, TrajectoryError> {
        if msg.points.is_empty() {
            return Err(TrajectoryError::Empty);
        }

        let dt = if msg.dt <= 1e-4 {
            tracing::warn!("the trajectory dt was not specified, assuming the legacy {LEGACY_DT} s");
            LEGACY_DT
        } else if msg.dt < dt1 {
            return Err(TrajectoryError::DtTooSmall { dt: msg.dt, dt1 });
        } else {
            msg.dt
        };

        let mut size = msg.points.len();
        let mut sample_offset = 0usize;
        let mut subsample_offset = 0usize;

        // clock-align the start of the trajectory with its stamp
        if msg.fly_now && msg.header_stamp != 0.0 && msg.points.len() > 1 {
            let mut age = now - msg.header_stamp;

            if age < 0.0 {
                tracing::warn!("received trajectory with timestamp in the future by {:.2} s", -age);
                age = 0.0;
            }

            if age > 0.0 {
                sample_offset = (age / dt).floor() as usize;
                subsample_offset = ((age % dt) / dt1).floor() as usize;

                if sample_offset >= size {
                    return Err(TrajectoryError::TooOld { age });
                }

                if age >= dt {
                    size -= sample_offset;
                    tracing::warn!("got trajectory with timestamp {:.2} s in the past", age);
                } else {
                    sample_offset = 0;
                }
            }
        }

        let looping = if msg.looping {
            let first = msg.points[sample_offset];
            let last = msg.points[sample_offset + size - 1];
            let distance =
                geometry::dist_xyz((first.x, first.y, first.z), (last.x, last.y, last.z));
            if distance >= loop_endpoint_tolerance {
                return Err(TrajectoryError::LoopEndpointsTooFar { distance });
            }
            tracing::info!("looping enabled");
            true
        } else {
            false
        };

        let capacity = size + horizon;
        let mut x = Vec::with_capacity(capacity);
        let mut y = Vec::with_capacity(capacity);
        let mut z = Vec::with_capacity(capacity);
        let mut heading = Vec::with_capacity(capacity);

        for point in &msg.points[sample_offset..sample_offset + size] {
            x.push(point.x);
            y.push(point.y);
            z.push(point.z);
            heading.push(if msg.use_heading { point.heading } else { current_heading });
        }

        // pad with the last sample so a finite trajectory ends in a smooth
        // stop; a looping one wraps instead and needs no tail
        for _ in 0..horizon {
            if looping {
                x.push(x[0]);
                y.push(y[0]);
                z.push(z[0]);
                heading.push(heading[0]);
            } else {
                x.push(*x.last().unwrap());
                y.push(*y.last().unwrap());
                z.push(*z.last().unwrap());
                heading.push(*heading.last().unwrap());
            }
        }

        Ok(LoadedTrajectory {
            store: TrajectoryStore {
                x,
                y,
                z,
                heading,
                size,
                dt,
                looping,
                use_heading: msg.use_heading,
            },
            fly_now: msg.fly_now,
            subsample_offset,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    pub fn use_heading(&self) -> bool {
        self.use_heading
    }

    /// The sample at `idx`, clamped into the real range.
    pub fn point(&self, idx: usize) -> ReferencePoint {
        let i = idx.min(self.size - 1);
        ReferencePoint { x: self.x[i], y: self.y[i], z: self.z[i], heading: self.heading[i] }
    }

    /// Interpolate the horizon reference for the current cursor.
    ///
    /// Horizon sample `i` targets trajectory time
    /// `dt1 + i*dt2 + sub_idx*dt1` past the cursor sample; positions are
    /// linearly interpolated, headings along the shorter arc.
    pub fn sample_horizon(
        &self,
        cursor_idx: usize,
        sub_idx: usize,
        dt1: f64,
        dt2: f64,
        horizon: usize,
    ) -> HorizonSample {
        let mut out = HorizonSample {
            x: Vec::with_capacity(horizon),
            y: Vec::with_capacity(horizon),
            z: Vec::with_capacity(horizon),
            heading: Vec::with_capacity(horizon),
        };

        for i in 0..horizon {
            let target_time = dt1 + i as f64 * dt2 + sub_idx as f64 * dt1;

            let mut first_idx = cursor_idx + (target_time / self.dt).floor() as usize;
            let mut second_idx = first_idx + 1;
            let coeff = (target_time / self.dt).fract();

            if self.looping {
                first_idx %= self.size;
                second_idx %= self.size;
            } else {
                first_idx = first_idx.min(self.size - 1);
                second_idx = second_idx.min(self.size - 1);
            }

            out.x.push((1.0 - coeff) * self.x[first_idx] + coeff * self.x[second_idx]);
            out.y.push((1.0 - coeff) * self.y[first_idx] + coeff * self.y[second_idx]);
            out.z.push((1.0 - coeff) * self.z[first_idx] + coeff * self.z[second_idx]);
            out.heading.push(geometry::interp(
                self.heading[first_idx],
                self.heading[second_idx],
                coeff,
            ));
        }

        out
    }

    /// Rewrite every stored sample in place; used by the frame-change
    /// handler while all periodic activity is stopped.
    pub fn for_each_sample_mut(
        &mut self,
        mut f: impl FnMut(&mut f64, &mut f64, &mut f64, &mut f64),
    ) {
        for i in 0..self.x.len() {
            let (mut x, mut y, mut z, mut h) =
                (self.x[i], self.y[i], self.z[i], self.heading[i]);
            f(&mut x, &mut y, &mut z, &mut h);
            self.x[i] = x;
            self.y[i] = y;
            self.z[i] = z;
            self.heading[i] = h;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReferencePoint;

    const DT1: f64 = 0.01;
    const DT2: f64 = 0.2;
    const HORIZON: usize = 10;

    fn line_trajectory(n: usize, dt: f64) -> TrajectoryReference {
        TrajectoryReference {
            header_stamp: 0.0,
            frame_id: "local".into(),
            dt,
            fly_now: true,
            looping: false,
            use_heading: true,
            points: (0..n)
                .map(|i| ReferencePoint { x: i as f64, y: 0.0, z: 2.0, heading: 0.0 })
                .collect(),
        }
    }

    #[test]
    fn test_load_rejects_sub_period_dt() {
        let msg = line_trajectory(10, 0.001);
        let err = TrajectoryStore::load(&msg, 100.0, DT1, HORIZON, 0.0, 3.14).unwrap_err();
        assert!(matches!(err, TrajectoryError::DtTooSmall { .. }));
    }

    #[test]
    fn test_load_rejects_stale_trajectory() {
        let mut msg = line_trajectory(10, 0.2);
        msg.header_stamp = 100.0 - 3.0; // age 3 s -> offset 15 >= 10 samples
        let err = TrajectoryStore::load(&msg, 100.0, DT1, HORIZON, 0.0, 3.14).unwrap_err();
        assert!(err.to_string().contains("too old"));
    }

    #[test]
    fn test_load_drops_elapsed_samples() {
        let mut msg = line_trajectory(10, 0.2);
        msg.header_stamp = 100.0 - 0.5; // age 0.5 s -> 2 whole samples gone
        let loaded = TrajectoryStore::load(&msg, 100.0, DT1, HORIZON, 0.0, 3.14).unwrap();
        assert_eq!(loaded.store.size(), 8);
        assert!((loaded.store.point(0).x - 2.0).abs() < 1e-12);
        // 0.5 = 2*0.2 + 0.1 -> ~10 sub-samples of dt1 (fmod rounding may
        // land one short)
        assert!(loaded.subsample_offset >= 9 && loaded.subsample_offset <= 10);
    }

    #[test]
    fn test_future_stamp_is_treated_as_now() {
        let mut msg = line_trajectory(10, 0.2);
        msg.header_stamp = 100.0 + 5.0;
        let loaded = TrajectoryStore::load(&msg, 100.0, DT1, HORIZON, 0.0, 3.14).unwrap();
        assert_eq!(loaded.store.size(), 10);
        assert_eq!(loaded.subsample_offset, 0);
    }

    #[test]
    fn test_loop_endpoint_check() {
        let mut msg = line_trajectory(10, 0.2);
        msg.looping = true;
        // endpoints are 9 m apart, beyond the tolerance
        let err = TrajectoryStore::load(&msg, 100.0, DT1, HORIZON, 0.0, 3.14).unwrap_err();
        assert!(matches!(err, TrajectoryError::LoopEndpointsTooFar { .. }));

        // a closed square passes
        let mut square = line_trajectory(4, 0.2);
        square.looping = true;
        square.points = vec![
            ReferencePoint { x: 0.0, y: 0.0, z: 2.0, heading: 0.0 },
            ReferencePoint { x: 1.0, y: 0.0, z: 2.0, heading: 0.0 },
            ReferencePoint { x: 1.0, y: 1.0, z: 2.0, heading: 0.0 },
            ReferencePoint { x: 0.1, y: 0.0, z: 2.0, heading: 0.0 },
        ];
        let loaded = TrajectoryStore::load(&square, 100.0, DT1, HORIZON, 0.0, 3.14).unwrap();
        assert!(loaded.store.looping());
    }

    #[test]
    fn test_heading_column_fill() {
        let mut msg = line_trajectory(5, 0.2);
        msg.use_heading = false;
        for p in msg.points.iter_mut() {
            p.heading = 1.0;
        }
        let loaded = TrajectoryStore::load(&msg, 100.0, DT1, HORIZON, 0.7, 3.14).unwrap();
        assert!((loaded.store.point(2).heading - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_horizon_interpolation_between_samples() {
        let msg = line_trajectory(10, 0.2);
        let loaded = TrajectoryStore::load(&msg, 100.0, DT1, HORIZON, 0.0, 3.14).unwrap();

        let sample = loaded.store.sample_horizon(0, 0, DT1, DT2, HORIZON);
        assert_eq!(sample.x.len(), HORIZON);

        // horizon sample 0 targets t = dt1 = 0.01 -> 5 % of the way from
        // sample 0 to sample 1 along a unit-spaced line
        assert!((sample.x[0] - 0.05).abs() < 1e-9);
        // horizon sample 1 targets t = 0.21 -> just past sample 1
        assert!((sample.x[1] - 1.05).abs() < 1e-9);
    }

    #[test]
    fn test_horizon_clamps_at_trajectory_end() {
        let msg = line_trajectory(3, 0.2);
        let loaded = TrajectoryStore::load(&msg, 100.0, DT1, HORIZON, 0.0, 3.14).unwrap();

        let sample = loaded.store.sample_horizon(2, 0, DT1, DT2, HORIZON);
        // everything beyond the last sample holds its value
        assert!(sample.x.iter().all(|x| *x <= 2.0 + 1e-12));
        assert!((sample.x[HORIZON - 1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_horizon_wraps_when_looping() {
        let mut msg = line_trajectory(4, 0.2);
        msg.looping = true;
        msg.points = vec![
            ReferencePoint { x: 0.0, y: 0.0, z: 2.0, heading: 0.0 },
            ReferencePoint { x: 1.0, y: 0.0, z: 2.0, heading: 0.0 },
            ReferencePoint { x: 1.0, y: 1.0, z: 2.0, heading: 0.0 },
            ReferencePoint { x: 0.0, y: 1.0, z: 2.0, heading: 0.0 },
        ];
        let loaded = TrajectoryStore::load(&msg, 100.0, DT1, HORIZON, 0.0, 3.14).unwrap();

        // cursor at the last sample: the horizon reads across the wrap
        let sample = loaded.store.sample_horizon(3, 0, DT1, DT2, 8);
        assert!(sample.x.iter().all(|x| x.is_finite()));
        // interpolation from sample 3 heads back toward sample 0
        assert!(sample.x[0] < 0.1);
    }
}
