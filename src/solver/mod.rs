// src/solver/mod.rs - per-axis horizon QP producing one snap input

use nalgebra::{DMatrix, DVector, Matrix4, Vector4};

use crate::config::AxisSolverConfig;
use crate::model::AxisState;

/// Weight of the soft penalty that pushes velocity/acceleration/jerk back
/// inside their boxes during refinement.
const STATE_PENALTY: f64 = 1.0e4;

/// Kinematic box for one axis.
///
/// `min_*` are positive magnitudes of the downward/negative bound, so the z
/// axis can carry an asymmetric envelope; symmetric axes set both sides to
/// the same value.
#[derive(Debug, Clone, Copy)]
pub struct AxisLimits {
    pub max_velocity: f64,
    pub min_velocity: f64,
    pub max_acceleration: f64,
    pub min_acceleration: f64,
    pub max_jerk: f64,
    pub min_jerk: f64,
    pub max_snap: f64,
    pub min_snap: f64,
}

impl AxisLimits {
    pub fn symmetric(velocity: f64, acceleration: f64, jerk: f64, snap: f64) -> Self {
        Self {
            max_velocity: velocity,
            min_velocity: velocity,
            max_acceleration: acceleration,
            min_acceleration: acceleration,
            max_jerk: jerk,
            min_jerk: jerk,
            max_snap: snap,
            min_snap: snap,
        }
    }
}

/// Result of one horizon solve.
#[derive(Debug, Clone)]
pub struct SolverSolution {
    /// Snap to apply at the next plant step.
    pub first_input: f64,
    /// Predicted states over the horizon, consistent with the returned
    /// input sequence.
    pub states: Vec<AxisState>,
    /// Refinement iterations spent.
    pub iterations: usize,
    /// False when the iteration budget ran out with state limits still
    /// violated; the result is used anyway (best effort).
    pub converged: bool,
}

/// Horizon QP for a single axis.
///
/// The objective is `sum_k (x_k - r_k)' Q (x_k - r_k) + R u_k^2` over the
/// fixed horizon, with the first stage discretized at the control period and
/// the remaining stages at the horizon spacing. The unconstrained optimum is
/// obtained from a prefactorized normal-equation system; the snap box is
/// enforced by clamping and the state boxes by penalty-gradient refinement
/// within the configured iteration budget.
pub struct AxisSolver {
    horizon: usize,
    q: [f64; 4],
    r: f64,
    max_iterations: usize,
    verbose: bool,

    dt1: f64,
    dt2: f64,

    /// Input-to-state map, (4H x H), lower block triangular.
    s: DMatrix<f64>,
    /// Free-response map, (4H x 4).
    free: DMatrix<f64>,

    chol: nalgebra::Cholesky<f64, nalgebra::Dyn>,
    /// Normal-equation matrix S'QS + R*I, kept for gradient evaluation.
    m: DMatrix<f64>,
    /// Gradient step bound: lambda_max(M) + penalty * sigma_max(S)^2.
    step_bound: f64,
    /// Largest singular value of S squared; Q-independent.
    s_gain_sq: f64,
}

fn transition(dt: f64) -> Matrix4<f64> {
    Matrix4::new(
        1.0, dt, 0.5 * dt * dt, 0.0,
        0.0, 1.0, dt, 0.5 * dt * dt,
        0.0, 0.0, 1.0, dt,
        0.0, 0.0, 0.0, 1.0,
    )
}

fn input_map(dt: f64) -> Vector4<f64> {
    Vector4::new(0.0, 0.0, 0.0, dt)
}

/// Dominant eigenvalue of a symmetric PSD matrix by power iteration.
fn lambda_max(m: &DMatrix<f64>) -> f64 {
    let n = m.nrows();
    let mut v = DVector::from_element(n, 1.0 / (n as f64).sqrt());
    let mut lambda = 0.0;
    for _ in 0..60 {
        let w = m * &v;
        lambda = w.norm();
        if lambda <= f64::EPSILON {
            return 0.0;
        }
        v = w / lambda;
    }
    lambda
}

impl AxisSolver {
    pub fn new(config: &AxisSolverConfig, dt1: f64, dt2: f64, horizon: usize) -> Self {
        let a1 = transition(dt1);
        let a2 = transition(dt2);
        let b1 = input_map(dt1);
        let b2 = input_map(dt2);

        let mut s = DMatrix::zeros(4 * horizon, horizon);
        let mut free = DMatrix::zeros(4 * horizon, 4);

        // propagate stage by stage: column j of S carries A2^(k-1-j) * B_j
        // into the row block of state k
        let mut phi = a1;
        let mut columns: Vec<Vector4<f64>> = vec![b1];
        for k in 0..horizon {
            if k > 0 {
                phi = a2 * phi;
                for col in columns.iter_mut() {
                    *col = a2 * *col;
                }
                columns.push(b2);
            }
            free.view_mut((4 * k, 0), (4, 4)).copy_from(&phi);
            for (j, col) in columns.iter().enumerate() {
                s.view_mut((4 * k, j), (4, 1)).copy_from(col);
            }
        }

        let st_s = s.transpose() * &s;
        let s_gain_sq = lambda_max(&st_s);

        let mut solver = Self {
            horizon,
            q: config.q,
            r: config.r,
            max_iterations: config.max_iterations,
            verbose: config.verbose,
            dt1,
            dt2,
            s,
            free,
            chol: nalgebra::Cholesky::new(DMatrix::identity(horizon, horizon))
                .expect("identity is positive definite"),
            m: DMatrix::zeros(horizon, horizon),
            step_bound: 0.0,
            s_gain_sq,
        };
        solver.rebuild();
        solver
    }

    /// Swap the velocity-error weight (braking vs. cruise).
    ///
    /// Refactorizes the normal equations only when the value actually
    /// changes, so the per-tick cost of the swap is a float compare.
    pub fn set_vel_q(&mut self, q_vel: f64) {
        if (q_vel - self.q[1]).abs() > f64::EPSILON {
            self.q[1] = q_vel;
            self.rebuild();
        }
    }

    fn q_diag(&self) -> DVector<f64> {
        let mut d = DVector::zeros(4 * self.horizon);
        for k in 0..self.horizon {
            for i in 0..4 {
                d[4 * k + i] = self.q[i];
            }
        }
        d
    }

    fn rebuild(&mut self) {
        let q = self.q_diag();
        let mut qs = self.s.clone();
        for (row, weight) in q.iter().enumerate() {
            for v in qs.row_mut(row).iter_mut() {
                *v *= *weight;
            }
        }
        let mut m = self.s.transpose() * qs;
        for i in 0..self.horizon {
            m[(i, i)] += self.r;
        }
        self.chol = nalgebra::Cholesky::new(m.clone())
            .expect("normal-equation matrix is positive definite for R > 0");
        self.step_bound = lambda_max(&m) + STATE_PENALTY * self.s_gain_sq;
        self.m = m;
    }

    fn state_vector(x: &AxisState) -> Vector4<f64> {
        Vector4::new(x.position, x.velocity, x.acceleration, x.jerk)
    }

    fn simulate(&self, initial: &AxisState, u: &DVector<f64>) -> Vec<AxisState> {
        let mut states = Vec::with_capacity(self.horizon);
        let mut x = *initial;
        for k in 0..self.horizon {
            let dt = if k == 0 { self.dt1 } else { self.dt2 };
            x = x.step(u[k], dt);
            states.push(x);
        }
        states
    }

    fn clamp_inputs(u: &mut DVector<f64>, limits: &AxisLimits) {
        for v in u.iter_mut() {
            *v = v.clamp(-limits.min_snap, limits.max_snap);
        }
    }

    /// State-box violations as a 4H vector; zero rows mean feasible.
    fn violations(&self, states: &[AxisState], limits: &AxisLimits) -> (DVector<f64>, bool) {
        let mut w = DVector::zeros(4 * self.horizon);
        let mut any = false;
        for (k, x) in states.iter().enumerate() {
            let entries = [
                (1, x.velocity, limits.max_velocity, limits.min_velocity),
                (2, x.acceleration, limits.max_acceleration, limits.min_acceleration),
                (3, x.jerk, limits.max_jerk, limits.min_jerk),
            ];
            for (i, value, upper, lower) in entries {
                if value > upper {
                    w[4 * k + i] = value - upper;
                    any = true;
                } else if value < -lower {
                    w[4 * k + i] = value + lower;
                    any = true;
                }
            }
        }
        (w, any)
    }

    /// Solve one horizon problem.
    ///
    /// `reference` holds the desired positions at the horizon samples;
    /// velocity, acceleration, and jerk references are zero (braking mode
    /// raises their weight instead of moving the target).
    pub fn solve(
        &self,
        initial: &AxisState,
        reference: &[f64],
        limits: &AxisLimits,
    ) -> SolverSolution {
        debug_assert_eq!(reference.len(), self.horizon);

        let x0 = Self::state_vector(initial);
        let c = &self.free * x0;

        // b = S' Q (r - c)
        let q = self.q_diag();
        let mut d = -c;
        for k in 0..self.horizon {
            d[4 * k] += reference[k];
        }
        d.component_mul_assign(&q);
        let b = self.s.transpose() * d;

        let mut u = self.chol.solve(&b);
        Self::clamp_inputs(&mut u, limits);

        let mut states = self.simulate(initial, &u);
        let mut iterations = 0;
        let mut converged = true;

        loop {
            let (w, violated) = self.violations(&states, limits);
            if !violated {
                break;
            }
            if iterations >= self.max_iterations {
                converged = false;
                break;
            }
            iterations += 1;

            let g = &self.m * &u - &b + STATE_PENALTY * (self.s.transpose() * w);
            u -= g / self.step_bound;
            Self::clamp_inputs(&mut u, limits);
            states = self.simulate(initial, &u);
        }

        if self.verbose {
            tracing::debug!(iterations, converged, "axis solve finished");
        }

        SolverSolution { first_input: u[0], states, iterations, converged }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_solver(max_iterations: usize) -> AxisSolver {
        let config = AxisSolverConfig {
            q: [5000.0, 0.0, 0.0, 0.0],
            r: 500.0,
            max_iterations,
            verbose: false,
        };
        AxisSolver::new(&config, 0.01, 0.2, 20)
    }

    fn wide_limits() -> AxisLimits {
        AxisLimits::symmetric(1e3, 1e3, 1e3, 1e3)
    }

    #[test]
    fn test_hold_produces_zero_input() {
        let solver = test_solver(25);
        let initial = AxisState::at_rest(2.0);
        let reference = vec![2.0; 20];

        let solution = solver.solve(&initial, &reference, &wide_limits());
        assert!(solution.first_input.abs() < 1e-6);
        assert!(solution.converged);
        assert_eq!(solution.states.len(), 20);
        for s in &solution.states {
            assert!((s.position - 2.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_step_reference_pushes_toward_goal() {
        let solver = test_solver(25);
        let initial = AxisState::at_rest(0.0);
        let reference = vec![1.0; 20];

        let solution = solver.solve(&initial, &reference, &wide_limits());
        assert!(solution.first_input > 0.0);
        // the tail of the prediction approaches the reference
        let last = solution.states.last().unwrap();
        assert!(last.position > 0.5);
        assert!(last.is_finite());
    }

    #[test]
    fn test_snap_box_is_hard() {
        let solver = test_solver(25);
        let initial = AxisState::at_rest(0.0);
        let reference = vec![50.0; 20];

        let limits = AxisLimits {
            max_snap: 2.0,
            min_snap: 2.0,
            ..wide_limits()
        };
        let solution = solver.solve(&initial, &reference, &limits);
        assert!(solution.first_input <= 2.0 + 1e-12);
        assert!(solution.first_input >= -2.0 - 1e-12);
    }

    #[test]
    fn test_state_limits_engage_refinement() {
        let solver = test_solver(40);
        let initial = AxisState::at_rest(0.0);
        let reference = vec![100.0; 20];

        let unconstrained = solver.solve(&initial, &reference, &wide_limits());
        let free_peak = unconstrained
            .states
            .iter()
            .map(|s| s.velocity.abs())
            .fold(0.0, f64::max);

        let limits = AxisLimits {
            max_velocity: 1.0,
            min_velocity: 1.0,
            ..wide_limits()
        };
        let limited = solver.solve(&initial, &reference, &limits);
        let limited_peak = limited
            .states
            .iter()
            .map(|s| s.velocity.abs())
            .fold(0.0, f64::max);

        assert!(limited.iterations > 0);
        assert!(limited_peak < free_peak);
    }

    #[test]
    fn test_iteration_budget_is_respected() {
        let solver = test_solver(3);
        let initial = AxisState::at_rest(0.0);
        let reference = vec![1000.0; 20];

        let limits = AxisLimits {
            max_velocity: 0.1,
            min_velocity: 0.1,
            ..wide_limits()
        };
        let solution = solver.solve(&initial, &reference, &limits);
        assert_eq!(solution.iterations, 3);
        assert!(!solution.converged);
        assert!(solution.first_input.is_finite());
    }

    #[test]
    fn test_braking_weight_damps_velocity() {
        let mut solver = test_solver(25);
        let initial = AxisState {
            position: 0.0,
            velocity: 3.0,
            acceleration: 0.0,
            jerk: 0.0,
        };
        let reference = vec![0.0; 20];

        let cruise = solver.solve(&initial, &reference, &wide_limits());
        solver.set_vel_q(8000.0);
        let braking = solver.solve(&initial, &reference, &wide_limits());

        let speed_at = |sol: &SolverSolution, k: usize| sol.states[k].velocity.abs();
        // with the braking weight the velocity collapses faster
        assert!(speed_at(&braking, 5) < speed_at(&cruise, 5));
    }
}
