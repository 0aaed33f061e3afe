//! ICP optimiser state

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::{trace, warn};
use nalgebra::Vector2;
use std::time::Instant;

// Internal
use super::*;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// The ICP optimiser.
///
/// Owns the tuning parameters, the task buffer and the previously applied
/// solution, which is both the regularisation target and the fallback when a
/// solve fails.
#[derive(Debug)]
pub struct IcpOptimizer {
    params: Params,

    settings: SolverSettings,

    /// Natural frequency of the pendulum.
    ///
    /// Units: 1/seconds
    omega_rps: f64,

    /// Units: seconds
    control_dt_s: f64,

    /// Factor applied to the previous solution when a solve fails.
    fallback_decay: f64,

    tasks: Vec<Task>,

    previous: QpSolution
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl IcpOptimizer {
    /// Create a new optimiser.
    ///
    /// # Errors
    /// - If the parameters are invalid.
    pub fn new(
        params: Params,
        settings: SolverSettings,
        omega_rps: f64,
        control_dt_s: f64,
        fallback_decay: f64
    ) -> Result<Self, ParamsError> {
        params.validate()?;

        let max_steps = params.maximum_number_of_footsteps_to_consider;

        Ok(Self {
            params,
            settings,
            omega_rps,
            control_dt_s,
            fallback_decay,
            // Feedback, its regularisation, two per footstep, relaxation and
            // bounds
            tasks: Vec::with_capacity(4 + 2 * max_steps),
            previous: QpSolution {
                feedback_delta_m: Vector2::zeros(),
                footstep_deltas_m: Vec::with_capacity(max_steps)
            }
        })
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Replace the parameters with a new set.
    ///
    /// # Errors
    /// - If the new set is invalid, in which case the current set is kept.
    pub fn set_params(&mut self, params: Params) -> Result<(), ParamsError> {
        params.validate()?;
        self.params = params;
        Ok(())
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    /// Replace the limits on each solve.
    pub fn set_settings(&mut self, settings: SolverSettings) {
        self.settings = settings;
    }

    /// The previously applied solution.
    pub fn previous(&self) -> &QpSolution {
        &self.previous
    }

    /// The tasks built on the last call to `compute`.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Record the solution which was actually applied this tick (after any
    /// clamping), which becomes the regularisation target and fallback for
    /// the next tick.
    ///
    /// `applied_footstep_m` is the adjustment sent for the step being swung,
    /// it replaces the first solved adjustment.
    pub fn commit(
        &mut self,
        feedback_delta_m: Vector2<f64>,
        footstep_deltas_m: &[Vector2<f64>],
        applied_footstep_m: Option<Vector2<f64>>
    ) {
        self.previous.feedback_delta_m = feedback_delta_m;
        self.previous.footstep_deltas_m.clear();
        self.previous.footstep_deltas_m.extend_from_slice(footstep_deltas_m);

        if let Some(applied) = applied_footstep_m {
            match self.previous.footstep_deltas_m.first_mut() {
                Some(first) => *first = applied,
                None => self.previous.footstep_deltas_m.push(applied)
            }
        }
    }

    /// Forget the footstep adjustments, used when a new step starts.
    pub fn clear_footsteps(&mut self) {
        self.previous.footstep_deltas_m.clear();
    }

    /// Build and solve this tick's QP.
    ///
    /// This never fails: if the solve does not succeed the previous solution,
    /// decayed towards zero, is returned with `feasible` set to false.
    pub fn compute(&mut self, input: &IcpOptInput) -> SolveResult {
        let start = Instant::now();

        let index = build_tasks(
            &self.params,
            input,
            &self.previous,
            self.omega_rps,
            self.control_dt_s,
            &mut self.tasks
        );

        trace!(
            "Built {} tasks over {} footsteps",
            self.tasks.len(), index.num_footsteps
        );

        let problem = QpProblem::assemble(&self.tasks, &index);

        let outcome = problem.solve(&self.settings).and_then(|out| {
            // Budget covers the whole computation, not just the solver
            let elapsed_s = start.elapsed().as_secs_f64();
            if elapsed_s > self.settings.max_solve_time_s {
                Err(SolverError::Timeout {
                    elapsed_s,
                    budget_s: self.settings.max_solve_time_s
                })
            }
            else {
                Ok(out)
            }
        });

        match outcome {
            Ok(out) => {
                let footstep_deltas_m = (0..index.num_footsteps)
                    .map(|i| {
                        let off = index.footstep_offset(i);
                        Vector2::new(out.x[off], out.x[off + 1])
                    })
                    .collect();

                let off = index.feedback_offset();

                SolveResult {
                    solution: QpSolution {
                        feedback_delta_m: Vector2::new(out.x[off], out.x[off + 1]),
                        footstep_deltas_m
                    },
                    feasible: true,
                    status: out.status,
                    solve_time_s: out.solve_time_s
                }
            },
            Err(e) => {
                warn!("ICP optimisation failed, decaying previous solution: {}", e);

                SolveResult {
                    solution: self.previous.decayed(self.fallback_decay),
                    feasible: false,
                    status: OptStatus::from(&e),
                    solve_time_s: start.elapsed().as_secs_f64()
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::footstep::{FootPose, Footstep, RobotSide};
    use approx::assert_relative_eq;

    const OMEGA: f64 = 3.0;
    const DT: f64 = 0.002;

    fn settings() -> SolverSettings {
        SolverSettings {
            max_solve_time_s: 1.0,
            max_iters: 100
        }
    }

    /// Only feedback and the relaxation slack are active.
    fn feedback_only_params() -> Params {
        let mut params = Params::default();
        params.feedback_forward_weight = 1.0;
        params.feedback_lateral_weight = 1.0;
        params.feedback_parallel_gain = 1.0;
        params.feedback_orthogonal_gain = 1.0;
        params.use_feedback_regularization = false;
        params.use_step_adjustment = false;
        params.max_cmp_forward_exit_m = 1.0;
        params.max_cmp_lateral_exit_m = 1.0;
        params
    }

    #[test]
    fn test_feedback_tracks_error() {
        let mut opt = IcpOptimizer::new(feedback_only_params(), settings(), OMEGA, DT, 0.9).unwrap();

        let result = opt.compute(&IcpOptInput::double_support(Vector2::new(0.05, 0.0)));

        assert!(result.feasible);
        assert_relative_eq!(
            result.solution.feedback_delta_m,
            Vector2::new(0.05, 0.0),
            epsilon = 1e-6
        );
        assert!(result.solution.footstep_deltas_m.is_empty());
    }

    #[test]
    fn test_forward_exit_bound() {
        let mut params = feedback_only_params();
        params.max_cmp_forward_exit_m = 0.02;

        let mut opt = IcpOptimizer::new(params, settings(), OMEGA, DT, 0.9).unwrap();
        let result = opt.compute(&IcpOptInput::double_support(Vector2::new(0.05, 0.0)));

        assert!(result.feasible);
        assert_relative_eq!(result.solution.feedback_delta_m[0], 0.02, epsilon = 1e-5);
    }

    #[test]
    fn test_failed_solve_decays_previous() {
        let mut params = feedback_only_params();
        params.use_feedback_regularization = true;

        let budget = SolverSettings {
            max_solve_time_s: 1e-12,
            max_iters: 100
        };
        let mut opt = IcpOptimizer::new(params, budget, OMEGA, DT, 0.9).unwrap();
        opt.commit(Vector2::new(0.04, -0.01), &[Vector2::new(0.1, 0.0)], None);

        let result = opt.compute(&IcpOptInput::double_support(Vector2::new(0.05, 0.0)));

        assert!(!result.feasible);
        assert_eq!(result.status, OptStatus::Timeout);
        assert_relative_eq!(
            result.solution.feedback_delta_m,
            Vector2::new(0.036, -0.009),
            epsilon = 1e-12
        );
        assert_relative_eq!(result.solution.footstep_deltas_m[0], Vector2::new(0.09, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_without_feedback_holds_previous() {
        let mut params = feedback_only_params();
        params.use_feedback = false;

        let mut opt = IcpOptimizer::new(params, settings(), OMEGA, DT, 0.9).unwrap();
        opt.commit(Vector2::new(0.01, 0.0), &[], None);

        let result = opt.compute(&IcpOptInput::double_support(Vector2::new(0.05, 0.0)));

        assert!(result.feasible);
        assert!(!opt.tasks().iter().any(|t| matches!(t, Task::Feedback { .. })));
        assert_relative_eq!(
            result.solution.feedback_delta_m,
            Vector2::new(0.01, 0.0),
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_step_adjustment_takes_error() {
        let mut params = Params::default();
        params.use_feedback_regularization = false;
        params.use_footstep_regularization = false;
        params.max_cmp_forward_exit_m = 0.001;
        params.max_cmp_lateral_exit_m = 0.001;
        params.footstep_forward_weight = 1.0;
        params.footstep_lateral_weight = 1.0;

        let steps = [Footstep {
            step_index: 0,
            side: RobotSide::Left,
            pose: FootPose::new(0.3, 0.1, 0.0),
            swing_duration_s: 0.6,
            transfer_duration_s: 0.2
        }];

        let mut opt = IcpOptimizer::new(params, settings(), OMEGA, DT, 0.9).unwrap();
        let error = Vector2::new(0.05, 0.0);
        let result = opt.compute(&IcpOptInput::single_support(error, &steps, 0.3));

        assert!(result.feasible);
        assert_eq!(result.solution.footstep_deltas_m.len(), 1);

        // With almost no CMP authority the step moves forward, scaled up by
        // the time to touchdown
        let delta = result.solution.footstep_deltas_m[0];
        assert!(delta[0] > 0.05);
        assert!(delta[0] <= error[0] * (OMEGA * 0.3).exp() + 1e-6);
        assert_relative_eq!(delta[1], 0.0, epsilon = 1e-5);
    }

    #[test]
    fn test_commit_applied_footstep() {
        let mut opt = IcpOptimizer::new(Params::default(), settings(), OMEGA, DT, 0.9).unwrap();
        let solved = [Vector2::new(0.08, 0.01), Vector2::new(0.05, 0.0)];

        opt.commit(Vector2::zeros(), &solved, Some(Vector2::new(0.05, 0.0)));
        assert_eq!(opt.previous().footstep_deltas_m, vec![Vector2::new(0.05, 0.0), solved[1]]);

        // Held after the solver stops adjusting the step
        opt.commit(Vector2::zeros(), &[], Some(Vector2::new(0.05, 0.0)));
        assert_eq!(opt.previous().footstep_deltas_m, vec![Vector2::new(0.05, 0.0)]);

        opt.commit(Vector2::zeros(), &solved, None);
        assert_eq!(opt.previous().footstep_deltas_m, solved.to_vec());
    }

    #[test]
    fn test_invalid_params_rejected() {
        let mut opt = IcpOptimizer::new(Params::default(), settings(), OMEGA, DT, 0.9).unwrap();

        let mut bad = Params::default();
        bad.dynamic_relaxation_weight = 0.0;

        assert!(opt.set_params(bad).is_err());
        assert_eq!(opt.params(), &Params::default());
    }
}
