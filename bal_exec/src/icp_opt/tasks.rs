//! # QP tasks
//!
//! Each task owns a quadratic cost over one block of the decision vector, and
//! optionally some linear constraints over the whole vector. Tasks are built
//! fresh every tick from the parameters and the current tracking state, then
//! summed into one problem by the solver adapter.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::debug;
use nalgebra::{DMatrix, DVector, Matrix2, Vector2};

// Internal
use super::{IcpOptInput, Params, QpIndex, QpSolution, SupportState};
use crate::footstep::yaw_rotation;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Reference ICP speeds below this are treated as zero when splitting the
/// feedback gain into parallel and orthogonal parts.
///
/// Units: meters/second
const MIN_GAIN_DIRECTION_SPEED_MPS: f64 = 1e-6;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Rows of `a x = b` or `a x <= b`, with `a` spanning the full decision
/// vector.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearConstraint {
    pub a: DMatrix<f64>,
    pub b: DVector<f64>
}

/// The contribution of a single task to the QP.
///
/// The cost contribution is `0.5 x_b' quadratic x_b + linear' x_b` where
/// `x_b` is the block of the decision vector starting at `offset`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInput {
    pub offset: usize,
    pub quadratic: DMatrix<f64>,
    pub linear: DVector<f64>,
    pub equality: Option<LinearConstraint>,
    pub inequality: Option<LinearConstraint>
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// A single objective or constraint of the ICP optimisation.
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    /// Drive the CMP feedback towards `gain * icp_error`.
    Feedback {
        weight: Matrix2<f64>,
        gain: Matrix2<f64>,
        icp_error_m: Vector2<f64>
    },

    /// Keep the CMP feedback close to the previous tick's value.
    FeedbackRegularization {
        weight: f64,
        previous_m: Vector2<f64>
    },

    /// Penalise moving footstep `index` away from its planned position.
    Footstep {
        index: usize,
        weight: Matrix2<f64>
    },

    /// Keep the adjustment of footstep `index` close to the previous tick's
    /// value.
    FootstepRegularization {
        index: usize,
        weight: f64,
        previous_m: Vector2<f64>
    },

    /// Slack on the ICP dynamics,
    /// `a_fb cmp_fb + sum_i beta_i gain step_i + slack = gain icp_error`.
    DynamicRelaxation {
        weight: f64,
        feedback_active: bool,
        gain: Matrix2<f64>,
        icp_error_m: Vector2<f64>,
        recursion_multipliers: Vec<f64>
    },

    /// Hard limits on the CMP feedback in the support foot frame.
    CmpExitBounds {
        support_yaw_rad: f64,
        max_forward_m: f64,
        max_lateral_m: f64
    }
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Task {
    /// Short name of the task, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Task::Feedback { .. } => "feedback",
            Task::FeedbackRegularization { .. } => "feedback regularization",
            Task::Footstep { .. } => "footstep",
            Task::FootstepRegularization { .. } => "footstep regularization",
            Task::DynamicRelaxation { .. } => "dynamic relaxation",
            Task::CmpExitBounds { .. } => "CMP exit bounds"
        }
    }

    /// Produce the task's contribution to the QP.
    pub fn input(&self, index: &QpIndex) -> TaskInput {
        match self {
            Task::Feedback { weight, gain, icp_error_m } => TaskInput {
                offset: index.feedback_offset(),
                quadratic: to_dmatrix(weight),
                linear: to_dvector(&(-(weight * gain * icp_error_m))),
                equality: None,
                inequality: None
            },
            Task::FeedbackRegularization { weight, previous_m } => TaskInput {
                offset: index.feedback_offset(),
                quadratic: DMatrix::identity(2, 2) * *weight,
                linear: to_dvector(&(-(*previous_m * *weight))),
                equality: None,
                inequality: None
            },
            Task::Footstep { index: i, weight } => TaskInput {
                offset: index.footstep_offset(*i),
                quadratic: to_dmatrix(weight),
                linear: DVector::zeros(2),
                equality: None,
                inequality: None
            },
            Task::FootstepRegularization { index: i, weight, previous_m } => TaskInput {
                offset: index.footstep_offset(*i),
                quadratic: DMatrix::identity(2, 2) * *weight,
                linear: to_dvector(&(-(*previous_m * *weight))),
                equality: None,
                inequality: None
            },
            Task::DynamicRelaxation {
                weight,
                feedback_active,
                gain,
                icp_error_m,
                recursion_multipliers
            } => {
                let mut a = DMatrix::<f64>::zeros(2, index.size());

                if *feedback_active {
                    a.fixed_view_mut::<2, 2>(0, index.feedback_offset())
                        .copy_from(&Matrix2::identity());
                }
                for (i, beta) in recursion_multipliers.iter().enumerate().take(index.num_footsteps) {
                    a.fixed_view_mut::<2, 2>(0, index.footstep_offset(i))
                        .copy_from(&(gain * *beta));
                }
                a.fixed_view_mut::<2, 2>(0, index.slack_offset())
                    .copy_from(&Matrix2::identity());

                TaskInput {
                    offset: index.slack_offset(),
                    quadratic: DMatrix::identity(2, 2) * *weight,
                    linear: DVector::zeros(2),
                    equality: Some(LinearConstraint {
                        a,
                        b: to_dvector(&(gain * icp_error_m))
                    }),
                    inequality: None
                }
            },
            Task::CmpExitBounds { support_yaw_rad, max_forward_m, max_lateral_m } => {
                let (s, c) = support_yaw_rad.sin_cos();
                let off = index.feedback_offset();

                // Rows of the support foot frame axes, +/- each
                let rows = [
                    ([c, s], *max_forward_m),
                    ([-c, -s], *max_forward_m),
                    ([-s, c], *max_lateral_m),
                    ([s, -c], *max_lateral_m)
                ];

                let mut a = DMatrix::<f64>::zeros(rows.len(), index.size());
                let mut b = DVector::<f64>::zeros(rows.len());
                for (r, (coeffs, limit)) in rows.iter().enumerate() {
                    a[(r, off)] = coeffs[0];
                    a[(r, off + 1)] = coeffs[1];
                    b[r] = *limit;
                }

                TaskInput {
                    offset: off,
                    quadratic: DMatrix::zeros(0, 0),
                    linear: DVector::zeros(0),
                    equality: None,
                    inequality: Some(LinearConstraint { a, b })
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Build the feedback gain matrix.
///
/// The parallel gain acts along the direction of the reference ICP velocity
/// and the orthogonal gain across it. When the reference is (nearly) at rest
/// there is no direction, and the orthogonal gain is used everywhere.
pub fn gain_matrix(
    parallel_gain: f64,
    orthogonal_gain: f64,
    ref_icp_velocity_mps: &Vector2<f64>
) -> Matrix2<f64> {
    let speed = ref_icp_velocity_mps.norm();

    if speed < MIN_GAIN_DIRECTION_SPEED_MPS {
        return Matrix2::identity() * orthogonal_gain
    }

    let dir = ref_icp_velocity_mps / speed;
    let along = dir * dir.transpose();

    along * parallel_gain + (Matrix2::identity() - along) * orthogonal_gain
}

/// Build every active task for this tick.
///
/// # Inputs
/// - `params`: the current optimisation parameters.
/// - `input`: the tracking state for this tick.
/// - `previous`: the previously applied solution, used for regularisation.
/// - `omega_rps`: natural frequency of the pendulum.
/// - `control_dt_s`: control period, used to normalise regularisation.
/// - `tasks`: buffer the tasks are written into, cleared first.
///
/// # Outputs
/// - The index handler describing the decision vector for this tick.
pub fn build_tasks(
    params: &Params,
    input: &IcpOptInput,
    previous: &QpSolution,
    omega_rps: f64,
    control_dt_s: f64,
    tasks: &mut Vec<Task>
) -> QpIndex {
    tasks.clear();

    let gain = gain_matrix(
        params.feedback_parallel_gain,
        params.feedback_orthogonal_gain,
        &input.ref_icp_velocity_mps
    );

    let num_footsteps = num_footsteps_for(params, input);
    let index = QpIndex::new(num_footsteps);

    // ---- FEEDBACK ----

    if params.use_feedback {
        let rot = yaw_rotation(input.support_yaw_rad);
        let mut forward = params.feedback_forward_weight.max(params.minimum_feedback_weight);
        let mut lateral = params.feedback_lateral_weight.max(params.minimum_feedback_weight);

        if params.use_feedback_weight_hardening && input.state_duration_s > 0.0 {
            let progress = (input.time_in_state_s / input.state_duration_s).max(0.0).min(1.0);
            let hardening = 1.0 + params.feedback_weight_hardening_multiplier * progress;
            forward *= hardening;
            lateral *= hardening;
        }

        if params.scale_feedback_weight_with_gain {
            // Gain along each of the support foot's axes
            let axis_gain = rot.transpose() * gain * rot;
            forward /= axis_gain[(0, 0)];
            lateral /= axis_gain[(1, 1)];
        }

        let weight_matrix = rot * Matrix2::new(forward, 0.0, 0.0, lateral) * rot.transpose();

        tasks.push(Task::Feedback {
            weight: weight_matrix,
            gain,
            icp_error_m: input.icp_error_m
        });

        if params.use_feedback_regularization {
            push_if_weighted(tasks, Task::FeedbackRegularization {
                weight: params.feedback_regularization_weight / control_dt_s,
                previous_m: previous.feedback_delta_m
            });
        }
    }
    else {
        // Without feedback the feedback variable is only tied to its previous
        // value, so it must always be regularised.
        tasks.push(Task::FeedbackRegularization {
            weight: (params.feedback_regularization_weight / control_dt_s)
                .max(params.minimum_feedback_weight),
            previous_m: previous.feedback_delta_m
        });
    }

    // ---- FOOTSTEPS ----

    let mut multipliers = Vec::with_capacity(num_footsteps);
    let mut time_to_touchdown_s = input.time_remaining_s;

    for (i, step) in input.footsteps.iter().take(num_footsteps).enumerate() {
        if i > 0 {
            time_to_touchdown_s += step.duration_s();
        }
        multipliers.push((-omega_rps * time_to_touchdown_s).exp());

        let scale = if params.scale_upcoming_step_weights {
            1.0 / (i as f64 + 1.0)
        }
        else {
            1.0
        };
        let forward = (params.footstep_forward_weight * scale).max(params.minimum_footstep_weight);
        let lateral = (params.footstep_lateral_weight * scale).max(params.minimum_footstep_weight);

        let rot = yaw_rotation(step.pose.yaw_rad);
        tasks.push(Task::Footstep {
            index: i,
            weight: rot * Matrix2::new(forward, 0.0, 0.0, lateral) * rot.transpose()
        });

        if params.use_footstep_regularization {
            let mut weight = params.footstep_regularization_weight / control_dt_s;

            if params.scale_step_regularization_weight_with_time {
                let remaining = input.time_remaining_s.max(params.minimum_time_remaining_s);
                if remaining > 0.0 {
                    weight *= input.footsteps[0].swing_duration_s / remaining;
                }
            }

            push_if_weighted(tasks, Task::FootstepRegularization {
                index: i,
                weight,
                previous_m: previous.footstep_deltas_m.get(i).copied().unwrap_or_else(Vector2::zeros)
            });
        }
    }

    // ---- DYNAMICS ----

    let mut relaxation_weight = params.dynamic_relaxation_weight;
    if input.support == SupportState::Double {
        relaxation_weight *= params.dynamic_relaxation_double_support_weight_modifier;
    }

    tasks.push(Task::DynamicRelaxation {
        weight: relaxation_weight,
        feedback_active: params.use_feedback,
        gain,
        icp_error_m: input.icp_error_m,
        recursion_multipliers: multipliers
    });

    tasks.push(Task::CmpExitBounds {
        support_yaw_rad: input.support_yaw_rad,
        max_forward_m: params.max_cmp_forward_exit_m,
        max_lateral_m: params.max_cmp_lateral_exit_m
    });

    index
}

/// Number of footsteps whose positions are optimised this tick.
///
/// Footsteps are only adjusted during a swing with enough time left.
pub fn num_footsteps_for(params: &Params, input: &IcpOptInput) -> usize {
    if !params.use_step_adjustment
        || input.support != SupportState::Single
        || input.time_remaining_s < params.minimum_time_remaining_s
    {
        return 0
    }

    params.footsteps_to_consider(input.footsteps.len())
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Push a regularisation task, unless its weight would make it degenerate.
fn push_if_weighted(tasks: &mut Vec<Task>, task: Task) {
    let weight = match task {
        Task::FeedbackRegularization { weight, .. } => weight,
        Task::FootstepRegularization { weight, .. } => weight,
        _ => 1.0
    };

    if weight > 0.0 && weight.is_finite() {
        tasks.push(task);
    }
    else {
        debug!("Omitting {} task with weight {}", task.name(), weight);
    }
}

fn to_dmatrix(m: &Matrix2<f64>) -> DMatrix<f64> {
    DMatrix::from_column_slice(2, 2, m.as_slice())
}

fn to_dvector(v: &Vector2<f64>) -> DVector<f64> {
    DVector::from_column_slice(v.as_slice())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::footstep::{FootPose, Footstep, RobotSide};
    use approx::assert_relative_eq;

    fn swing_step() -> Footstep {
        Footstep {
            step_index: 0,
            side: RobotSide::Left,
            pose: FootPose::new(0.3, 0.1, 0.0),
            swing_duration_s: 0.6,
            transfer_duration_s: 0.2
        }
    }

    fn count(tasks: &[Task], name: &str) -> usize {
        tasks.iter().filter(|t| t.name() == name).count()
    }

    #[test]
    fn test_gain_matrix() {
        let iso = gain_matrix(2.0, 1.0, &Vector2::zeros());
        assert_relative_eq!(iso, Matrix2::identity());

        let k = gain_matrix(2.0, 1.0, &Vector2::new(0.0, 0.4));
        assert_relative_eq!(k * Vector2::new(0.0, 1.0), Vector2::new(0.0, 2.0), epsilon = 1e-12);
        assert_relative_eq!(k * Vector2::new(1.0, 0.0), Vector2::new(1.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_feedback_task_form() {
        let task = Task::Feedback {
            weight: Matrix2::identity() * 2.0,
            gain: Matrix2::identity() * 1.5,
            icp_error_m: Vector2::new(0.1, -0.2)
        };

        let input = task.input(&QpIndex::new(0));
        assert_eq!(input.offset, 0);
        assert_relative_eq!(input.quadratic, DMatrix::identity(2, 2) * 2.0);
        assert_relative_eq!(input.linear, DVector::from_column_slice(&[-0.3, 0.6]), epsilon = 1e-12);
    }

    #[test]
    fn test_feedback_weights_in_support_frame() {
        let mut params = Params::default();
        params.feedback_forward_weight = 4.0;
        params.feedback_lateral_weight = 1.0;
        params.feedback_parallel_gain = 2.0;
        params.feedback_orthogonal_gain = 1.0;

        // Support foot facing along world y, reference moving forwards
        let mut input = IcpOptInput::double_support(Vector2::new(0.01, 0.0));
        input.support_yaw_rad = std::f64::consts::FRAC_PI_2;
        input.ref_icp_velocity_mps = Vector2::new(0.0, 0.3);

        let feedback_weight = |params: &Params| {
            let mut tasks = Vec::new();
            build_tasks(params, &input, &QpSolution::default(), 3.0, 0.002, &mut tasks);
            match tasks.iter().find(|t| t.name() == "feedback") {
                Some(Task::Feedback { weight, .. }) => *weight,
                _ => panic!("Expected a feedback task")
            }
        };

        assert_relative_eq!(feedback_weight(&params), Matrix2::new(1.0, 0.0, 0.0, 4.0), epsilon = 1e-12);

        // Forward gain is the parallel gain, so the forward weight halves
        params.scale_feedback_weight_with_gain = true;
        assert_relative_eq!(feedback_weight(&params), Matrix2::new(1.0, 0.0, 0.0, 2.0), epsilon = 1e-12);

        // Zero weights are floored rather than dropped
        params.scale_feedback_weight_with_gain = false;
        params.feedback_forward_weight = 0.0;
        params.feedback_lateral_weight = 0.0;
        let floor = params.minimum_feedback_weight;
        assert_relative_eq!(
            feedback_weight(&params),
            Matrix2::new(floor, 0.0, 0.0, floor),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_dynamic_relaxation_constraint() {
        let index = QpIndex::new(1);
        let task = Task::DynamicRelaxation {
            weight: 10.0,
            feedback_active: true,
            gain: Matrix2::identity() * 2.0,
            icp_error_m: Vector2::new(0.05, 0.0),
            recursion_multipliers: vec![0.5]
        };

        let input = task.input(&index);
        assert_eq!(input.offset, index.slack_offset());

        let eq = input.equality.unwrap();
        assert_eq!(eq.a.shape(), (2, 6));
        assert_relative_eq!(eq.a[(0, 0)], 1.0);
        assert_relative_eq!(eq.a[(0, 2)], 1.0);
        assert_relative_eq!(eq.a[(1, 3)], 1.0);
        assert_relative_eq!(eq.a[(0, 4)], 1.0);
        assert_relative_eq!(eq.b, DVector::from_column_slice(&[0.1, 0.0]), epsilon = 1e-12);
    }

    #[test]
    fn test_no_feedback_task_without_feedback() {
        let mut params = Params::default();
        params.use_feedback = false;
        params.feedback_regularization_weight = 0.0;

        let steps = [swing_step()];
        let input = IcpOptInput::single_support(Vector2::new(0.05, 0.0), &steps, 0.3);
        let mut tasks = Vec::new();

        build_tasks(&params, &input, &QpSolution::default(), 3.0, 0.002, &mut tasks);

        assert_eq!(count(&tasks, "feedback"), 0);
        assert_eq!(count(&tasks, "feedback regularization"), 1);

        match tasks.iter().find(|t| t.name() == "feedback regularization") {
            Some(Task::FeedbackRegularization { weight, .. }) => {
                assert_relative_eq!(*weight, params.minimum_feedback_weight)
            },
            _ => panic!("Expected a feedback regularization task")
        }

        match tasks.iter().find(|t| t.name() == "dynamic relaxation") {
            Some(Task::DynamicRelaxation { feedback_active, .. }) => assert!(!feedback_active),
            _ => panic!("Expected a dynamic relaxation task")
        }
    }

    #[test]
    fn test_footstep_task_needs_time_remaining() {
        let params = Params::default();
        let steps = [swing_step()];
        let mut tasks = Vec::new();

        let input = IcpOptInput::single_support(Vector2::zeros(), &steps, 0.3);
        let index = build_tasks(&params, &input, &QpSolution::default(), 3.0, 0.002, &mut tasks);
        assert_eq!(index.num_footsteps, 1);
        assert_eq!(count(&tasks, "footstep"), 1);

        // Just below the minimum there is no footstep task at all
        let input = IcpOptInput::single_support(
            Vector2::zeros(), &steps, params.minimum_time_remaining_s * 0.5);
        let index = build_tasks(&params, &input, &QpSolution::default(), 3.0, 0.002, &mut tasks);
        assert_eq!(index.num_footsteps, 0);
        assert_eq!(count(&tasks, "footstep"), 0);
        assert_eq!(count(&tasks, "footstep regularization"), 0);

        // Step adjustment disabled
        let mut params = Params::default();
        params.use_step_adjustment = false;
        let input = IcpOptInput::single_support(Vector2::zeros(), &steps, 0.3);
        build_tasks(&params, &input, &QpSolution::default(), 3.0, 0.002, &mut tasks);
        assert_eq!(count(&tasks, "footstep"), 0);
    }

    #[test]
    fn test_zero_weight_regularization_omitted() {
        let mut params = Params::default();
        params.feedback_regularization_weight = 0.0;
        params.footstep_regularization_weight = 0.0;

        let steps = [swing_step()];
        let input = IcpOptInput::single_support(Vector2::zeros(), &steps, 0.3);
        let mut tasks = Vec::new();
        build_tasks(&params, &input, &QpSolution::default(), 3.0, 0.002, &mut tasks);

        assert_eq!(count(&tasks, "feedback regularization"), 0);
        assert_eq!(count(&tasks, "footstep regularization"), 0);
        assert_eq!(count(&tasks, "feedback"), 1);
    }

    #[test]
    fn test_footstep_weights_rotate_and_scale() {
        let mut params = Params::default();
        params.footstep_forward_weight = 10.0;
        params.footstep_lateral_weight = 2.0;
        params.number_of_footsteps_to_consider = 2;
        params.scale_upcoming_step_weights = true;

        let mut second = swing_step();
        second.step_index = 1;
        second.side = RobotSide::Right;
        second.pose = FootPose::new(0.6, -0.1, std::f64::consts::FRAC_PI_2);

        let steps = [swing_step(), second];
        let input = IcpOptInput::single_support(Vector2::zeros(), &steps, 0.3);
        let mut tasks = Vec::new();
        let index = build_tasks(&params, &input, &QpSolution::default(), 3.0, 0.002, &mut tasks);
        assert_eq!(index.num_footsteps, 2);

        let weights: Vec<Matrix2<f64>> = tasks
            .iter()
            .filter_map(|t| match t {
                Task::Footstep { weight, .. } => Some(*weight),
                _ => None
            })
            .collect();

        assert_relative_eq!(weights[0], Matrix2::new(10.0, 0.0, 0.0, 2.0), epsilon = 1e-12);
        // Rotated by 90 degrees and halved
        assert_relative_eq!(weights[1], Matrix2::new(1.0, 0.0, 0.0, 5.0), epsilon = 1e-12);

        match tasks.iter().find(|t| t.name() == "dynamic relaxation") {
            Some(Task::DynamicRelaxation { recursion_multipliers, .. }) => {
                assert_relative_eq!(recursion_multipliers[0], (-3.0f64 * 0.3).exp(), epsilon = 1e-12);
                assert_relative_eq!(recursion_multipliers[1], (-3.0f64 * 1.1).exp(), epsilon = 1e-12);
            },
            _ => panic!("Expected a dynamic relaxation task")
        }
    }
}
