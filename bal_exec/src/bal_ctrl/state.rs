//! Implementations for the BalCtrl state structure

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::{debug, info, trace, warn};
use nalgebra::Vector2;
use serde::Serialize;
use std::time::Instant;

// Internal
use super::{BalCtrlError, Params, WalkingPhase, PHASE_TIME_TOLERANCE_S};
use crate::footstep::{Feet, FootPose, Footstep, FootstepPlan, PlanError};
use crate::icp_opt::{
    self, IcpOptInput, IcpOptimizer, OptStatus, SolverSettings, SupportState
};
use crate::traj::{GeneratorParams, ReferenceGenerator, ReferencePoint, TrajError, TrajPoint};
use util::{
    archive::{ArchiveError, Archived, Archiver},
    maths::{clamp, deadband},
    module::State,
    session::Session,
    snapshot::SnapshotReceiver
};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Balance control module state
pub struct BalCtrl {
    params: Params,

    optimizer: IcpOptimizer,

    generator: ReferenceGenerator,

    tuning_rx: Option<SnapshotReceiver<icp_opt::Params>>,
    plan_rx: Option<SnapshotReceiver<FootstepPlan>>,

    /// The plan the step in progress belongs to.
    plan: Option<FootstepPlan>,

    /// A plan which has been received but not yet accepted.
    pending_plan: Option<FootstepPlan>,

    /// Index of the next step to be started.
    next_step_index: usize,

    /// The step in progress, if any.
    current_step: Option<Footstep>,

    phase: WalkingPhase,

    /// Units: seconds
    phase_start_s: f64,

    /// Units: seconds
    phase_duration_s: f64,

    /// Footstep adjustment applied on the last tick of the current step.
    ///
    /// Units: meters
    applied_adjustment_m: Option<Vector2<f64>>,

    /// Last measured ICP.
    ///
    /// Units: meters
    measured_icp_m: Vector2<f64>,

    last_time_s: Option<f64>,

    jitter_sum_s: f64,
    num_jitter_samples: u64,

    pub(crate) report: StatusReport,
    pub(crate) output: BalanceCommand,
    arch: Archiver
}

/// Input data to balance control.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputData {
    /// Time of the state estimate.
    ///
    /// Units: seconds
    pub time_s: f64,

    /// Units: meters,
    /// Frame: World
    pub icp_m: Vector2<f64>,

    /// Units: meters,
    /// Frame: World
    pub com_m: Vector2<f64>,

    /// Units: meters/second,
    /// Frame: World
    pub com_velocity_mps: Vector2<f64>,

    /// Current foot poses.
    pub feet: Feet,

    /// Set when the swing foot has touched down early, or when an external
    /// replan has been requested. Ends the current swing.
    pub replan_requested: bool
}

/// Output command from BalCtrl that the whole body controller must track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceCommand {
    /// Units: seconds
    pub time_s: f64,

    /// Desired CMP, the reference CMP plus the feedback.
    ///
    /// Units: meters,
    /// Frame: World
    pub desired_cmp_m: Vector2<f64>,

    /// Units: meters,
    /// Frame: World
    pub feedback_cmp_delta_m: Vector2<f64>,

    /// Units: meters,
    /// Frame: World
    pub reference_icp_m: Vector2<f64>,

    /// The step being swung, moved to its adjusted location.
    pub adjusted_footstep: Option<Footstep>,

    /// False if this command comes from the fallback path.
    pub feasible: bool,

    pub phase: WalkingPhase
}

/// Status report for BalCtrl processing.
///
/// This is flat so that it can be archived directly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatusReport {
    /// Units: seconds
    pub time_s: f64,

    pub phase: &'static str,

    /// Index of the step in progress, or the next step while standing.
    pub step_index: usize,

    pub feasible: bool,

    pub solver_status: OptStatus,

    /// Units: seconds
    pub solve_time_s: f64,

    /// Units: meters
    pub icp_error_norm_m: f64,

    pub num_ticks: u64,

    /// Number of ticks whose processing took longer than the control period.
    pub num_overruns: u64,

    /// Difference between the spacing of the last two estimates and the
    /// control period.
    ///
    /// Units: seconds
    pub last_jitter_s: f64,

    /// Units: seconds
    pub max_jitter_s: f64,

    /// Units: seconds
    pub mean_jitter_s: f64,

    // ---- FAULT FLAGS ----
    // Set only for the tick on which the fault occurred.

    pub out_of_range: bool,
    pub plan_mismatch: bool,
    pub invalid_plan: bool,
    pub invalid_segment: bool,
    pub invalid_estimate: bool,
    pub params_rejected: bool
}

/// A single row of the balance control archive.
#[derive(Debug, Clone, Copy, Serialize)]
struct ArchiveRecord {
    time_s: f64,
    phase: &'static str,
    step_index: usize,
    measured_icp_x_m: f64,
    measured_icp_y_m: f64,
    reference_icp_x_m: f64,
    reference_icp_y_m: f64,
    desired_cmp_x_m: f64,
    desired_cmp_y_m: f64,
    feedback_x_m: f64,
    feedback_y_m: f64,
    adjusted_step_x_m: f64,
    adjusted_step_y_m: f64,
    feasible: bool,
    solver_status: OptStatus,
    solve_time_s: f64,
    icp_error_norm_m: f64,
    num_overruns: u64,
    max_jitter_s: f64
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl State for BalCtrl {
    type InputData = InputData;
    type OutputData = BalanceCommand;
    type StatusReport = StatusReport;
    type ProcError = BalCtrlError;

    /// Perform cyclic processing of balance control.
    ///
    /// On an invalid estimate a fallback command is produced, available from
    /// `last_output`, and `InvalidEstimate` is returned.
    fn proc(&mut self, input_data: &Self::InputData)
        -> Result<(Self::OutputData, Self::StatusReport), Self::ProcError>
    {
        let tick_start = Instant::now();

        self.report.clear_flags();
        self.update_timing(input_data.time_s);

        if !input_is_finite(input_data) {
            warn!("Non-finite state estimate at {} s, holding previous command", input_data.time_s);
            self.report.invalid_estimate = true;
            self.fallback(input_data.time_s);
            self.finish_tick(tick_start);
            return Err(BalCtrlError::InvalidEstimate(input_data.time_s))
        }

        let time_s = input_data.time_s;
        self.measured_icp_m = input_data.icp_m;

        // ---- PARAMETERS AND PLANS ----

        self.apply_tuning();
        self.receive_plans();

        if !self.generator.is_built() {
            self.enter_standing(time_s, &input_data.feet, self.params.final_transfer_duration_s);
        }

        // ---- PHASE ----

        self.update_phase(input_data);

        // ---- REFERENCE ----

        let reference = self.evaluate_reference(time_s, &input_data.feet);
        let icp_error_m = input_data.icp_m - reference.icp.position_m;

        // ---- OPTIMISATION ----

        let support_pose = self.support_pose(&input_data.feet);
        let time_remaining_s = self.time_remaining_s(time_s);

        let upcoming: &[Footstep] = match (&self.plan, &self.current_step) {
            (Some(plan), Some(step)) if self.is_swinging() => {
                let first = step.step_index.saturating_sub(plan.first_step_index);
                plan.steps.get(first..).unwrap_or(&[])
            },
            _ => &[]
        };

        let opt_input = IcpOptInput {
            icp_error_m,
            ref_icp_velocity_mps: reference.icp.velocity_mps,
            support_yaw_rad: support_pose.yaw_rad,
            support: match self.phase {
                WalkingPhase::SingleSupport { .. } => SupportState::Single,
                _ => SupportState::Double
            },
            time_in_state_s: (time_s - self.phase_start_s).max(0.0),
            state_duration_s: self.phase_duration_s,
            time_remaining_s,
            footsteps: upcoming
        };

        let result = self.optimizer.compute(&opt_input);

        // ---- LIMITS ----

        let feedback_m = self.limit_feedback(&result.solution.feedback_delta_m, &support_pose);
        let adjusted_footstep = if result.feasible {
            self.adjust_footstep(
                result.solution.footstep_deltas_m.first(),
                time_remaining_s,
                &input_data.feet
            )
        }
        else {
            self.decay_footstep()
        };

        self.optimizer.commit(
            feedback_m,
            &result.solution.footstep_deltas_m,
            self.applied_adjustment_m
        );

        // ---- OUTPUT ----

        self.output = BalanceCommand {
            time_s,
            desired_cmp_m: reference.cmp.position_m + feedback_m,
            feedback_cmp_delta_m: feedback_m,
            reference_icp_m: reference.icp.position_m,
            adjusted_footstep,
            feasible: result.feasible,
            phase: self.phase
        };

        self.report.time_s = time_s;
        self.report.phase = self.phase.name();
        self.report.step_index = self.step_index();
        self.report.feasible = result.feasible;
        self.report.solver_status = result.status;
        self.report.solve_time_s = result.solve_time_s;
        self.report.icp_error_norm_m = icp_error_m.norm();

        trace!(
            "BalCtrl output at {:.3} s: cmp {:?}, feedback {:?}, phase {}",
            time_s, self.output.desired_cmp_m, feedback_m, self.phase
        );

        self.finish_tick(tick_start);

        Ok((self.output, self.report))
    }
}

impl Archived for BalCtrl {
    fn write(&mut self) -> Result<(), ArchiveError> {
        let (step_x, step_y) = match self.output.adjusted_footstep {
            Some(s) => (s.pose.position_m[0], s.pose.position_m[1]),
            None => (std::f64::NAN, std::f64::NAN)
        };

        let record = ArchiveRecord {
            time_s: self.output.time_s,
            phase: self.report.phase,
            step_index: self.report.step_index,
            measured_icp_x_m: self.measured_icp_m[0],
            measured_icp_y_m: self.measured_icp_m[1],
            reference_icp_x_m: self.output.reference_icp_m[0],
            reference_icp_y_m: self.output.reference_icp_m[1],
            desired_cmp_x_m: self.output.desired_cmp_m[0],
            desired_cmp_y_m: self.output.desired_cmp_m[1],
            feedback_x_m: self.output.feedback_cmp_delta_m[0],
            feedback_y_m: self.output.feedback_cmp_delta_m[1],
            adjusted_step_x_m: step_x,
            adjusted_step_y_m: step_y,
            feasible: self.output.feasible,
            solver_status: self.report.solver_status,
            solve_time_s: self.report.solve_time_s,
            icp_error_norm_m: self.report.icp_error_norm_m,
            num_overruns: self.report.num_overruns,
            max_jitter_s: self.report.max_jitter_s
        };

        self.arch.serialise(record)
    }
}

impl BalCtrl {
    /// Create a new balance controller.
    ///
    /// # Errors
    /// - If either parameter set is invalid.
    pub fn new(params: Params, opt_params: icp_opt::Params) -> Result<Self, BalCtrlError> {
        params.validate()?;

        let omega_rps = params.omega_rps();

        let optimizer = IcpOptimizer::new(
            opt_params,
            SolverSettings {
                max_solve_time_s: params.max_solve_time_s,
                max_iters: params.max_solver_iters
            },
            omega_rps,
            params.control_dt_s,
            params.fallback_decay
        )?;

        let generator = ReferenceGenerator::new(GeneratorParams {
            spline_type: params.spline_type,
            cop_entry_offset_m: params.cop_entry_offset_m,
            cop_exit_offset_m: params.cop_exit_offset_m,
            standing_hold_duration_s: params.standing_hold_duration_s,
            omega_rps
        });

        Ok(Self {
            params,
            optimizer,
            generator,
            tuning_rx: None,
            plan_rx: None,
            plan: None,
            pending_plan: None,
            next_step_index: 0,
            current_step: None,
            phase: WalkingPhase::DoubleSupport,
            phase_start_s: 0.0,
            phase_duration_s: 0.0,
            applied_adjustment_m: None,
            measured_icp_m: Vector2::zeros(),
            last_time_s: None,
            jitter_sum_s: 0.0,
            num_jitter_samples: 0,
            report: StatusReport::default(),
            output: BalanceCommand::default(),
            arch: Archiver::default()
        })
    }

    /// Receive tuning updates from the given channel.
    pub fn with_tuning_channel(mut self, rx: SnapshotReceiver<icp_opt::Params>) -> Self {
        self.tuning_rx = Some(rx);
        self
    }

    /// Receive footstep plans from the given channel.
    pub fn with_plan_channel(mut self, rx: SnapshotReceiver<FootstepPlan>) -> Self {
        self.plan_rx = Some(rx);
        self
    }

    /// Start archiving into the session's archive directory.
    pub fn init_archive(&mut self, session: &Session) -> Result<(), BalCtrlError> {
        self.arch = Archiver::from_path(session, "bal_ctrl.csv")?;
        Ok(())
    }

    /// Queue a footstep plan, it is considered on the next tick.
    pub fn submit_plan(&mut self, plan: FootstepPlan) {
        self.pending_plan = Some(plan);
    }

    /// Apply a new set of optimisation parameters immediately.
    pub fn set_opt_params(&mut self, params: icp_opt::Params) -> Result<(), BalCtrlError> {
        self.optimizer.set_params(params)?;
        Ok(())
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn opt_params(&self) -> &icp_opt::Params {
        self.optimizer.params()
    }

    pub fn phase(&self) -> WalkingPhase {
        self.phase
    }

    /// The command produced on the last tick, including fallback commands.
    pub fn last_output(&self) -> &BalanceCommand {
        &self.output
    }

    /// The status report of the last tick.
    pub fn last_report(&self) -> &StatusReport {
        &self.report
    }

    /// The reference trajectories.
    pub fn generator(&self) -> &ReferenceGenerator {
        &self.generator
    }

    /// The step in progress.
    pub fn current_step(&self) -> Option<&Footstep> {
        self.current_step.as_ref()
    }

    /// Index of the step in progress, or of the next step while standing.
    pub fn step_index(&self) -> usize {
        self.current_step.map(|s| s.step_index).unwrap_or(self.next_step_index)
    }

    /// Time at which the current swing is due to end.
    pub fn swing_end_time_s(&self) -> Option<f64> {
        match self.phase {
            WalkingPhase::SingleSupport { .. } => Some(self.phase_start_s + self.phase_duration_s),
            _ => None
        }
    }

    /// True if a plan is waiting to be accepted.
    pub fn has_pending_plan(&self) -> bool {
        self.pending_plan.is_some()
    }

    fn is_swinging(&self) -> bool {
        matches!(self.phase, WalkingPhase::SingleSupport { .. })
    }

    /// Take the latest tuning snapshot, if one has been published.
    fn apply_tuning(&mut self) {
        let latest = match self.tuning_rx.as_mut() {
            Some(rx) => rx.latest(),
            None => None
        };

        if let Some(params) = latest {
            match self.optimizer.set_params(params) {
                Ok(()) => info!("Applied new ICP optimisation parameters"),
                Err(e) => {
                    warn!("Rejected ICP optimisation parameters: {}", e);
                    self.report.params_rejected = true;
                }
            }
        }
    }

    /// Take the latest plan, if one has been published.
    fn receive_plans(&mut self) {
        let latest = match self.plan_rx.as_mut() {
            Some(rx) => rx.latest(),
            None => None
        };

        if let Some(plan) = latest {
            self.pending_plan = Some(plan);
        }
    }

    /// Advance the walking phase.
    fn update_phase(&mut self, input: &InputData) {
        let time_s = input.time_s;
        let elapsed_s = time_s - self.phase_start_s;
        let phase_done = elapsed_s >= self.phase_duration_s - PHASE_TIME_TOLERANCE_S;

        match self.phase {
            WalkingPhase::DoubleSupport => self.double_support(time_s, &input.feet),
            WalkingPhase::Transfer { to } => {
                self.defer_pending_plan();

                if phase_done {
                    let swing_s = self.current_step.map(|s| s.swing_duration_s).unwrap_or(0.0);
                    self.set_phase(WalkingPhase::SingleSupport { support: to }, time_s, swing_s);
                }
            },
            WalkingPhase::SingleSupport { .. } => {
                if phase_done || input.replan_requested {
                    if !phase_done {
                        info!("Swing ended early at {:.3} s", time_s);
                    }
                    self.finish_step(time_s);

                    // Double support is passed through on the same tick, the
                    // next step's transfer starts from it
                    self.double_support(time_s, &input.feet);
                }
                else {
                    self.defer_pending_plan();
                }
            }
        }
    }

    /// Double support: accept a pending plan and start its next step, or
    /// keep standing.
    fn double_support(&mut self, time_s: f64, feet: &Feet) {
        self.accept_pending_plan();

        let next = self.plan
            .as_ref()
            .map(|p| (p.get_step(self.next_step_index).copied(), p.final_transfer_duration_s));

        match next {
            Some((Some(step), _)) => self.start_step(time_s, step, feet),
            Some((None, final_transfer_s)) => {
                info!("Plan complete, standing");
                self.plan = None;
                self.enter_standing(time_s, feet, final_transfer_s);
            },
            None => {
                // Keep the standing reference alive
                let horizon_ended = match self.generator.end_time_s() {
                    Some(end_s) => time_s >= end_s,
                    None => true
                };
                if horizon_ended {
                    self.enter_standing(time_s, feet, self.params.final_transfer_duration_s);
                }
            }
        }
    }

    /// Flag a plan which arrived part way through a step, it is retried when
    /// double support is next entered.
    fn defer_pending_plan(&mut self) {
        if let Some(plan) = self.pending_plan.as_ref() {
            if let Err(e) = self.generator.check_plan(plan, self.phase, self.next_step_index) {
                trace!("Deferring plan: {}", e);
                self.report.plan_mismatch = true;
            }
        }
    }

    /// Try to accept the pending plan. A plan which cannot be accepted now is
    /// discarded.
    fn accept_pending_plan(&mut self) {
        let plan = match self.pending_plan.take() {
            Some(p) => p,
            None => return
        };

        match self.generator.check_plan(&plan, self.phase, self.next_step_index) {
            Ok(()) => {
                info!(
                    "Accepted plan of {} steps starting at step {}",
                    plan.steps.len(), plan.first_step_index
                );
                self.plan = Some(plan);
            },
            Err(e @ PlanError::PlanMismatch { .. }) => {
                warn!("Discarding plan: {}", e);
                self.report.plan_mismatch = true;
            },
            Err(e) => {
                warn!("Discarding invalid plan: {}", e);
                self.report.invalid_plan = true;
            }
        }
    }

    /// End the current swing and enter double support.
    fn finish_step(&mut self, time_s: f64) {
        if let Some(step) = self.current_step.take() {
            debug!("Step {} complete at {:.3} s", step.step_index, time_s);
            self.next_step_index = step.step_index + 1;
        }
        self.applied_adjustment_m = None;
        self.optimizer.clear_footsteps();

        self.set_phase(WalkingPhase::DoubleSupport, time_s, 0.0);
    }

    /// Build the trajectories for a step and enter its transfer phase.
    fn start_step(&mut self, time_s: f64, step: Footstep, feet: &Feet) {
        let (next, final_transfer_s) = match self.plan.as_ref() {
            Some(plan) => (
                plan.get_step(step.step_index + 1).copied(),
                plan.final_transfer_duration_s
            ),
            None => (None, self.params.final_transfer_duration_s)
        };

        match self.generator.build_step(
            time_s, &step, next.as_ref(), final_transfer_s, feet, feet.mid_point())
        {
            Ok(()) => {
                let to = step.side.opposite();
                info!("Starting step {}, transferring to {:?}", step.step_index, to);

                self.current_step = Some(step);
                self.applied_adjustment_m = None;
                self.set_phase(WalkingPhase::Transfer { to }, time_s, step.transfer_duration_s);
            },
            Err(e) => {
                warn!("Abandoning plan, step {} cannot be built: {}", step.step_index, e);
                self.report.invalid_segment = true;
                self.plan = None;
                self.current_step = None;
                self.enter_standing(time_s, feet, self.params.final_transfer_duration_s);
            }
        }
    }

    /// Build a standing trajectory and enter double support.
    fn enter_standing(&mut self, time_s: f64, feet: &Feet, transfer_s: f64) {
        let fallback_cop = feet.mid_point();

        if let Err(e) = self.generator.build_standing(
            time_s, self.next_step_index, feet, transfer_s, fallback_cop)
        {
            warn!("Keeping previous reference: {}", e);
            self.report.invalid_segment = true;
        }

        if self.phase != WalkingPhase::DoubleSupport {
            self.set_phase(WalkingPhase::DoubleSupport, time_s, 0.0);
        }
    }

    fn set_phase(&mut self, phase: WalkingPhase, time_s: f64, duration_s: f64) {
        debug!("Phase {} -> {} at {:.3} s", self.phase, phase, time_s);
        self.phase = phase;
        self.phase_start_s = time_s;
        self.phase_duration_s = duration_s;
    }

    /// Evaluate the reference, falling back to the nearest valid time or to
    /// the point between the feet.
    fn evaluate_reference(&mut self, time_s: f64, feet: &Feet) -> ReferencePoint {
        match self.generator.evaluate_clamped(time_s) {
            Ok((point, clamped)) => {
                if clamped {
                    warn!("Reference evaluated out of range at {:.3} s", time_s);
                    self.report.out_of_range = true;
                }
                point
            },
            Err(e) => {
                if let TrajError::Empty = e {
                    warn!("No reference available, holding between the feet");
                }
                self.report.out_of_range = true;

                let rest = TrajPoint {
                    position_m: feet.mid_point(),
                    ..TrajPoint::default()
                };
                ReferencePoint { cop: rest, cmp: rest, icp: rest }
            }
        }
    }

    /// Frame the CMP limits are expressed in.
    fn support_pose(&self, feet: &Feet) -> FootPose {
        match self.phase {
            WalkingPhase::DoubleSupport => feet.mid_pose(),
            WalkingPhase::Transfer { to } => *feet.get(to),
            WalkingPhase::SingleSupport { support } => *feet.get(support)
        }
    }

    /// Time left in the swing, zero outside single support.
    fn time_remaining_s(&self, time_s: f64) -> f64 {
        match self.phase {
            WalkingPhase::SingleSupport { .. } => {
                (self.phase_start_s + self.phase_duration_s - time_s).max(0.0)
            },
            _ => 0.0
        }
    }

    /// Clamp the feedback to the CMP exit limits in the support foot frame.
    fn limit_feedback(&self, feedback_m: &Vector2<f64>, support: &FootPose) -> Vector2<f64> {
        let opt = self.optimizer.params();
        let rot = support.rotation();

        let local = rot.transpose() * feedback_m;
        let limited = Vector2::new(
            clamp(&local[0], &-opt.max_cmp_forward_exit_m, &opt.max_cmp_forward_exit_m),
            clamp(&local[1], &-opt.max_cmp_lateral_exit_m, &opt.max_cmp_lateral_exit_m)
        );

        if limited == local {
            *feedback_m
        }
        else {
            rot * limited
        }
    }

    /// Work out where the swing foot should land this tick.
    ///
    /// The raw adjustment is deadbanded in the footstep frame, held once the
    /// swing is about to end and limited to the reachable region around the
    /// stance foot. Changes smaller than the footstep solution resolution are
    /// not sent.
    fn adjust_footstep(
        &mut self,
        raw_delta_m: Option<&Vector2<f64>>,
        time_remaining_s: f64,
        feet: &Feet
    ) -> Option<Footstep> {
        let step = match (self.is_swinging(), self.current_step) {
            (true, Some(s)) => s,
            _ => return None
        };

        let opt = self.optimizer.params();
        let held = self.applied_adjustment_m.unwrap_or_else(Vector2::zeros);

        let mut adjustment = match raw_delta_m {
            Some(raw) if time_remaining_s >= opt.remaining_time_to_stop_adjusting_s => {
                let rot = step.pose.rotation();
                let local = rot.transpose() * raw;
                rot * Vector2::new(
                    deadband(local[0], opt.forward_adjustment_deadband_m),
                    deadband(local[1], opt.lateral_adjustment_deadband_m)
                )
            },
            _ => held
        };

        if opt.limit_reachability_from_adjustment && adjustment != Vector2::zeros() {
            let stance = feet.get(step.side.opposite());
            let target = step.pose.position_2d() + adjustment;
            let local = stance.point_to_foot(&target);

            let outward = step.side.lateral_sign();
            let limited = Vector2::new(
                clamp(&local[0], &-opt.max_backward_reach_m, &opt.max_forward_reach_m),
                outward * clamp(
                    &(local[1] * outward), &opt.min_lateral_reach_m, &opt.max_lateral_reach_m)
            );

            adjustment = stance.point_to_world(&limited) - step.pose.position_2d();
        }

        if (adjustment - held).norm() < opt.footstep_solution_resolution_m {
            adjustment = held;
        }

        self.applied_adjustment_m = Some(adjustment);

        Some(shift_footstep(step, &adjustment))
    }

    /// Decay the applied footstep adjustment towards the plan, used when no
    /// new solution is available.
    fn decay_footstep(&mut self) -> Option<Footstep> {
        let step = match (self.is_swinging(), self.current_step) {
            (true, Some(s)) => s,
            _ => return None
        };

        let adjustment = self.applied_adjustment_m.unwrap_or_else(Vector2::zeros)
            * self.params.fallback_decay;
        self.applied_adjustment_m = Some(adjustment);

        Some(shift_footstep(step, &adjustment))
    }

    /// Produce a fallback command from the previous one.
    fn fallback(&mut self, time_s: f64) {
        let decayed = self.optimizer.previous().decayed(self.params.fallback_decay);
        let adjusted_footstep = self.decay_footstep();
        self.optimizer.commit(
            decayed.feedback_delta_m,
            &decayed.footstep_deltas_m,
            self.applied_adjustment_m
        );

        let reference_cmp = self.output.desired_cmp_m - self.output.feedback_cmp_delta_m;

        self.output = BalanceCommand {
            time_s: if time_s.is_finite() { time_s } else { self.output.time_s },
            desired_cmp_m: reference_cmp + decayed.feedback_delta_m,
            feedback_cmp_delta_m: decayed.feedback_delta_m,
            adjusted_footstep,
            feasible: false,
            ..self.output
        };

        self.report.feasible = false;
    }

    /// Update the estimate spacing statistics.
    fn update_timing(&mut self, time_s: f64) {
        self.report.num_ticks += 1;

        if let (Some(last_s), true) = (self.last_time_s, time_s.is_finite()) {
            let jitter_s = ((time_s - last_s) - self.params.control_dt_s).abs();
            self.jitter_sum_s += jitter_s;
            self.num_jitter_samples += 1;
            self.report.last_jitter_s = jitter_s;
            self.report.max_jitter_s = self.report.max_jitter_s.max(jitter_s);
            self.report.mean_jitter_s = self.jitter_sum_s / self.num_jitter_samples as f64;
        }

        if time_s.is_finite() {
            self.last_time_s = Some(time_s);
        }
    }

    /// Count the tick as overrun if processing took longer than the control
    /// period.
    fn finish_tick(&mut self, tick_start: Instant) {
        let proc_s = tick_start.elapsed().as_secs_f64();

        if proc_s > self.params.control_dt_s {
            self.report.num_overruns += 1;
            warn!(
                "BalCtrl processing took {:.06} s, over the {:.06} s period",
                proc_s, self.params.control_dt_s
            );
        }
    }
}

impl StatusReport {
    /// Clear the per-tick fault flags, keeping the running statistics.
    fn clear_flags(&mut self) {
        self.out_of_range = false;
        self.plan_mismatch = false;
        self.invalid_plan = false;
        self.invalid_segment = false;
        self.invalid_estimate = false;
        self.params_rejected = false;
    }
}

impl Default for StatusReport {
    fn default() -> Self {
        Self {
            time_s: 0.0,
            phase: WalkingPhase::DoubleSupport.name(),
            step_index: 0,
            feasible: true,
            solver_status: OptStatus::NotRun,
            solve_time_s: 0.0,
            icp_error_norm_m: 0.0,
            num_ticks: 0,
            num_overruns: 0,
            last_jitter_s: 0.0,
            max_jitter_s: 0.0,
            mean_jitter_s: 0.0,
            out_of_range: false,
            plan_mismatch: false,
            invalid_plan: false,
            invalid_segment: false,
            invalid_estimate: false,
            params_rejected: false
        }
    }
}

impl Default for BalanceCommand {
    fn default() -> Self {
        Self {
            time_s: 0.0,
            desired_cmp_m: Vector2::zeros(),
            feedback_cmp_delta_m: Vector2::zeros(),
            reference_icp_m: Vector2::zeros(),
            adjusted_footstep: None,
            feasible: true,
            phase: WalkingPhase::DoubleSupport
        }
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn input_is_finite(input: &InputData) -> bool {
    input.time_s.is_finite()
        && input.icp_m.iter().all(|v| v.is_finite())
        && input.com_m.iter().all(|v| v.is_finite())
        && input.com_velocity_mps.iter().all(|v| v.is_finite())
        && input.feet.is_finite()
}

/// The step moved by a world frame adjustment.
fn shift_footstep(step: Footstep, adjustment_m: &Vector2<f64>) -> Footstep {
    let mut shifted = step;
    shifted.pose.position_m[0] += adjustment_m[0];
    shifted.pose.position_m[1] += adjustment_m[1];
    shifted
}
