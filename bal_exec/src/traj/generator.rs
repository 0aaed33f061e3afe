//! # Reference trajectory generator
//!
//! Builds the CoP and CMP reference trajectories for the step being executed
//! and derives the reference ICP from the CMP path.
//!
//! A step is built as three segments:
//!
//! 1. Entry transfer, from the current CoP to the stance foot's entry point.
//! 2. Swing, from the stance foot's entry point to its exit point.
//! 3. Exit transfer, from the stance foot's exit point to the entry point of
//!    the landed swing foot (or to the point between the feet after the last
//!    step of the plan).
//!
//! The ICP follows the linear inverted pendulum, `dxi/dt = omega (xi - cmp)`.
//! Integrating backwards from the end of the CMP path (where the ICP is taken
//! to be at rest on the CMP) gives a closed form for each polynomial segment:
//!
//! ```text
//! P(tau)  = sum_k cmp^(k)(tau) / omega^k
//! xi(tau) = P(tau) + exp(omega (tau - T)) (xi_end - P(T))
//! ```
//!
//! A rebuild changes the end of the CMP path, so on its own the recursion
//! would move the ICP in force at the splice. The first new segment is bent by
//! a cubic `h` which vanishes at both of its ends, chosen so that the ICP
//! starts from the previous reference:
//!
//! ```text
//! xi'(tau)  = xi(tau) + d g(tau),   g(0) = 1, g'(0) = omega, g(T) = g'(T) = 0
//! cmp'(tau) = cmp(tau) + d h(tau),  h = g - g' / omega
//! ```
//!
//! where `d` is the previous reference ICP minus the recursed one at the
//! splice.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::{debug, error, trace};
use nalgebra::Vector2;

// Internal
use super::*;
use crate::bal_ctrl::WalkingPhase;
use crate::footstep::{Feet, FootPose, Footstep, FootstepPlan, PlanError, RobotSide};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Number of segments reserved in each trajectory arena.
const SEGMENT_CAPACITY: usize = 8;

/// ICP offsets at a splice smaller than this are left alone.
///
/// Units: meters
const SPLICE_TOLERANCE_M: f64 = 1e-9;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters of the generator.
#[derive(Debug, Clone, Copy)]
pub struct GeneratorParams {
    pub spline_type: SplineType,

    /// Offset of the CoP entry point from the centre of the stance foot, in
    /// the foot frame. The lateral component is positive towards the inside
    /// of the foot.
    ///
    /// Units: meters
    pub cop_entry_offset_m: [f64; 2],

    /// Offset of the CoP exit point from the centre of the stance foot, in
    /// the foot frame. The lateral component is positive towards the inside
    /// of the foot.
    ///
    /// Units: meters
    pub cop_exit_offset_m: [f64; 2],

    /// Duration of the segment holding the CoP between the feet while
    /// standing.
    ///
    /// Units: seconds
    pub standing_hold_duration_s: f64,

    /// Natural frequency of the inverted pendulum.
    ///
    /// Units: 1/seconds
    pub omega_rps: f64
}

/// The reference CoP, CMP and ICP at a single instant.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReferencePoint {
    pub cop: TrajPoint,
    pub cmp: TrajPoint,
    pub icp: TrajPoint
}

/// Generator owning the reference trajectories.
#[derive(Debug, Clone)]
pub struct ReferenceGenerator {
    params: GeneratorParams,

    cop: ReferenceTrajectory,
    cmp: ReferenceTrajectory,

    /// Reference ICP at the end of each CMP segment.
    icp_end_m: Vec<Vector2<f64>>,

    scratch_cop: ReferenceTrajectory,
    scratch_cmp: ReferenceTrajectory,
    scratch_icp_end_m: Vec<Vector2<f64>>
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl ReferenceGenerator {
    /// Create a new generator with empty trajectories.
    pub fn new(params: GeneratorParams) -> Self {
        let spline = params.spline_type;

        Self {
            params,
            cop: ReferenceTrajectory::new(TrajRole::Cop, spline, SEGMENT_CAPACITY),
            cmp: ReferenceTrajectory::new(TrajRole::Cmp, spline, SEGMENT_CAPACITY),
            icp_end_m: Vec::with_capacity(SEGMENT_CAPACITY),
            scratch_cop: ReferenceTrajectory::new(TrajRole::Cop, spline, SEGMENT_CAPACITY),
            scratch_cmp: ReferenceTrajectory::new(TrajRole::Cmp, spline, SEGMENT_CAPACITY),
            scratch_icp_end_m: Vec::with_capacity(SEGMENT_CAPACITY)
        }
    }

    pub fn params(&self) -> &GeneratorParams {
        &self.params
    }

    /// The CoP reference trajectory.
    pub fn cop(&self) -> &ReferenceTrajectory {
        &self.cop
    }

    /// The CMP reference trajectory.
    pub fn cmp(&self) -> &ReferenceTrajectory {
        &self.cmp
    }

    /// True once a trajectory has been built.
    pub fn is_built(&self) -> bool {
        !self.cmp.is_empty()
    }

    /// End of the planned trajectories.
    pub fn end_time_s(&self) -> Option<f64> {
        self.cmp.end_time_s()
    }

    /// Check whether a new plan can replace the remaining steps.
    ///
    /// A plan is only accepted in double support, which is passed through
    /// between every pair of steps, and must start at the step the
    /// controller expects next.
    ///
    /// # Inputs
    /// - `plan`: the candidate plan.
    /// - `phase`: the current walking phase.
    /// - `expected_step`: index of the next step the controller will start.
    pub fn check_plan(
        &self,
        plan: &FootstepPlan,
        phase: WalkingPhase,
        expected_step: usize
    ) -> Result<(), PlanError> {
        if phase != WalkingPhase::DoubleSupport || plan.first_step_index != expected_step {
            return Err(PlanError::PlanMismatch {
                plan_first_step: plan.first_step_index,
                expected_step,
                phase: format!("{}", phase)
            })
        }

        plan.validate()
    }

    /// Build the standing trajectories, moving the CoP from its current
    /// position to the point between the feet and holding it there.
    ///
    /// # Inputs
    /// - `time_s`: time at which the new trajectory starts.
    /// - `step_index`: index of the next step which will be taken.
    /// - `feet`: current foot poses.
    /// - `transfer_duration_s`: time to shift the CoP between the feet.
    /// - `fallback_cop_m`: CoP to start from if no trajectory exists yet.
    pub fn build_standing(
        &mut self,
        time_s: f64,
        step_index: usize,
        feet: &Feet,
        transfer_duration_s: f64,
        fallback_cop_m: Vector2<f64>
    ) -> Result<(), TrajError> {
        let mid = feet.mid_point();
        let hold_s = self.params.standing_hold_duration_s;

        let result = self.rebuild(time_s, step_index, fallback_cop_m, |traj, t0, cop| {
            let t1 = t0 + transfer_duration_s;
            traj.add_segment(t0, t1, cop, mid)?;
            traj.add_segment(t1, t1 + hold_s, mid, mid)
        });

        match result {
            Ok(()) => debug!("Built standing trajectory at {:.3} s", time_s),
            Err(ref e) => error!("Could not build the standing trajectory: {}", e)
        }

        result
    }

    /// Build the trajectories for a single step.
    ///
    /// # Inputs
    /// - `time_s`: time at which the step's transfer phase starts.
    /// - `step`: the step about to be taken.
    /// - `next_step`: the following step in the plan, if any.
    /// - `final_transfer_duration_s`: duration of the final transfer if this
    ///   is the last step of the plan.
    /// - `feet`: current foot poses.
    /// - `fallback_cop_m`: CoP to start from if no trajectory exists yet.
    pub fn build_step(
        &mut self,
        time_s: f64,
        step: &Footstep,
        next_step: Option<&Footstep>,
        final_transfer_duration_s: f64,
        feet: &Feet,
        fallback_cop_m: Vector2<f64>
    ) -> Result<(), TrajError> {
        let stance_side = step.side.opposite();
        let stance = *feet.get(stance_side);

        let entry = self.cop_point(&stance, stance_side, self.params.cop_entry_offset_m);
        let exit = self.cop_point(&stance, stance_side, self.params.cop_exit_offset_m);

        let (final_point, exit_transfer_s) = match next_step {
            Some(next) => (
                self.cop_point(&step.pose, step.side, self.params.cop_entry_offset_m),
                next.transfer_duration_s
            ),
            None => (
                (stance.position_2d() + step.pose.position_2d()) * 0.5,
                final_transfer_duration_s
            )
        };

        let transfer_s = step.transfer_duration_s;
        let swing_s = step.swing_duration_s;

        let result = self.rebuild(time_s, step.step_index, fallback_cop_m, |traj, t0, cop| {
            let t1 = t0 + transfer_s;
            let t2 = t1 + swing_s;
            traj.add_segment(t0, t1, cop, entry)?;
            traj.add_segment(t1, t2, entry, exit)?;
            traj.add_segment(t2, t2 + exit_transfer_s, exit, final_point)
        });

        match result {
            Ok(()) => debug!(
                "Built trajectory for step {} at {:.3} s, stance foot {:?}",
                step.step_index, time_s, stance_side
            ),
            Err(ref e) => error!(
                "Could not build the trajectory for step {}: {}",
                step.step_index, e
            )
        }

        result
    }

    /// Evaluate the CoP, CMP and ICP references at a time.
    ///
    /// # Errors
    /// - `Empty` if nothing has been built.
    /// - `OutOfRange` if the time is not covered by the trajectories.
    pub fn evaluate(&self, time_s: f64) -> Result<ReferencePoint, TrajError> {
        let idx = self.cmp.segment_index_at(time_s)?;

        let seg = &self.cmp.segments()[idx];

        let point = ReferencePoint {
            cop: self.cop.evaluate_at(time_s)?,
            cmp: seg.evaluate(time_s),
            icp: icp_on_segment(seg, self.icp_end_m[idx], self.params.omega_rps, time_s)
        };

        trace!("Reference at {:.3} s: {:?}", time_s, point);

        Ok(point)
    }

    /// Evaluate the references at the nearest valid time.
    ///
    /// Returns the references and true if the time had to be clamped.
    pub fn evaluate_clamped(&self, time_s: f64) -> Result<(ReferencePoint, bool), TrajError> {
        match self.evaluate(time_s) {
            Ok(p) => Ok((p, false)),
            Err(TrajError::OutOfRange { start_s, end_s, .. }) => {
                let clamped_s = if time_s.is_nan() || time_s < start_s {
                    start_s
                }
                else {
                    end_s
                };
                Ok((self.evaluate(clamped_s)?, true))
            },
            Err(e) => Err(e)
        }
    }

    /// Rebuild the trajectories from `time_s`.
    ///
    /// The current CoP trajectory is copied into scratch storage, truncated at
    /// `time_s` and extended by `build`. The first new segment is then bent
    /// so that the reference ICP carries on from its current value. The new
    /// trajectories only replace the current ones if every segment was added
    /// successfully.
    fn rebuild<F>(
        &mut self,
        time_s: f64,
        step_index: usize,
        fallback_cop_m: Vector2<f64>,
        build: F
    ) -> Result<(), TrajError>
    where
        F: FnOnce(&mut ReferenceTrajectory, f64, Vector2<f64>) -> Result<(), TrajError>
    {
        let start_cop = match self.cop.evaluate_clamped(time_s) {
            Ok((p, _)) => p.position_m,
            Err(_) => fallback_cop_m
        };
        let start_icp = self.evaluate_clamped(time_s).ok().map(|(p, _)| p.icp.position_m);

        self.scratch_cop.copy_from(&self.cop);
        self.scratch_cop.truncate_at(time_s);
        self.scratch_cop.discard_before(time_s);
        self.scratch_cop.set_step_index(step_index);

        // If the old trajectory ended before the new one starts there is
        // nothing worth keeping
        if let Some(end_s) = self.scratch_cop.end_time_s() {
            if end_s < time_s - CHAIN_TOLERANCE_S {
                self.scratch_cop.reset(step_index);
            }
        }

        let first_new = self.scratch_cop.segments().len();

        build(&mut self.scratch_cop, time_s, start_cop)?;

        self.update_scratch_cmp();

        if let Some(xi_0) = start_icp {
            self.splice_icp(first_new, xi_0);
        }

        std::mem::swap(&mut self.cop, &mut self.scratch_cop);
        std::mem::swap(&mut self.cmp, &mut self.scratch_cmp);
        std::mem::swap(&mut self.icp_end_m, &mut self.scratch_icp_end_m);

        Ok(())
    }

    /// Copy the scratch CoP into the scratch CMP and recurse the ICP over it.
    fn update_scratch_cmp(&mut self) {
        // No angular momentum model, the CMP follows the CoP
        self.scratch_cmp.copy_from(&self.scratch_cop);

        compute_icp_boundaries(
            self.scratch_cmp.segments(),
            self.params.omega_rps,
            &mut self.scratch_icp_end_m
        );
    }

    /// Bend scratch segment `idx` so that the ICP at its start is `xi_0`.
    fn splice_icp(&mut self, idx: usize, xi_0: Vector2<f64>) {
        let omega = self.params.omega_rps;

        let (offset, dur_s) = match self.scratch_cmp.segments().get(idx) {
            Some(seg) => {
                let xi = icp_on_segment(seg, self.scratch_icp_end_m[idx], omega, seg.t_start_s);
                (xi_0 - xi.position_m, seg.duration_s())
            },
            None => return
        };

        if offset.norm() <= SPLICE_TOLERANCE_M {
            return
        }

        trace!("Splicing reference ICP, offset {:?}", offset);

        if let Some(seg) = self.scratch_cop.segment_mut(idx) {
            seg.add_cubic(&splice_correction(offset, dur_s, omega));
        }

        self.update_scratch_cmp();
    }

    /// Get a CoP way point on a foot.
    fn cop_point(&self, foot: &FootPose, side: RobotSide, offset_m: [f64; 2]) -> Vector2<f64> {
        // Lateral offsets point to the inside of the foot, which is -y for the
        // left foot and +y for the right.
        let local = Vector2::new(offset_m[0], -side.lateral_sign() * offset_m[1]);
        foot.point_to_world(&local)
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Evaluate the reference ICP on a CMP segment whose end ICP is `xi_end`.
fn icp_on_segment(seg: &Segment, xi_end: Vector2<f64>, omega: f64, time_s: f64) -> TrajPoint {
    let dur_s = seg.duration_s();
    let tau = (time_s - seg.t_start_s).max(0.0).min(dur_s);

    let decay = (omega * (tau - dur_s)).exp();
    let offset = xi_end - pendulum_sum(seg, 0, dur_s, omega);

    TrajPoint {
        position_m: pendulum_sum(seg, 0, tau, omega) + offset * decay,
        velocity_mps: pendulum_sum(seg, 1, tau, omega) + offset * (omega * decay),
        acceleration_mps2: pendulum_sum(seg, 2, tau, omega) + offset * (omega * omega * decay)
    }
}

/// Coefficients of `offset h(tau)`, the CMP correction which moves the ICP
/// at the start of a segment of duration `dur_s` by `offset` and leaves the
/// ICP at its end unchanged.
///
/// With `g = 1 + omega tau + a tau^2 + b tau^3` and `g(T) = g'(T) = 0`,
/// `h = g - g' / omega` has no constant term and vanishes at `T`.
fn splice_correction(offset: Vector2<f64>, dur_s: f64, omega: f64) -> [Vector2<f64>; 4] {
    let wt = omega * dur_s;
    let a = -(3.0 + 2.0 * wt) / dur_s.powi(2);
    let b = (2.0 + wt) / dur_s.powi(3);

    [
        Vector2::zeros(),
        offset * (omega - 2.0 * a / omega),
        offset * (a - 3.0 * b / omega),
        offset * b
    ]
}

/// Compute `sum_k cmp^(k + order)(tau) / omega^k` over the segment's
/// polynomial.
fn pendulum_sum(seg: &Segment, order: usize, tau: f64, omega: f64) -> Vector2<f64> {
    let mut sum = Vector2::zeros();
    let mut scale = 1.0;

    for k in 0..seg.num_coeffs() {
        if k + order >= seg.num_coeffs() {
            break
        }
        sum += seg.derivative(k + order, tau) * scale;
        scale /= omega;
    }

    sum
}

/// Recurse backwards over the CMP segments, computing the ICP at the end of
/// each one.
///
/// The ICP at the end of the last segment is the final CMP point.
fn compute_icp_boundaries(segments: &[Segment], omega: f64, icp_end_m: &mut Vec<Vector2<f64>>) {
    icp_end_m.clear();
    icp_end_m.resize(segments.len(), Vector2::zeros());

    let mut xi_end = match segments.last() {
        Some(s) => s.end_pos_m,
        None => return
    };

    for (i, seg) in segments.iter().enumerate().rev() {
        icp_end_m[i] = xi_end;

        // ICP at the start of this segment is the end of the previous one
        let dur_s = seg.duration_s();
        let p_start = pendulum_sum(seg, 0, 0.0, omega);
        let p_end = pendulum_sum(seg, 0, dur_s, omega);
        xi_end = p_start + (xi_end - p_end) * (-omega * dur_s).exp();
    }
}
