//! Parameters structure for the ICP optimisation
//!
//! These parameters may be retuned while the controller is running. A new
//! set is validated before it is used, and an invalid set is rejected as a
//! whole.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters for the ICP optimisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Params {

    // ---- FOOTSTEPS ----

    /// Number of footsteps storage is reserved for, and the hard ceiling on
    /// `number_of_footsteps_to_consider`.
    pub maximum_number_of_footsteps_to_consider: usize,

    /// Number of upcoming footsteps (including the one being swung) whose
    /// positions are adjusted by the optimisation.
    pub number_of_footsteps_to_consider: usize,

    // ---- WEIGHTS ----

    /// Weight on adjusting a footstep along the footstep's forward axis.
    pub footstep_forward_weight: f64,

    /// Weight on adjusting a footstep along the footstep's lateral axis.
    pub footstep_lateral_weight: f64,

    /// Weight on changing the footstep adjustment between ticks, before
    /// normalisation by the control period.
    pub footstep_regularization_weight: f64,

    /// Weight on the CMP feedback along the support foot's forward axis.
    pub feedback_forward_weight: f64,

    /// Weight on the CMP feedback along the support foot's lateral axis.
    pub feedback_lateral_weight: f64,

    /// Weight on changing the CMP feedback between ticks, before
    /// normalisation by the control period.
    pub feedback_regularization_weight: f64,

    /// Weight on the slack of the ICP dynamics constraint.
    pub dynamic_relaxation_weight: f64,

    /// Multiplier on the dynamic relaxation weight while both feet are on
    /// the ground.
    pub dynamic_relaxation_double_support_weight_modifier: f64,

    /// Smallest weight any footstep task may have.
    pub minimum_footstep_weight: f64,

    /// Smallest weight the feedback task may have.
    pub minimum_feedback_weight: f64,

    /// Growth of the feedback weight over a state, the weight at the end of
    /// the state is `(1 + multiplier)` times the weight at the start.
    pub feedback_weight_hardening_multiplier: f64,

    // ---- GAINS ----

    /// Feedback gain along the direction of the reference ICP velocity.
    pub feedback_parallel_gain: f64,

    /// Feedback gain across the direction of the reference ICP velocity.
    pub feedback_orthogonal_gain: f64,

    // ---- TOGGLES ----

    pub use_feedback: bool,
    pub use_feedback_regularization: bool,
    pub use_step_adjustment: bool,
    pub use_footstep_regularization: bool,
    pub use_feedback_weight_hardening: bool,

    /// Increase the footstep regularisation weight as the swing runs out of
    /// time.
    pub scale_step_regularization_weight_with_time: bool,

    /// Divide each feedback weight by the feedback gain along its axis, so
    /// that raising the gains does not shift the balance between feedback
    /// and step adjustment.
    pub scale_feedback_weight_with_gain: bool,

    /// Divide the weight of footstep `i` by `i + 1`.
    pub scale_upcoming_step_weights: bool,

    // ---- TIMING ----

    /// Footsteps are not adjusted when less than this time is left in the
    /// swing.
    ///
    /// Units: seconds
    pub minimum_time_remaining_s: f64,

    /// Footstep adjustments are frozen when less than this time is left in
    /// the swing.
    ///
    /// Units: seconds
    pub remaining_time_to_stop_adjusting_s: f64,

    // ---- LIMITS ----

    /// Furthest the CMP may be moved forward (or backward) of the reference
    /// by the feedback, in the support foot frame.
    ///
    /// Units: meters
    pub max_cmp_forward_exit_m: f64,

    /// Furthest the CMP may be moved sideways from the reference by the
    /// feedback, in the support foot frame.
    ///
    /// Units: meters
    pub max_cmp_lateral_exit_m: f64,

    /// Footstep adjustments smaller than this along the footstep's forward
    /// axis are ignored.
    ///
    /// Units: meters
    pub forward_adjustment_deadband_m: f64,

    /// Footstep adjustments smaller than this along the footstep's lateral
    /// axis are ignored.
    ///
    /// Units: meters
    pub lateral_adjustment_deadband_m: f64,

    /// Smallest change in the commanded footstep. A new adjustment closer
    /// than this to the one already commanded is not sent.
    ///
    /// Units: meters
    pub footstep_solution_resolution_m: f64,

    // ---- REACHABILITY ----

    /// Clamp adjusted footsteps into the reachable region around the stance
    /// foot.
    pub limit_reachability_from_adjustment: bool,

    /// Units: meters,
    /// Frame: Stance foot
    pub max_forward_reach_m: f64,

    /// Units: meters,
    /// Frame: Stance foot
    pub max_backward_reach_m: f64,

    /// Smallest distance between the feet, measured outwards from the
    /// stance foot towards the swing side.
    ///
    /// Units: meters,
    /// Frame: Stance foot
    pub min_lateral_reach_m: f64,

    /// Units: meters,
    /// Frame: Stance foot
    pub max_lateral_reach_m: f64
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Reasons a parameter set can be rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParamsError {
    #[error("Parameter {0} must be positive")]
    NotPositive(&'static str),

    #[error("Parameter {0} must not be negative")]
    Negative(&'static str),

    #[error(
        "number_of_footsteps_to_consider ({0}) exceeds \
         maximum_number_of_footsteps_to_consider ({1})"
    )]
    TooManyFootsteps(usize, usize),

    #[error("Reachability limits are inconsistent: {0}")]
    Reachability(&'static str)
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Params {
    /// Check the parameters are consistent and will always produce a
    /// positive-definite problem.
    pub fn validate(&self) -> Result<(), ParamsError> {
        let positive = [
            ("dynamic_relaxation_weight", self.dynamic_relaxation_weight),
            (
                "dynamic_relaxation_double_support_weight_modifier",
                self.dynamic_relaxation_double_support_weight_modifier
            ),
            ("minimum_feedback_weight", self.minimum_feedback_weight),
            ("minimum_footstep_weight", self.minimum_footstep_weight),
            ("feedback_parallel_gain", self.feedback_parallel_gain),
            ("feedback_orthogonal_gain", self.feedback_orthogonal_gain)
        ];

        for &(name, value) in positive.iter() {
            if !(value > 0.0 && value.is_finite()) {
                return Err(ParamsError::NotPositive(name))
            }
        }

        let non_negative = [
            ("footstep_forward_weight", self.footstep_forward_weight),
            ("footstep_lateral_weight", self.footstep_lateral_weight),
            ("footstep_regularization_weight", self.footstep_regularization_weight),
            ("feedback_forward_weight", self.feedback_forward_weight),
            ("feedback_lateral_weight", self.feedback_lateral_weight),
            ("feedback_regularization_weight", self.feedback_regularization_weight),
            ("feedback_weight_hardening_multiplier", self.feedback_weight_hardening_multiplier),
            ("minimum_time_remaining_s", self.minimum_time_remaining_s),
            ("remaining_time_to_stop_adjusting_s", self.remaining_time_to_stop_adjusting_s),
            ("max_cmp_forward_exit_m", self.max_cmp_forward_exit_m),
            ("max_cmp_lateral_exit_m", self.max_cmp_lateral_exit_m),
            ("forward_adjustment_deadband_m", self.forward_adjustment_deadband_m),
            ("lateral_adjustment_deadband_m", self.lateral_adjustment_deadband_m),
            ("footstep_solution_resolution_m", self.footstep_solution_resolution_m)
        ];

        for &(name, value) in non_negative.iter() {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(ParamsError::Negative(name))
            }
        }

        if self.number_of_footsteps_to_consider > self.maximum_number_of_footsteps_to_consider {
            return Err(ParamsError::TooManyFootsteps(
                self.number_of_footsteps_to_consider,
                self.maximum_number_of_footsteps_to_consider
            ))
        }

        if self.limit_reachability_from_adjustment {
            if !(self.max_forward_reach_m >= -self.max_backward_reach_m) {
                return Err(ParamsError::Reachability("forward reach is behind backward reach"))
            }
            if !(self.max_lateral_reach_m >= self.min_lateral_reach_m) {
                return Err(ParamsError::Reachability("max lateral reach is below min lateral reach"))
            }
        }

        Ok(())
    }

    /// Number of footsteps actually considered, given how many steps remain
    /// in the plan.
    pub fn footsteps_to_consider(&self, remaining_steps: usize) -> usize {
        self.number_of_footsteps_to_consider
            .min(self.maximum_number_of_footsteps_to_consider)
            .min(remaining_steps)
    }
}

impl Default for Params {
    fn default() -> Self {
        Self {
            maximum_number_of_footsteps_to_consider: 5,
            number_of_footsteps_to_consider: 1,
            footstep_forward_weight: 20.0,
            footstep_lateral_weight: 20.0,
            footstep_regularization_weight: 0.001,
            feedback_forward_weight: 0.5,
            feedback_lateral_weight: 0.5,
            feedback_regularization_weight: 0.0001,
            dynamic_relaxation_weight: 1000.0,
            dynamic_relaxation_double_support_weight_modifier: 4.0,
            minimum_footstep_weight: 0.0001,
            minimum_feedback_weight: 0.0001,
            feedback_weight_hardening_multiplier: 1.0,
            feedback_parallel_gain: 2.5,
            feedback_orthogonal_gain: 1.5,
            use_feedback: true,
            use_feedback_regularization: true,
            use_step_adjustment: true,
            use_footstep_regularization: true,
            use_feedback_weight_hardening: false,
            scale_step_regularization_weight_with_time: false,
            scale_feedback_weight_with_gain: false,
            scale_upcoming_step_weights: false,
            minimum_time_remaining_s: 0.001,
            remaining_time_to_stop_adjusting_s: 0.05,
            max_cmp_forward_exit_m: 0.05,
            max_cmp_lateral_exit_m: 0.03,
            forward_adjustment_deadband_m: 0.03,
            lateral_adjustment_deadband_m: 0.03,
            footstep_solution_resolution_m: 0.015,
            limit_reachability_from_adjustment: true,
            max_forward_reach_m: 0.5,
            max_backward_reach_m: 0.3,
            min_lateral_reach_m: 0.1,
            max_lateral_reach_m: 0.5
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_params_valid() {
        assert_eq!(Params::default().validate(), Ok(()));
    }

    #[test]
    fn test_invalid_params() {
        let mut params = Params::default();
        params.minimum_feedback_weight = 0.0;
        assert_eq!(params.validate(), Err(ParamsError::NotPositive("minimum_feedback_weight")));

        let mut params = Params::default();
        params.number_of_footsteps_to_consider = 6;
        assert_eq!(params.validate(), Err(ParamsError::TooManyFootsteps(6, 5)));

        let mut params = Params::default();
        params.max_cmp_forward_exit_m = -0.01;
        assert_eq!(params.validate(), Err(ParamsError::Negative("max_cmp_forward_exit_m")));

        let mut params = Params::default();
        params.feedback_lateral_weight = -1.0;
        assert_eq!(params.validate(), Err(ParamsError::Negative("feedback_lateral_weight")));

        let mut params = Params::default();
        params.footstep_solution_resolution_m = std::f64::NAN;
        assert_eq!(params.validate(), Err(ParamsError::Negative("footstep_solution_resolution_m")));

        let mut params = Params::default();
        params.min_lateral_reach_m = 0.6;
        assert!(matches!(params.validate(), Err(ParamsError::Reachability(_))));
    }

    #[test]
    fn test_footsteps_to_consider() {
        let mut params = Params::default();
        params.number_of_footsteps_to_consider = 3;

        assert_eq!(params.footsteps_to_consider(10), 3);
        assert_eq!(params.footsteps_to_consider(2), 2);
        assert_eq!(params.footsteps_to_consider(0), 0);
    }

    #[test]
    fn test_shipped_params_valid() {
        let params: Params = util::params::load_path(
            concat!(env!("CARGO_MANIFEST_DIR"), "/../params/icp_opt.toml")
        ).unwrap();

        assert_eq!(params.validate(), Ok(()));
    }
}
