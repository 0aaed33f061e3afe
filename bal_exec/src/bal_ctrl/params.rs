//! Parameters structure for BalCtrl

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::Deserialize;

use super::BalCtrlError;
use crate::traj::SplineType;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters for balance control.
///
/// Unlike the ICP optimisation parameters these are fixed for the life of the
/// controller.
#[derive(Debug, Clone, Deserialize)]
pub struct Params {

    // ---- TIMING ----

    /// Period of the control loop.
    ///
    /// Units: seconds
    pub control_dt_s: f64,

    /// Budget for one ICP optimisation. A solve which takes longer is
    /// treated as failed.
    ///
    /// Units: seconds
    pub max_solve_time_s: f64,

    /// Maximum number of solver iterations per tick.
    pub max_solver_iters: u32,

    /// Factor applied to the previous solution when a solve fails.
    pub fallback_decay: f64,

    // ---- MODEL ----

    /// Height of the centre of mass above the ground.
    ///
    /// Units: meters
    pub com_height_m: f64,

    /// Units: meters/second^2
    pub gravity_mps2: f64,

    // ---- REFERENCE ----

    pub spline_type: SplineType,

    /// CoP entry point in the foot frame, lateral positive towards the inside
    /// of the foot.
    ///
    /// Units: meters
    pub cop_entry_offset_m: [f64; 2],

    /// CoP exit point in the foot frame, lateral positive towards the inside
    /// of the foot.
    ///
    /// Units: meters
    pub cop_exit_offset_m: [f64; 2],

    /// Time to shift the CoP between the feet when coming to a stand without
    /// a plan.
    ///
    /// Units: seconds
    pub final_transfer_duration_s: f64,

    /// Length of the hold segment appended to standing trajectories.
    ///
    /// Units: seconds
    pub standing_hold_duration_s: f64
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Params {
    /// Natural frequency of the linear inverted pendulum.
    ///
    /// Units: 1/seconds
    pub fn omega_rps(&self) -> f64 {
        (self.gravity_mps2 / self.com_height_m).sqrt()
    }

    /// Check the parameters are usable.
    pub fn validate(&self) -> Result<(), BalCtrlError> {
        let positive = [
            ("control_dt_s", self.control_dt_s),
            ("max_solve_time_s", self.max_solve_time_s),
            ("com_height_m", self.com_height_m),
            ("gravity_mps2", self.gravity_mps2),
            ("final_transfer_duration_s", self.final_transfer_duration_s),
            ("standing_hold_duration_s", self.standing_hold_duration_s)
        ];

        for &(name, value) in positive.iter() {
            if !(value > 0.0 && value.is_finite()) {
                return Err(BalCtrlError::InvalidParams(format!("{} must be positive", name)))
            }
        }

        if !(self.fallback_decay >= 0.0 && self.fallback_decay <= 1.0) {
            return Err(BalCtrlError::InvalidParams(
                String::from("fallback_decay must be between 0 and 1")))
        }

        if self.max_solver_iters == 0 {
            return Err(BalCtrlError::InvalidParams(
                String::from("max_solver_iters must be at least 1")))
        }

        Ok(())
    }
}

impl Default for Params {
    fn default() -> Self {
        Self {
            control_dt_s: 0.002,
            max_solve_time_s: 0.0015,
            max_solver_iters: 50,
            fallback_decay: 0.9,
            com_height_m: 0.8,
            gravity_mps2: 9.81,
            spline_type: SplineType::Cubic,
            cop_entry_offset_m: [-0.02, 0.01],
            cop_exit_offset_m: [0.04, 0.0],
            final_transfer_duration_s: 0.5,
            standing_hold_duration_s: 1.0
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_omega() {
        let params = Params {
            com_height_m: 1.0,
            gravity_mps2: 9.0,
            ..Params::default()
        };
        assert_relative_eq!(params.omega_rps(), 3.0);
    }

    #[test]
    fn test_validate() {
        assert!(Params::default().validate().is_ok());

        let params = Params {
            fallback_decay: 1.5,
            ..Params::default()
        };
        assert!(matches!(params.validate(), Err(BalCtrlError::InvalidParams(_))));

        let params = Params {
            control_dt_s: 0.0,
            ..Params::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_shipped_params_valid() {
        let params: Params = util::params::load_path(
            concat!(env!("CARGO_MANIFEST_DIR"), "/../params/bal_ctrl.toml")
        ).unwrap();

        assert!(params.validate().is_ok());
    }
}
