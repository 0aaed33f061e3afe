//! # ICP optimisation module
//!
//! Each tick the ICP optimisation finds a CMP feedback offset and, during a
//! swing, adjustments to the upcoming footsteps which drive the measured ICP
//! back onto its reference.
//!
//! The decision vector of one solve is laid out as
//!
//! ```text
//! [ cmp_fb (2) | step_0 (2) | ... | step_{N-1} (2) | slack (2) ]
//! ```

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod params;
mod solver;
mod state;
mod tasks;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use nalgebra::Vector2;
use serde::Serialize;

// Internal
use crate::footstep::Footstep;
pub use params::*;
pub use solver::*;
pub use state::*;
pub use tasks::*;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Describes where each group of variables lives in the decision vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpIndex {
    /// Number of footsteps being adjusted.
    pub num_footsteps: usize
}

/// Tracking state for one tick of the optimisation.
#[derive(Debug, Clone, Copy)]
pub struct IcpOptInput<'a> {
    /// Measured ICP minus reference ICP.
    ///
    /// Units: meters
    pub icp_error_m: Vector2<f64>,

    /// Units: meters/second
    pub ref_icp_velocity_mps: Vector2<f64>,

    /// Heading of the support frame the CMP limits are expressed in.
    ///
    /// Units: radians
    pub support_yaw_rad: f64,

    pub support: SupportState,

    /// Units: seconds
    pub time_in_state_s: f64,

    /// Units: seconds
    pub state_duration_s: f64,

    /// Time left until the end of the current swing.
    ///
    /// Units: seconds
    pub time_remaining_s: f64,

    /// The step currently being swung followed by the upcoming steps.
    pub footsteps: &'a [Footstep]
}

/// The variables of a solve that are kept between ticks.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QpSolution {
    /// Units: meters
    pub feedback_delta_m: Vector2<f64>,

    /// Units: meters
    pub footstep_deltas_m: Vec<Vector2<f64>>
}

/// The result of one tick of the optimisation.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveResult {
    pub solution: QpSolution,

    /// False if the solve failed and `solution` is a decayed copy of the
    /// previous one.
    pub feasible: bool,

    pub status: OptStatus,

    /// Units: seconds
    pub solve_time_s: f64
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Which feet are on the ground.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportState {
    Double,
    Single
}

/// Outcome of a solve, as reported in the status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OptStatus {
    NotRun,
    Solved,
    AlmostSolved,
    Infeasible,
    NotConverged,
    Timeout,
    NumericalFailure
}

/// Errors which can occur while solving the QP.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SolverError {
    #[error("The QP is infeasible: {0}")]
    Infeasible(String),

    #[error("Numerical failure while solving the QP: {0}")]
    NumericalFailure(String),

    #[error("QP solve took {elapsed_s:.06} s, over the {budget_s:.06} s budget")]
    Timeout {
        elapsed_s: f64,
        budget_s: f64
    },

    #[error("The QP did not converge within {0} iterations")]
    NotConverged(u32),

    #[error("Could not set up the QP solver: {0}")]
    Setup(String)
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl QpIndex {
    pub fn new(num_footsteps: usize) -> Self {
        Self { num_footsteps }
    }

    pub fn feedback_offset(&self) -> usize {
        0
    }

    pub fn footstep_offset(&self, i: usize) -> usize {
        2 + 2 * i
    }

    pub fn slack_offset(&self) -> usize {
        2 + 2 * self.num_footsteps
    }

    /// Total number of decision variables.
    pub fn size(&self) -> usize {
        4 + 2 * self.num_footsteps
    }
}

impl<'a> IcpOptInput<'a> {
    /// Input for a swing with `time_remaining_s` left and the ICP reference
    /// at rest.
    pub fn single_support(
        icp_error_m: Vector2<f64>,
        footsteps: &'a [Footstep],
        time_remaining_s: f64
    ) -> Self {
        let state_duration_s = footsteps
            .first()
            .map(|s| s.swing_duration_s)
            .unwrap_or(time_remaining_s);

        Self {
            icp_error_m,
            ref_icp_velocity_mps: Vector2::zeros(),
            support_yaw_rad: 0.0,
            support: SupportState::Single,
            time_in_state_s: (state_duration_s - time_remaining_s).max(0.0),
            state_duration_s,
            time_remaining_s,
            footsteps
        }
    }

    /// Input for double support with the ICP reference at rest.
    pub fn double_support(icp_error_m: Vector2<f64>) -> Self {
        Self {
            icp_error_m,
            ref_icp_velocity_mps: Vector2::zeros(),
            support_yaw_rad: 0.0,
            support: SupportState::Double,
            time_in_state_s: 0.0,
            state_duration_s: 0.0,
            time_remaining_s: 0.0,
            footsteps: &[]
        }
    }
}

impl QpSolution {
    /// Scale every component towards zero.
    pub fn decayed(&self, factor: f64) -> Self {
        Self {
            feedback_delta_m: self.feedback_delta_m * factor,
            footstep_deltas_m: self.footstep_deltas_m.iter().map(|d| d * factor).collect()
        }
    }
}

impl Default for OptStatus {
    fn default() -> Self {
        OptStatus::NotRun
    }
}

impl From<&SolverError> for OptStatus {
    fn from(e: &SolverError) -> Self {
        match e {
            SolverError::Infeasible(_) => OptStatus::Infeasible,
            SolverError::NumericalFailure(_) | SolverError::Setup(_) => OptStatus::NumericalFailure,
            SolverError::Timeout { .. } => OptStatus::Timeout,
            SolverError::NotConverged(_) => OptStatus::NotConverged
        }
    }
}
