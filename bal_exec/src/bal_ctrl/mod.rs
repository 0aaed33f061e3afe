//! # Balance control module
//!
//! Balance control runs once per control tick. It tracks the walking phase,
//! keeps the reference trajectories built for the step in progress, runs the
//! ICP optimisation and emits the desired CMP and adjusted footstep for the
//! whole body controller.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod params;
mod state;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use serde::Serialize;
use std::fmt;

// Internal
use crate::footstep::RobotSide;
use crate::icp_opt;
pub use params::*;
pub use state::*;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Tolerance used when deciding whether a phase has run its full duration.
///
/// Units: seconds
pub const PHASE_TIME_TOLERANCE_S: f64 = 1e-9;

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// The phase of the walking cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WalkingPhase {
    /// Standing with both feet down and no step in progress.
    DoubleSupport,

    /// Both feet down, shifting weight onto the `to` foot before it becomes
    /// the stance foot of the next step.
    Transfer { to: RobotSide },

    /// Standing on the `support` foot while the other swings.
    SingleSupport { support: RobotSide }
}

/// Possible errors that can occur during balance control.
#[derive(Debug, thiserror::Error)]
pub enum BalCtrlError {
    #[error("Invalid balance control parameters: {0}")]
    InvalidParams(String),

    #[error("Invalid ICP optimisation parameters: {0}")]
    InvalidOptParams(#[from] icp_opt::ParamsError),

    #[error("The state estimate at {0} s is not finite")]
    InvalidEstimate(f64),

    #[error("Could not archive balance control data: {0}")]
    ArchiveError(#[from] util::archive::ArchiveError)
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl WalkingPhase {
    /// Short name of the phase, used in archives.
    pub fn name(&self) -> &'static str {
        match self {
            WalkingPhase::DoubleSupport => "DoubleSupport",
            WalkingPhase::Transfer { .. } => "Transfer",
            WalkingPhase::SingleSupport { .. } => "SingleSupport"
        }
    }
}

impl Default for WalkingPhase {
    fn default() -> Self {
        WalkingPhase::DoubleSupport
    }
}

impl fmt::Display for WalkingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalkingPhase::DoubleSupport => write!(f, "DoubleSupport"),
            WalkingPhase::Transfer { to } => write!(f, "Transfer(to {:?})", to),
            WalkingPhase::SingleSupport { support } => write!(f, "SingleSupport(on {:?})", support)
        }
    }
}
