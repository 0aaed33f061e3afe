//! # Reference trajectory module
//!
//! The reference trajectories describe where the CoP and CMP are planned to
//! be over the current and next footstep, as a chain of polynomial segments.
//! The reference ICP is derived from the CMP chain.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod generator;
mod segment;
mod trajectory;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

// Internal
pub use generator::*;
pub use segment::*;
pub use trajectory::*;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Tolerance used when checking that segments chain together in time.
///
/// Units: seconds
pub const CHAIN_TOLERANCE_S: f64 = 1e-9;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A point on a trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrajPoint {
    /// Units: meters
    pub position_m: Vector2<f64>,

    /// Units: meters/second
    pub velocity_mps: Vector2<f64>,

    /// Units: meters/second^2
    pub acceleration_mps2: Vector2<f64>
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// The polynomial order used for every segment of a trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplineType {
    /// Constant velocity between the end points.
    Linear,

    /// Zero velocity at both end points.
    Cubic
}

/// What a trajectory describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrajRole {
    Cop,
    Cmp
}

/// Errors associated with reference trajectories.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrajError {
    #[error(
        "Invalid segment [{t_start_s}, {t_end_s}] s, the trajectory currently \
         ends at {chain_end_s:?} s"
    )]
    InvalidSegment {
        t_start_s: f64,
        t_end_s: f64,
        chain_end_s: Option<f64>
    },

    #[error("Time {time_s} s is outside of the trajectory [{start_s}, {end_s}] s")]
    OutOfRange {
        time_s: f64,
        start_s: f64,
        end_s: f64
    },

    #[error("The trajectory contains no segments")]
    Empty
}
