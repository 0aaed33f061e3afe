//! # Balance library.
//!
//! This library allows other crates in the workspace (and the integration
//! tests) to access items defined inside the balance executable.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Balance control - the per-tick phase state machine driving the whole controller
pub mod bal_ctrl;

/// Footsteps and footstep plans
pub mod footstep;

/// ICP optimisation - builds and solves the feedback/footstep adjustment QP
pub mod icp_opt;

/// Linear inverted pendulum model, used as a stand-in plant
pub mod lipm;

/// Reference trajectories - CoP, CMP and ICP references built from the footstep plan
pub mod traj;
