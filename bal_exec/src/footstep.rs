//! # Footsteps and footstep plans
//!
//! A footstep plan is produced by an external planner and pushed into the
//! balance controller. The controller consumes the plan one step at a time,
//! the step currently being executed never changes, but the remaining steps
//! may be replaced wholesale by a new plan at a step boundary.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use nalgebra::{Matrix2, Vector2, Vector3};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Pose of a foot on the ground.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FootPose {
    /// Position of the sole centre.
    ///
    /// Units: meters,
    /// Frame: World
    pub position_m: Vector3<f64>,

    /// Heading of the foot about the world Z axis.
    ///
    /// Units: radians
    pub yaw_rad: f64
}

/// A single planned footstep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Footstep {
    /// Index of this step in the overall walking sequence.
    pub step_index: usize,

    /// The side of the foot which swings and is placed by this step.
    pub side: RobotSide,

    /// Target pose of the swing foot.
    pub pose: FootPose,

    /// Duration of the single support phase for this step.
    ///
    /// Units: seconds
    pub swing_duration_s: f64,

    /// Duration of the double support (transfer) phase which precedes the
    /// swing.
    ///
    /// Units: seconds
    pub transfer_duration_s: f64
}

/// The current pose of both feet, as reported by the state estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Feet {
    pub left: FootPose,
    pub right: FootPose
}

/// An ordered list of upcoming footsteps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootstepPlan {
    /// Step index of the first footstep in `steps`.
    pub first_step_index: usize,

    /// The footsteps, in execution order.
    pub steps: Vec<Footstep>,

    /// Time taken to shift the CoP back to the centre of the feet after the
    /// last step.
    ///
    /// Units: seconds
    pub final_transfer_duration_s: f64
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// The side of the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RobotSide {
    Left,
    Right
}

/// Errors describing why a footstep plan cannot be used.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    /// The plan starts at a step other than the one the controller expects
    /// next, or was delivered while a step was in progress.
    #[error(
        "Plan starting at step {plan_first_step} does not match the expected \
         step {expected_step} in phase {phase}"
    )]
    PlanMismatch {
        plan_first_step: usize,
        expected_step: usize,
        phase: String
    },

    /// The plan contains no footsteps.
    #[error("Footstep plan is empty")]
    EmptyPlan,

    /// A step in the plan has a non-positive duration or is out of sequence.
    #[error("Footstep {0} of the plan is invalid: {1}")]
    InvalidStep(usize, &'static str)
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl RobotSide {
    /// Get the other side of the robot.
    pub fn opposite(self) -> Self {
        match self {
            RobotSide::Left => RobotSide::Right,
            RobotSide::Right => RobotSide::Left
        }
    }

    /// Sign of the lateral axis pointing away from the robot's centre on this
    /// side, +1 for left and -1 for right.
    pub fn lateral_sign(self) -> f64 {
        match self {
            RobotSide::Left => 1.0,
            RobotSide::Right => -1.0
        }
    }
}

impl FootPose {
    /// Create a new pose from a planar position and heading.
    pub fn new(x_m: f64, y_m: f64, yaw_rad: f64) -> Self {
        Self {
            position_m: Vector3::new(x_m, y_m, 0.0),
            yaw_rad
        }
    }

    /// The planar position of the foot.
    pub fn position_2d(&self) -> Vector2<f64> {
        self.position_m.xy()
    }

    /// Rotation from the foot frame into the world frame (about Z).
    pub fn rotation(&self) -> Matrix2<f64> {
        yaw_rotation(self.yaw_rad)
    }

    /// Transform a point given in the foot frame into the world frame.
    pub fn point_to_world(&self, point_foot: &Vector2<f64>) -> Vector2<f64> {
        self.position_2d() + self.rotation() * point_foot
    }

    /// Transform a world point into the foot frame.
    pub fn point_to_foot(&self, point_world: &Vector2<f64>) -> Vector2<f64> {
        self.rotation().transpose() * (point_world - self.position_2d())
    }

    /// True if all components are finite.
    pub fn is_finite(&self) -> bool {
        self.position_m.iter().all(|v| v.is_finite()) && self.yaw_rad.is_finite()
    }
}

impl Feet {
    /// Get the pose of the foot on the given side.
    pub fn get(&self, side: RobotSide) -> &FootPose {
        match side {
            RobotSide::Left => &self.left,
            RobotSide::Right => &self.right
        }
    }

    /// Set the pose of the foot on the given side.
    pub fn set(&mut self, side: RobotSide, pose: FootPose) {
        match side {
            RobotSide::Left => self.left = pose,
            RobotSide::Right => self.right = pose
        }
    }

    /// Point halfway between the two feet.
    pub fn mid_point(&self) -> Vector2<f64> {
        (self.left.position_2d() + self.right.position_2d()) * 0.5
    }

    /// Pose halfway between the two feet, with the mean heading.
    pub fn mid_pose(&self) -> FootPose {
        let mid = self.mid_point();

        // Average the headings on the circle so that +pi/-pi don't cancel
        let (s, c) = (
            self.left.yaw_rad.sin() + self.right.yaw_rad.sin(),
            self.left.yaw_rad.cos() + self.right.yaw_rad.cos()
        );

        FootPose::new(mid[0], mid[1], s.atan2(c))
    }

    pub fn is_finite(&self) -> bool {
        self.left.is_finite() && self.right.is_finite()
    }
}

impl Footstep {
    /// Total duration of the step (transfer then swing).
    pub fn duration_s(&self) -> f64 {
        self.transfer_duration_s + self.swing_duration_s
    }
}

impl FootstepPlan {
    /// Check that the plan is usable.
    ///
    /// Steps must be contiguous from `first_step_index`, and every duration
    /// must be positive.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::EmptyPlan)
        }

        for (i, step) in self.steps.iter().enumerate() {
            if step.step_index != self.first_step_index + i {
                return Err(PlanError::InvalidStep(i, "step index out of sequence"))
            }
            if !(step.swing_duration_s > 0.0) {
                return Err(PlanError::InvalidStep(i, "swing duration must be positive"))
            }
            if !(step.transfer_duration_s > 0.0) {
                return Err(PlanError::InvalidStep(i, "transfer duration must be positive"))
            }
            if !step.pose.is_finite() {
                return Err(PlanError::InvalidStep(i, "pose is not finite"))
            }
        }

        if !(self.final_transfer_duration_s > 0.0) {
            return Err(PlanError::InvalidStep(
                self.steps.len() - 1, "final transfer duration must be positive"))
        }

        Ok(())
    }

    /// Get the footstep with the given step index, if it is part of this plan.
    pub fn get_step(&self, step_index: usize) -> Option<&Footstep> {
        step_index
            .checked_sub(self.first_step_index)
            .and_then(|i| self.steps.get(i))
    }

    /// Step index one past the last step in the plan.
    pub fn end_step_index(&self) -> usize {
        self.first_step_index + self.steps.len()
    }
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Rotation matrix about the world Z axis.
pub fn yaw_rotation(yaw_rad: f64) -> Matrix2<f64> {
    let (s, c) = yaw_rad.sin_cos();
    Matrix2::new(c, -s, s, c)
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    fn step(step_index: usize, side: RobotSide, x: f64) -> Footstep {
        Footstep {
            step_index,
            side,
            pose: FootPose::new(x, 0.1 * side.lateral_sign(), 0.0),
            swing_duration_s: 0.6,
            transfer_duration_s: 0.2
        }
    }

    #[test]
    fn test_foot_frame_transforms() {
        let foot = FootPose::new(1.0, 2.0, FRAC_PI_2);

        let world = foot.point_to_world(&Vector2::new(0.1, 0.0));
        assert_relative_eq!(world, Vector2::new(1.0, 2.1), epsilon = 1e-12);

        let back = foot.point_to_foot(&world);
        assert_relative_eq!(back, Vector2::new(0.1, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_mid_pose() {
        let feet = Feet {
            left: FootPose::new(0.0, 0.1, 0.2),
            right: FootPose::new(0.2, -0.1, 0.0)
        };

        let mid = feet.mid_pose();
        assert_relative_eq!(mid.position_2d(), Vector2::new(0.1, 0.0), epsilon = 1e-12);
        assert_relative_eq!(mid.yaw_rad, 0.1, epsilon = 1e-12);
        assert_eq!(feet.get(RobotSide::Right), &feet.right);
    }

    #[test]
    fn test_plan_validation() {
        let mut plan = FootstepPlan {
            first_step_index: 3,
            steps: vec![step(3, RobotSide::Left, 0.3), step(4, RobotSide::Right, 0.6)],
            final_transfer_duration_s: 0.3
        };
        assert_eq!(plan.validate(), Ok(()));
        assert_eq!(plan.get_step(4).map(|s| s.side), Some(RobotSide::Right));
        assert!(plan.get_step(2).is_none());
        assert_eq!(plan.end_step_index(), 5);

        plan.steps[1].step_index = 7;
        assert!(matches!(plan.validate(), Err(PlanError::InvalidStep(1, _))));

        plan.steps[1].step_index = 4;
        plan.steps[0].transfer_duration_s = 0.0;
        assert!(matches!(plan.validate(), Err(PlanError::InvalidStep(0, _))));

        plan.steps.clear();
        assert_eq!(plan.validate(), Err(PlanError::EmptyPlan));
    }
}
