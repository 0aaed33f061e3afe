//! # Linear inverted pendulum plant
//!
//! A point mass at constant height above flat ground. Used as the source of
//! state estimates when running the controller without a robot.
//!
//! ```text
//! dxi/dt = omega (xi - cmp)
//! dx/dt  = omega (xi - x)
//! ```

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::Vector2;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// State of the pendulum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lipm {
    /// Natural frequency.
    ///
    /// Units: 1/seconds
    omega_rps: f64,

    /// Units: meters,
    /// Frame: World
    pub com_m: Vector2<f64>,

    /// Units: meters/second,
    /// Frame: World
    pub com_velocity_mps: Vector2<f64>
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Lipm {
    /// A pendulum at rest above `com_m`.
    pub fn at_rest(omega_rps: f64, com_m: Vector2<f64>) -> Self {
        Self {
            omega_rps,
            com_m,
            com_velocity_mps: Vector2::zeros()
        }
    }

    pub fn omega_rps(&self) -> f64 {
        self.omega_rps
    }

    /// The instantaneous capture point.
    ///
    /// Units: meters,
    /// Frame: World
    pub fn icp_m(&self) -> Vector2<f64> {
        self.com_m + self.com_velocity_mps / self.omega_rps
    }

    /// Apply an instantaneous change in CoM velocity, as from a push.
    pub fn push(&mut self, delta_velocity_mps: Vector2<f64>) {
        self.com_velocity_mps += delta_velocity_mps;
    }

    /// Advance the pendulum by `dt_s` while holding the CMP at `cmp_m`.
    ///
    /// The ICP is integrated exactly over the step, the CoM then follows it.
    pub fn step(&mut self, cmp_m: &Vector2<f64>, dt_s: f64) {
        let growth = (self.omega_rps * dt_s).exp();

        let icp_next = cmp_m + (self.icp_m() - cmp_m) * growth;

        // CoM converges on the average ICP over the step
        let decay = (-self.omega_rps * dt_s).exp();
        let icp_mid = (self.icp_m() + icp_next) * 0.5;
        let com_next = icp_mid + (self.com_m - icp_mid) * decay;

        self.com_m = com_next;
        self.com_velocity_mps = (icp_next - com_next) * self.omega_rps;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_icp_diverges_from_cmp() {
        let omega = 3.0;
        let mut lipm = Lipm::at_rest(omega, Vector2::new(0.01, 0.0));

        lipm.step(&Vector2::zeros(), 0.1);

        assert_relative_eq!(lipm.icp_m()[0], 0.01 * (omega * 0.1).exp(), epsilon = 1e-12);
        assert_relative_eq!(lipm.icp_m()[1], 0.0);
    }

    #[test]
    fn test_balanced_when_cmp_on_icp() {
        let mut lipm = Lipm::at_rest(3.0, Vector2::new(0.1, -0.05));
        lipm.push(Vector2::new(0.3, 0.0));

        let icp = lipm.icp_m();
        for _ in 0..1000 {
            lipm.step(&icp, 0.002);
        }

        // ICP held still, CoM comes to rest on it
        assert_relative_eq!(lipm.icp_m(), icp, epsilon = 1e-9);
        assert_relative_eq!(lipm.com_m, icp, epsilon = 1e-3);
        assert!(lipm.com_velocity_mps.norm() < 1e-2);
    }

    #[test]
    fn test_push_moves_icp() {
        let omega = 2.0;
        let mut lipm = Lipm::at_rest(omega, Vector2::zeros());

        lipm.push(Vector2::new(0.2, 0.1));

        assert_relative_eq!(lipm.icp_m(), Vector2::new(0.1, 0.05));
    }
}
