//! Polynomial trajectory segments

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use nalgebra::Vector2;

// Internal
use super::{SplineType, TrajPoint};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A single polynomial piece of a trajectory.
///
/// The polynomial is expressed in the local time `tau = t - t_start_s`, i.e.
/// `p(tau) = c0 + c1 tau + c2 tau^2 + c3 tau^3`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    /// Units: seconds
    pub t_start_s: f64,

    /// Units: seconds
    pub t_end_s: f64,

    /// Units: meters
    pub start_pos_m: Vector2<f64>,

    /// Units: meters
    pub end_pos_m: Vector2<f64>,

    /// Polynomial coefficients, lowest order first. Only the first
    /// `num_coeffs` are meaningful, the rest are zero.
    coeffs: [Vector2<f64>; 4],

    /// Number of coefficients, 2 for linear and 4 for cubic segments.
    num_coeffs: usize
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Segment {
    /// Create a new segment between two points.
    ///
    /// The caller is responsible for checking that `t_end_s > t_start_s`.
    pub fn new(
        spline_type: SplineType,
        t_start_s: f64,
        t_end_s: f64,
        start_pos_m: Vector2<f64>,
        end_pos_m: Vector2<f64>
    ) -> Self {
        let dur_s = t_end_s - t_start_s;
        let delta = end_pos_m - start_pos_m;
        let zero = Vector2::zeros();

        let (coeffs, num_coeffs) = match spline_type {
            SplineType::Linear => ([start_pos_m, delta / dur_s, zero, zero], 2),
            SplineType::Cubic => (
                [
                    start_pos_m,
                    zero,
                    delta * (3.0 / dur_s.powi(2)),
                    delta * (-2.0 / dur_s.powi(3))
                ],
                4
            )
        };

        Self {
            t_start_s,
            t_end_s,
            start_pos_m,
            end_pos_m,
            coeffs,
            num_coeffs
        }
    }

    /// Duration of the segment.
    pub fn duration_s(&self) -> f64 {
        self.t_end_s - self.t_start_s
    }

    /// Number of polynomial coefficients in the segment.
    pub fn num_coeffs(&self) -> usize {
        self.num_coeffs
    }

    /// True if `time_s` lies within the closed interval of the segment.
    pub fn contains(&self, time_s: f64) -> bool {
        time_s >= self.t_start_s && time_s <= self.t_end_s
    }

    /// Evaluate the segment at a time.
    ///
    /// Times outside of the segment are clamped onto it.
    pub fn evaluate(&self, time_s: f64) -> TrajPoint {
        let tau = self.local_time(time_s);

        TrajPoint {
            position_m: self.derivative(0, tau),
            velocity_mps: self.derivative(1, tau),
            acceleration_mps2: self.derivative(2, tau)
        }
    }

    /// Evaluate the `order`th time derivative of the polynomial at local time
    /// `tau`.
    pub fn derivative(&self, order: usize, tau: f64) -> Vector2<f64> {
        let mut value = Vector2::zeros();

        for k in order..self.num_coeffs {
            // Falling factorial k! / (k - order)!
            let factor = ((k - order + 1)..=k).fold(1.0, |acc, f| acc * f as f64);
            value += self.coeffs[k] * (factor * tau.powi((k - order) as i32));
        }

        value
    }

    /// Add a cubic in local time to the polynomial, making the segment cubic.
    ///
    /// The end points are re-evaluated, so a correction which does not vanish
    /// at both ends moves them.
    pub fn add_cubic(&mut self, correction: &[Vector2<f64>; 4]) {
        for (c, d) in self.coeffs.iter_mut().zip(correction.iter()) {
            *c += d;
        }
        self.num_coeffs = 4;
        self.start_pos_m = self.derivative(0, 0.0);
        self.end_pos_m = self.derivative(0, self.duration_s());
    }

    /// Shorten the segment so that it ends at `time_s`, keeping its shape.
    ///
    /// Since the polynomial is expressed in local time the coefficients are
    /// unchanged, only the end time and end position move.
    pub fn truncate(&mut self, time_s: f64) {
        let time_s = time_s.max(self.t_start_s).min(self.t_end_s);
        self.end_pos_m = self.derivative(0, time_s - self.t_start_s);
        self.t_end_s = time_s;
    }

    /// Convert a global time to clamped local time.
    fn local_time(&self, time_s: f64) -> f64 {
        (time_s.max(self.t_start_s).min(self.t_end_s)) - self.t_start_s
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_cubic_segment() {
        let seg = Segment::new(
            SplineType::Cubic,
            0.0,
            0.5,
            Vector2::new(0.0, 0.0),
            Vector2::new(0.3, 0.0)
        );
        assert_eq!(seg.num_coeffs(), 4);

        let start = seg.evaluate(0.0);
        let mid = seg.evaluate(0.25);
        let end = seg.evaluate(0.5);

        assert_relative_eq!(start.position_m, Vector2::new(0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(end.position_m, Vector2::new(0.3, 0.0), epsilon = 1e-12);
        assert!(mid.position_m[0] > 0.0 && mid.position_m[0] < 0.3);
        assert_relative_eq!(mid.position_m[0], 0.15, epsilon = 1e-12);

        // Cubic segments start and end at rest
        assert_relative_eq!(start.velocity_mps, Vector2::zeros(), epsilon = 1e-12);
        assert_relative_eq!(end.velocity_mps, Vector2::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_cubic_second_derivative_at_ends() {
        let seg = Segment::new(
            SplineType::Cubic,
            0.0,
            0.5,
            Vector2::new(0.0, 0.0),
            Vector2::new(0.3, 0.0)
        );

        // The acceleration evaluated on each end point is the limit from
        // inside the segment, so there is no jump in it at t = 0 or t = 0.5
        for &(end, inside) in &[(0.0, 1e-9), (0.5, 0.5 - 1e-9)] {
            assert!(seg.contains(end) && seg.contains(inside));
            assert_relative_eq!(
                seg.evaluate(end).acceleration_mps2,
                seg.evaluate(inside).acceleration_mps2,
                epsilon = 1e-6
            );
        }

        // Equal and opposite at the two ends, 6 d / T^2
        assert_relative_eq!(seg.evaluate(0.0).acceleration_mps2[0], 7.2, epsilon = 1e-12);
        assert_relative_eq!(seg.evaluate(0.5).acceleration_mps2[0], -7.2, epsilon = 1e-12);
        assert!(!seg.contains(0.5 + 1e-6));
    }

    #[test]
    fn test_add_cubic() {
        let mut seg = Segment::new(
            SplineType::Linear,
            1.0,
            2.0,
            Vector2::new(0.0, 0.0),
            Vector2::new(1.0, 0.0)
        );

        // tau (1 - tau) vanishes at both ends
        let bump = Vector2::new(0.0, 1.0);
        seg.add_cubic(&[Vector2::zeros(), bump, -bump, Vector2::zeros()]);

        assert_eq!(seg.num_coeffs(), 4);
        assert_relative_eq!(seg.start_pos_m, Vector2::new(0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(seg.end_pos_m, Vector2::new(1.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(seg.evaluate(1.5).position_m, Vector2::new(0.5, 0.25), epsilon = 1e-12);
    }

    #[test]
    fn test_linear_segment() {
        let seg = Segment::new(
            SplineType::Linear,
            1.0,
            3.0,
            Vector2::new(0.0, 1.0),
            Vector2::new(1.0, -1.0)
        );
        assert_eq!(seg.num_coeffs(), 2);

        let p = seg.evaluate(2.0);
        assert_relative_eq!(p.position_m, Vector2::new(0.5, 0.0), epsilon = 1e-12);
        assert_relative_eq!(p.velocity_mps, Vector2::new(0.5, -1.0), epsilon = 1e-12);
        assert_relative_eq!(p.acceleration_mps2, Vector2::zeros(), epsilon = 1e-12);

        // Clamped outside of the interval
        assert_relative_eq!(seg.evaluate(5.0).position_m, Vector2::new(1.0, -1.0));
    }

    #[test]
    fn test_truncate_keeps_shape() {
        let mut seg = Segment::new(
            SplineType::Cubic,
            0.0,
            1.0,
            Vector2::new(0.0, 0.0),
            Vector2::new(1.0, 2.0)
        );
        let before = seg.evaluate(0.3);

        seg.truncate(0.6);
        assert_relative_eq!(seg.t_end_s, 0.6);
        assert_relative_eq!(seg.evaluate(0.3).position_m, before.position_m, epsilon = 1e-12);
        assert_relative_eq!(seg.end_pos_m, seg.evaluate(0.6).position_m, epsilon = 1e-12);
    }
}
