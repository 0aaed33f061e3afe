//! Reference trajectory segment store

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use nalgebra::Vector2;

// Internal
use super::*;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// An ordered chain of segments describing one reference path.
///
/// The segment storage is an arena: the vector is only ever grown, and the
/// number of segments in use is tracked by `num_active`, so rebuilding a
/// trajectory each step does not allocate once the arena has warmed up.
#[derive(Debug, Clone)]
pub struct ReferenceTrajectory {
    role: TrajRole,

    /// Index of the footstep this trajectory was built for.
    step_index: usize,

    spline_type: SplineType,

    segments: Vec<Segment>,

    num_active: usize
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl ReferenceTrajectory {
    /// Create a new empty trajectory with space reserved for `capacity`
    /// segments.
    pub fn new(role: TrajRole, spline_type: SplineType, capacity: usize) -> Self {
        Self {
            role,
            step_index: 0,
            spline_type,
            segments: Vec::with_capacity(capacity),
            num_active: 0
        }
    }

    pub fn role(&self) -> TrajRole {
        self.role
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn spline_type(&self) -> SplineType {
        self.spline_type
    }

    /// Set the footstep index this trajectory describes.
    pub fn set_step_index(&mut self, step_index: usize) {
        self.step_index = step_index;
    }

    /// The active segments, in time order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments[..self.num_active]
    }

    /// Mutable access to an active segment.
    pub(crate) fn segment_mut(&mut self, idx: usize) -> Option<&mut Segment> {
        self.segments[..self.num_active].get_mut(idx)
    }

    pub fn is_empty(&self) -> bool {
        self.num_active == 0
    }

    /// Start time of the first segment.
    pub fn start_time_s(&self) -> Option<f64> {
        self.segments().first().map(|s| s.t_start_s)
    }

    /// End time of the last segment.
    pub fn end_time_s(&self) -> Option<f64> {
        self.segments().last().map(|s| s.t_end_s)
    }

    /// Remove all segments, keeping the arena's storage.
    pub fn reset(&mut self, step_index: usize) {
        self.num_active = 0;
        self.step_index = step_index;
    }

    /// Copy another trajectory's segments into this one, reusing this
    /// trajectory's storage. The role is not copied.
    pub fn copy_from(&mut self, other: &ReferenceTrajectory) {
        self.step_index = other.step_index;
        self.spline_type = other.spline_type;
        self.segments.clear();
        self.segments.extend_from_slice(other.segments());
        self.num_active = other.num_active;
    }

    /// Append a segment of the trajectory's spline type.
    ///
    /// # Errors
    /// - `InvalidSegment` if `t_end_s <= t_start_s`, or if `t_start_s` does
    ///   not equal the end time of the previous segment.
    pub fn add_segment(
        &mut self,
        t_start_s: f64,
        t_end_s: f64,
        start_pos_m: Vector2<f64>,
        end_pos_m: Vector2<f64>
    ) -> Result<(), TrajError> {
        let chain_end_s = self.end_time_s();

        let chains = match chain_end_s {
            Some(end) => (t_start_s - end).abs() <= CHAIN_TOLERANCE_S,
            None => true
        };

        if !(t_end_s > t_start_s) || !chains || !t_start_s.is_finite() || !t_end_s.is_finite() {
            return Err(TrajError::InvalidSegment {
                t_start_s,
                t_end_s,
                chain_end_s
            })
        }

        // Snap the start time onto the previous end so the chain is exact
        let t_start_s = chain_end_s.unwrap_or(t_start_s);

        let seg = Segment::new(self.spline_type, t_start_s, t_end_s, start_pos_m, end_pos_m);

        if self.num_active < self.segments.len() {
            self.segments[self.num_active] = seg;
        }
        else {
            self.segments.push(seg);
        }
        self.num_active += 1;

        Ok(())
    }

    /// Find the index of the segment containing `time_s`.
    ///
    /// At a boundary between two segments the earlier segment is returned.
    ///
    /// # Errors
    /// - `Empty` if there are no segments.
    /// - `OutOfRange` if the time is before the start or after the end.
    pub fn segment_index_at(&self, time_s: f64) -> Result<usize, TrajError> {
        let segments = self.segments();

        let (start_s, end_s) = match (segments.first(), segments.last()) {
            (Some(f), Some(l)) => (f.t_start_s, l.t_end_s),
            _ => return Err(TrajError::Empty)
        };

        if !(time_s >= start_s && time_s <= end_s) {
            return Err(TrajError::OutOfRange {
                time_s,
                start_s,
                end_s
            })
        }

        // End times are strictly increasing, so the first segment whose end is
        // not before `time_s` contains it.
        let idx = segments.partition_point(|s| s.t_end_s < time_s);

        Ok(idx.min(segments.len() - 1))
    }

    /// Evaluate the trajectory at a time.
    ///
    /// # Errors
    /// - `Empty` or `OutOfRange`, see `segment_index_at`.
    pub fn evaluate_at(&self, time_s: f64) -> Result<TrajPoint, TrajError> {
        let idx = self.segment_index_at(time_s)?;
        Ok(self.segments[idx].evaluate(time_s))
    }

    /// Evaluate the trajectory at the nearest valid time.
    ///
    /// Returns the point and a flag which is true if the time had to be
    /// clamped onto the trajectory.
    ///
    /// # Errors
    /// - `Empty` if there is nothing to evaluate.
    pub fn evaluate_clamped(&self, time_s: f64) -> Result<(TrajPoint, bool), TrajError> {
        match self.evaluate_at(time_s) {
            Ok(p) => Ok((p, false)),
            Err(TrajError::OutOfRange { start_s, end_s, .. }) => {
                let clamped_s = if time_s.is_nan() || time_s < start_s {
                    start_s
                }
                else {
                    end_s
                };
                Ok((self.evaluate_at(clamped_s)?, true))
            },
            Err(e) => Err(e)
        }
    }

    /// Drop the part of the trajectory after `time_s`.
    ///
    /// The segment containing `time_s` is shortened to end there. If `time_s`
    /// is before the start the trajectory is emptied, if it is after the end
    /// nothing changes.
    pub fn truncate_at(&mut self, time_s: f64) {
        match self.segment_index_at(time_s) {
            Ok(idx) => {
                // A segment which would be shortened to nothing is dropped,
                // the previous one then ends exactly at `time_s`.
                if time_s - self.segments[idx].t_start_s <= CHAIN_TOLERANCE_S {
                    self.num_active = idx;
                }
                else {
                    self.segments[idx].truncate(time_s);
                    self.num_active = idx + 1;
                }
            },
            Err(TrajError::OutOfRange { start_s, .. }) => {
                if time_s < start_s {
                    self.num_active = 0;
                }
            },
            Err(_) => ()
        }
    }

    /// Remove segments which ended strictly before `time_s`.
    ///
    /// Used to stop the elapsed prefix from growing without bound over a long
    /// walk.
    pub fn discard_before(&mut self, time_s: f64) {
        let num_elapsed = self.segments().partition_point(|s| s.t_end_s < time_s);

        if num_elapsed > 0 {
            self.segments.drain(0..num_elapsed);
            self.num_active -= num_elapsed;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    fn three_segment_traj(spline: SplineType) -> ReferenceTrajectory {
        let mut traj = ReferenceTrajectory::new(TrajRole::Cop, spline, 4);
        traj.add_segment(0.0, 0.5, Vector2::new(0.0, 0.0), Vector2::new(0.3, 0.0)).unwrap();
        traj.add_segment(0.5, 1.0, Vector2::new(0.3, 0.0), Vector2::new(0.3, 0.2)).unwrap();
        traj.add_segment(1.0, 1.2, Vector2::new(0.3, 0.2), Vector2::new(0.5, 0.1)).unwrap();
        traj
    }

    #[test]
    fn test_add_segment_rejects_invalid() {
        let mut traj = three_segment_traj(SplineType::Cubic);

        // Non-positive duration
        assert!(matches!(
            traj.add_segment(1.2, 1.2, Vector2::zeros(), Vector2::zeros()),
            Err(TrajError::InvalidSegment { .. })
        ));

        // Gap in the chain
        assert!(matches!(
            traj.add_segment(1.3, 1.5, Vector2::zeros(), Vector2::zeros()),
            Err(TrajError::InvalidSegment { .. })
        ));

        // Failed adds don't change the trajectory
        assert_eq!(traj.segments().len(), 3);
        assert_relative_eq!(traj.end_time_s().unwrap(), 1.2);
    }

    #[test]
    fn test_evaluate_continuous_at_boundaries() {
        for &spline in &[SplineType::Cubic, SplineType::Linear] {
            let traj = three_segment_traj(spline);

            for &t in &[0.5, 1.0] {
                let before = traj.evaluate_at(t - 1e-9).unwrap();
                let at = traj.evaluate_at(t).unwrap();
                let after = traj.evaluate_at(t + 1e-9).unwrap();

                assert_relative_eq!(before.position_m, at.position_m, epsilon = 1e-6);
                assert_relative_eq!(after.position_m, at.position_m, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_evaluate_is_idempotent() {
        let traj = three_segment_traj(SplineType::Cubic);

        let a = traj.evaluate_at(0.73).unwrap();
        let b = traj.evaluate_at(0.73).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_out_of_range() {
        let traj = three_segment_traj(SplineType::Cubic);

        assert!(matches!(traj.evaluate_at(-0.1), Err(TrajError::OutOfRange { .. })));
        assert!(matches!(traj.evaluate_at(1.21), Err(TrajError::OutOfRange { .. })));

        let (p, clamped) = traj.evaluate_clamped(2.0).unwrap();
        assert!(clamped);
        assert_relative_eq!(p.position_m, Vector2::new(0.5, 0.1), epsilon = 1e-12);

        let (p, clamped) = traj.evaluate_clamped(0.25).unwrap();
        assert!(!clamped);
        assert_eq!(p, traj.evaluate_at(0.25).unwrap());

        let empty = ReferenceTrajectory::new(TrajRole::Cmp, SplineType::Cubic, 0);
        assert_eq!(empty.evaluate_clamped(0.0), Err(TrajError::Empty));
    }

    #[test]
    fn test_truncate_keeps_prefix() {
        let mut traj = three_segment_traj(SplineType::Cubic);
        let before = traj.evaluate_at(0.6).unwrap();

        traj.truncate_at(0.75);
        assert_eq!(traj.segments().len(), 2);
        assert_relative_eq!(traj.end_time_s().unwrap(), 0.75);
        assert_eq!(traj.evaluate_at(0.6).unwrap(), before);

        // Can chain on from the truncation point
        let end = traj.evaluate_at(0.75).unwrap().position_m;
        traj.add_segment(0.75, 1.0, end, Vector2::new(1.0, 1.0)).unwrap();
        assert_eq!(traj.segments().len(), 3);

        // Truncating exactly on a boundary drops the following segment
        traj.truncate_at(0.5);
        assert_eq!(traj.segments().len(), 1);

        traj.truncate_at(-1.0);
        assert!(traj.is_empty());
    }

    #[test]
    fn test_copy_from_keeps_role() {
        let linear = three_segment_traj(SplineType::Linear);
        let mut copy = ReferenceTrajectory::new(TrajRole::Cmp, SplineType::Cubic, 4);
        copy.set_step_index(7);

        copy.copy_from(&linear);
        assert_eq!(copy.role(), TrajRole::Cmp);
        assert_eq!(copy.spline_type(), SplineType::Linear);
        assert_eq!(copy.step_index(), linear.step_index());
        assert_eq!(copy.segments(), linear.segments());

        // Segments added after the copy follow the copied spline type
        copy.add_segment(1.2, 1.5, Vector2::new(0.5, 0.1), Vector2::zeros()).unwrap();
        assert_eq!(copy.segments()[3].num_coeffs(), 2);
    }

    #[test]
    fn test_discard_before() {
        let mut traj = three_segment_traj(SplineType::Linear);

        traj.discard_before(0.5);
        assert_eq!(traj.segments().len(), 3);

        traj.discard_before(0.75);
        assert_eq!(traj.segments().len(), 2);
        assert_relative_eq!(traj.start_time_s().unwrap(), 0.5);
    }
}
