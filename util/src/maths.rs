//! Utility maths functions

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use num_traits::Float;

/// Clamp a value between `min` and `max`.
pub fn clamp<T>(value: &T, min: &T, max: &T) -> T
where
    T: Float
{
    let mut ret = *value;

    if ret > *max {
        ret = *max
    }
    if ret < *min {
        ret = *min
    }

    ret
}

/// Apply a symmetric deadband to a value.
///
/// Values whose magnitude is within `width` are mapped to zero, values outside
/// have the width removed so the output ramps linearly from zero at the edge
/// of the band.
pub fn deadband<T>(value: T, width: T) -> T
where
    T: Float
{
    let zero = T::zero();

    if width <= zero {
        return value
    }

    if value.abs() <= width {
        zero
    }
    else {
        value - value.signum() * width
    }
}
