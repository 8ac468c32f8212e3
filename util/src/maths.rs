//! Utility maths functions

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::UnitQuaternion;
use num_traits::Float;

/// Clamp a value into the inclusive range `[min, max]`.
pub fn clamp<T>(value: T, min: T, max: T) -> T
where
    T: Float,
{
    let mut ret = value;

    if ret > max {
        ret = max
    }
    if ret < min {
        ret = min
    }

    ret
}

/// Rotation about the Y (platform) axis encoded in a unit quaternion.
///
/// Units: radians, in the range [-pi, pi]
pub fn y_axis_rotation(q: &UnitQuaternion<f64>) -> f64 {
    let (x, y, z, w) = (q.coords[0], q.coords[1], q.coords[2], q.coords[3]);
    (2.0 * (w * y + x * z)).atan2(1.0 - 2.0 * (y * y + z * z))
}

/// Rotation about the Y axis needed to go from `q_from` to `q_to`.
///
/// Units: radians, in the range [-pi, pi]
pub fn relative_y_rotation(q_from: &UnitQuaternion<f64>, q_to: &UnitQuaternion<f64>) -> f64 {
    y_axis_rotation(&(q_to * q_from.inverse()))
}

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn test_clamp() {
        assert_eq!(clamp(3.0, -1.0, 1.0), 1.0);
        assert_eq!(clamp(-3.0, -1.0, 1.0), -1.0);
        assert_eq!(clamp(0.25, -1.0, 1.0), 0.25);
    }

    #[test]
    fn test_y_axis_rotation() {
        let q = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.7);
        assert!((y_axis_rotation(&q) - 0.7).abs() < 1e-12);

        // Pure roll leaves the yaw untouched
        let q = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 0.4);
        assert!(y_axis_rotation(&q).abs() < 1e-12);
    }

    #[test]
    fn test_relative_y_rotation() {
        let from = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.3);
        let to = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.8);
        assert!((relative_y_rotation(&from, &to) - 0.5).abs() < 1e-12);
        assert!((relative_y_rotation(&to, &from) + 0.5).abs() < 1e-12);

        // Wraps across pi rather than going the long way round
        let from = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 3.0);
        let to = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), -3.0);
        let expected = 2.0 * std::f64::consts::PI - 6.0;
        assert!((relative_y_rotation(&from, &to) - expected).abs() < 1e-9);
    }
}
