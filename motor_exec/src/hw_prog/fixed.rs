//! Fixed point helpers
//!
//! Values handed to the timing program are signed 32 bit integers. Times are Q20 seconds and the
//! frequency rate is Q12 Hz/s.

/// Fractional bits of a Q12 value.
pub const Q12_BITS: u32 = 12;

/// Fractional bits of a Q20 value.
pub const Q20_BITS: u32 = 20;

/// Fractional bits of the Q10 frequency computed inside the program.
pub const Q10_BITS: u32 = 10;

pub const Q12_ONE: f64 = (1u64 << Q12_BITS) as f64;
pub const Q20_ONE: f64 = (1u64 << Q20_BITS) as f64;

/// Round a real value into Q12, `None` if it does not fit in an `i32`.
pub fn to_q12(value: f64) -> Option<i32> {
    to_fixed(value, Q12_ONE)
}

/// Round a real value into Q20, `None` if it does not fit in an `i32`.
pub fn to_q20(value: f64) -> Option<i32> {
    to_fixed(value, Q20_ONE)
}

pub fn from_q12(value: i32) -> f64 {
    value as f64 / Q12_ONE
}

pub fn from_q20(value: i32) -> f64 {
    value as f64 / Q20_ONE
}

/// Reference 32x32 -> 64 bit unsigned product split into `(hi, lo)` words.
pub fn mul_u32(x: u32, y: u32) -> (u32, u32) {
    let p = x as u64 * y as u64;
    ((p >> 32) as u32, p as u32)
}

fn to_fixed(value: f64, one: f64) -> Option<i32> {
    let scaled = (value * one).round();
    if scaled.is_finite() && scaled >= i32::MIN as f64 && scaled <= i32::MAX as f64 {
        Some(scaled as i32)
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_conversions() {
        assert_eq!(to_q20(1.0), Some(1 << 20));
        assert_eq!(to_q20(0.5 / Q20_ONE + 3.0 / Q20_ONE), Some(4));
        assert_eq!(to_q12(-1.5), Some(-6144));
        assert_eq!(to_q20(4096.0), None);
        assert_eq!(from_q20(1 << 19), 0.5);
    }

    #[test]
    fn test_reference_mul() {
        assert_eq!(mul_u32(0xffff_ffff, 0xffff_ffff), (0xffff_fffe, 1));
        assert_eq!(mul_u32(1 << 16, 1 << 16), (1, 0));
    }
}
