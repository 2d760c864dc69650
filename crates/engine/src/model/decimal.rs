//! Base-10 decimal numbers.

use std::cmp::Ordering;
use std::fmt;

/// Exponent marking the NaN decimal.
pub const NAN_EXPONENT: i8 = i8::MIN;

/// A decimal number `mantissa * 10^exponent`.
///
/// Equality is structural: `1.0` written as `(10, -1)` and `1` written as
/// `(1, 0)` are different representations. Use [`Decimal::value_cmp`] to
/// compare numeric values.
///
/// NaN is `(0, i8::MIN)`. It propagates through [`add`](Decimal::add) and
/// [`subtract`](Decimal::subtract), and any arithmetic overflow also yields
/// NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Decimal {
    mantissa: i64,
    exponent: i8,
}

impl Decimal {
    /// The NaN decimal.
    pub const NAN: Decimal = Decimal {
        mantissa: 0,
        exponent: NAN_EXPONENT,
    };

    /// Zero with a zero exponent.
    pub const ZERO: Decimal = Decimal {
        mantissa: 0,
        exponent: 0,
    };

    /// Creates `mantissa * 10^exponent`. An exponent of `i8::MIN` gives NaN.
    pub fn new(mantissa: i64, exponent: i8) -> Self {
        if exponent == NAN_EXPONENT {
            return Self::NAN;
        }
        Self { mantissa, exponent }
    }

    /// Mantissa of the representation.
    pub fn mantissa(&self) -> i64 {
        self.mantissa
    }

    /// Base-10 exponent of the representation.
    pub fn exponent(&self) -> i8 {
        self.exponent
    }

    /// Returns `true` for NaN.
    pub fn is_nan(&self) -> bool {
        self.exponent == NAN_EXPONENT
    }

    /// Mantissa rescaled to a smaller or equal exponent, `None` on overflow.
    fn mantissa_at(&self, exponent: i8) -> Option<i64> {
        let shift = (self.exponent as i32 - exponent as i32) as u32;
        10i64
            .checked_pow(shift)
            .and_then(|factor| self.mantissa.checked_mul(factor))
    }

    fn combine(self, other: Decimal, op: fn(i64, i64) -> Option<i64>) -> Decimal {
        if self.is_nan() || other.is_nan() {
            return Self::NAN;
        }
        let exponent = self.exponent.min(other.exponent);
        match (self.mantissa_at(exponent), other.mantissa_at(exponent)) {
            (Some(left), Some(right)) => match op(left, right) {
                Some(mantissa) => Decimal { mantissa, exponent },
                None => Self::NAN,
            },
            _ => Self::NAN,
        }
    }

    /// Returns `self + other`, aligning both on the smaller exponent.
    pub fn add(self, other: Decimal) -> Decimal {
        self.combine(other, i64::checked_add)
    }

    /// Returns `self - other`, aligning both on the smaller exponent.
    pub fn subtract(self, other: Decimal) -> Decimal {
        self.combine(other, i64::checked_sub)
    }

    /// Compares numeric values. NaN sorts before every number and equals NaN.
    pub fn value_cmp(&self, other: &Decimal) -> Ordering {
        match (self.is_nan(), other.is_nan()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }
        let exponent = self.exponent.min(other.exponent);
        match (self.mantissa_at(exponent), other.mantissa_at(exponent)) {
            (Some(left), Some(right)) => left.cmp(&right),
            _ => self.to_f64().total_cmp(&other.to_f64()),
        }
    }

    /// Approximate floating point value.
    pub fn to_f64(&self) -> f64 {
        if self.is_nan() {
            return f64::NAN;
        }
        self.mantissa as f64 * 10f64.powi(self.exponent as i32)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nan() {
            return write!(f, "NaN");
        }
        if self.exponent >= 0 {
            return write!(f, "{}{}", self.mantissa, "0".repeat(self.exponent as usize));
        }
        let digits = self.mantissa.unsigned_abs().to_string();
        let scale = self.exponent.unsigned_abs() as usize;
        let sign = if self.mantissa < 0 { "-" } else { "" };
        if digits.len() > scale {
            let (int, frac) = digits.split_at(digits.len() - scale);
            write!(f, "{sign}{int}.{frac}")
        } else {
            write!(f, "{sign}0.{}{digits}", "0".repeat(scale - digits.len()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtract_is_left_minus_right() {
        let first = Decimal::new(104, -1);
        let second = Decimal::new(146, -1);
        assert_eq!(first.subtract(second), Decimal::new(-42, -1));
        assert_eq!(second.subtract(first), Decimal::new(42, -1));
    }

    #[test]
    fn test_alignment_uses_smaller_exponent() {
        let sum = Decimal::new(15, 0).add(Decimal::new(25, -1));
        assert_eq!(sum, Decimal::new(175, -1));
        let diff = Decimal::new(3, 2).subtract(Decimal::new(1, 0));
        assert_eq!(diff, Decimal::new(299, 0));
    }

    #[test]
    fn test_nan_propagates() {
        assert!(Decimal::NAN.add(Decimal::new(1, 0)).is_nan());
        assert!(Decimal::new(1, 0).subtract(Decimal::NAN).is_nan());
        assert!(Decimal::new(5, NAN_EXPONENT).is_nan());
        assert_eq!(Decimal::NAN.mantissa(), 0);
    }

    #[test]
    fn test_overflow_gives_nan() {
        assert!(Decimal::new(i64::MAX, 0).add(Decimal::new(1, 0)).is_nan());
        assert!(Decimal::new(1, 100).add(Decimal::new(1, -100)).is_nan());
    }

    #[test]
    fn test_value_comparison() {
        assert_eq!(
            Decimal::new(10, -1).value_cmp(&Decimal::new(1, 0)),
            Ordering::Equal
        );
        assert_ne!(Decimal::new(10, -1), Decimal::new(1, 0));
        assert_eq!(
            Decimal::new(-5, 0).value_cmp(&Decimal::new(1, -3)),
            Ordering::Less
        );
        assert_eq!(Decimal::NAN.value_cmp(&Decimal::NAN), Ordering::Equal);
    }

    #[test]
    fn test_display() {
        assert_eq!(Decimal::new(104, -1).to_string(), "10.4");
        assert_eq!(Decimal::new(-5, -3).to_string(), "-0.005");
        assert_eq!(Decimal::new(12, 2).to_string(), "1200");
        assert_eq!(Decimal::NAN.to_string(), "NaN");
    }
}
