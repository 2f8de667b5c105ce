//! Exact rational arithmetic for timebases and frame rates.
//!
//! Timestamps are plain `i64` tick counts; a [`Rational`] timebase says how
//! many seconds one tick lasts. Rescaling between timebases uses 128-bit
//! intermediates and rounds half away from zero.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// A rational number `num / den`, used for timebases and frame rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rational {
    /// Numerator.
    pub num: i64,
    /// Denominator.
    pub den: i64,
}

impl Rational {
    /// Create a rational without normalizing it.
    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    /// A rational is valid when neither part is zero.
    pub fn is_valid(&self) -> bool {
        self.num != 0 && self.den != 0
    }

    /// Reduce by the greatest common divisor and move the sign to the numerator.
    pub fn reduce(self) -> Self {
        if self.den == 0 {
            return self;
        }
        let g = gcd(self.num.unsigned_abs(), self.den.unsigned_abs()).max(1) as i64;
        let sign = if self.den < 0 { -1 } else { 1 };
        Self::new(sign * self.num / g, sign * self.den / g)
    }

    /// Swap numerator and denominator.
    pub fn invert(self) -> Self {
        Self::new(self.den, self.num)
    }

    /// Floating point value, `0.0` for a zero denominator.
    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    /// Convert `value` expressed in `from` units into `to` units.
    ///
    /// Rounds to the nearest integer, halves away from zero. Returns `0` when
    /// either timebase is degenerate.
    pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
        let numer = value as i128 * from.num as i128 * to.den as i128;
        let denom = from.den as i128 * to.num as i128;
        if denom == 0 {
            return 0;
        }
        let rounded = div_round(numer, denom);
        rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Compare two timestamps expressed in different timebases.
    pub fn compare_ts(a: i64, tb_a: Rational, b: i64, tb_b: Rational) -> Ordering {
        let tb_a = tb_a.reduce();
        let tb_b = tb_b.reduce();
        let lhs = a as i128 * tb_a.num as i128 * tb_b.den as i128;
        let rhs = b as i128 * tb_b.num as i128 * tb_a.den as i128;
        lhs.cmp(&rhs)
    }
}

fn div_round(numer: i128, denom: i128) -> i128 {
    let (numer, denom) = if denom < 0 {
        (-numer, -denom)
    } else {
        (numer, denom)
    };
    let half = denom / 2;
    if numer >= 0 {
        (numer + half) / denom
    } else {
        -((-numer + half) / denom)
    }
}

/// Greatest common divisor (`gcd(0, 0) == 0`).
pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl FromStr for Rational {
    type Err = Error;

    /// Parse `"num/den"`, `"num:den"` or a bare integer.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parse = |part: &str| {
            part.trim()
                .parse::<i64>()
                .map_err(|_| Error::invalid_input(format!("invalid rational: {s:?}")))
        };
        let value = match s.split_once(['/', ':']) {
            Some((num, den)) => Rational::new(parse(num)?, parse(den)?),
            None => Rational::new(parse(s)?, 1),
        };
        if value.den == 0 {
            return Err(Error::invalid_input(format!("zero denominator: {s:?}")));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce() {
        assert_eq!(Rational::new(48000, 2002).reduce(), Rational::new(24000, 1001));
        assert_eq!(Rational::new(50, -2).reduce(), Rational::new(-25, 1));
        assert_eq!(Rational::new(0, 0).reduce(), Rational::new(0, 0));
    }

    #[test]
    fn test_rescale_rounds_half_away_from_zero() {
        let tb = Rational::new(1, 90_000);
        let ms = Rational::new(1, 1_000);
        assert_eq!(Rational::rescale(90_000, tb, ms), 1_000);
        // 45 ticks = 0.5ms
        assert_eq!(Rational::rescale(45, tb, ms), 1);
        assert_eq!(Rational::rescale(-45, tb, ms), -1);
        assert_eq!(Rational::rescale(44, tb, ms), 0);
    }

    #[test]
    fn test_rescale_degenerate() {
        assert_eq!(
            Rational::rescale(10, Rational::new(1, 0), Rational::new(1, 1000)),
            0
        );
    }

    #[test]
    fn test_compare_ts() {
        let a = Rational::new(1, 90_000);
        let b = Rational::new(1, 48_000);
        assert_eq!(Rational::compare_ts(90_000, a, 48_000, b), Ordering::Equal);
        assert_eq!(Rational::compare_ts(90_001, a, 48_000, b), Ordering::Greater);
        assert_eq!(Rational::compare_ts(0, a, 1, b), Ordering::Less);
    }

    #[test]
    fn test_parse() {
        assert_eq!("24000/1001".parse::<Rational>().unwrap(), Rational::new(24000, 1001));
        assert_eq!("25".parse::<Rational>().unwrap(), Rational::new(25, 1));
        assert_eq!("30:1".parse::<Rational>().unwrap(), Rational::new(30, 1));
        assert!("1/0".parse::<Rational>().is_err());
        assert!("abc".parse::<Rational>().is_err());
    }

    #[test]
    fn test_validity_and_display() {
        assert!(Rational::new(1, 25).is_valid());
        assert!(!Rational::new(0, 1).is_valid());
        assert_eq!(Rational::new(30000, 1001).to_string(), "30000/1001");
        assert!((Rational::new(1, 4).as_f64() - 0.25).abs() < f64::EPSILON);
    }
}
