//! Time-unit conversions between milliseconds, stream timestamps and samples
//!
//! Streams address time in their own time base (`pts * num / den` seconds),
//! the editor timeline addresses time in milliseconds and the audio mixer in
//! sample frames. Every conversion rounds to nearest so that a round trip
//! through a finer unit never drifts.

use serde::{Deserialize, Serialize};

/// Rational number, used as a stream time base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    /// One millisecond
    pub const MILLIS: Self = Self { num: 1, den: 1000 };
    /// One microsecond
    pub const MICROS: Self = Self {
        num: 1,
        den: 1_000_000,
    };

    #[inline]
    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    /// Time base of one sample at `sample_rate`
    #[inline]
    pub const fn per_sample(sample_rate: u32) -> Self {
        Self {
            num: 1,
            den: sample_rate as i64,
        }
    }

    #[inline]
    pub fn as_f64(self) -> f64 {
        self.num as f64 / self.den as f64
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.num > 0 && self.den > 0
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::MILLIS
    }
}

/// Rescale `value` expressed in `from` units into `to` units, rounding to nearest.
///
/// `i64::MAX` and `i64::MIN` pass through unchanged; they are used as open
/// bounds ("end of file") by the scheduler.
pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
    if value == i64::MAX || value == i64::MIN {
        return value;
    }
    let num = value as i128 * from.num as i128 * to.den as i128;
    let den = from.den as i128 * to.num as i128;
    if den == 0 {
        return 0;
    }
    let half = den.abs() / 2;
    let rounded = if (num >= 0) == (den > 0) {
        (num.abs() + half) / den.abs()
    } else {
        -((num.abs() + half) / den.abs())
    };
    rounded.clamp(i64::MIN as i128 + 1, i64::MAX as i128 - 1) as i64
}

/// Milliseconds to stream timestamp (relative to stream start)
#[inline]
pub fn ms_to_pts(ms: i64, time_base: Rational) -> i64 {
    rescale(ms, Rational::MILLIS, time_base)
}

/// Stream timestamp (relative to stream start) to milliseconds
#[inline]
pub fn pts_to_ms(pts: i64, time_base: Rational) -> i64 {
    rescale(pts, time_base, Rational::MILLIS)
}

#[inline]
pub fn ms_to_samples(ms: i64, sample_rate: u32) -> i64 {
    rescale(ms, Rational::MILLIS, Rational::per_sample(sample_rate))
}

#[inline]
pub fn samples_to_ms(samples: i64, sample_rate: u32) -> i64 {
    rescale(samples, Rational::per_sample(sample_rate), Rational::MILLIS)
}

#[inline]
pub fn pts_to_samples(pts: i64, time_base: Rational, sample_rate: u32) -> i64 {
    rescale(pts, time_base, Rational::per_sample(sample_rate))
}

#[inline]
pub fn samples_to_pts(samples: i64, time_base: Rational, sample_rate: u32) -> i64 {
    rescale(samples, Rational::per_sample(sample_rate), time_base)
}

/// Seconds as f64 for a stream timestamp, as handed to frame converters
#[inline]
pub fn pts_to_seconds(pts: i64, time_base: Rational) -> f64 {
    pts as f64 * time_base.as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale_rounds_to_nearest() {
        let tb = Rational::new(1, 90_000);
        assert_eq!(ms_to_pts(40, tb), 3600);
        assert_eq!(pts_to_ms(3600, tb), 40);
        // 1/3 ms rounds down, 2/3 rounds up
        assert_eq!(pts_to_ms(30, tb), 0);
        assert_eq!(pts_to_ms(60, tb), 1);
        assert_eq!(pts_to_ms(-60, tb), -1);
    }

    #[test]
    fn test_open_bounds_pass_through() {
        let tb = Rational::new(1, 48_000);
        assert_eq!(pts_to_ms(i64::MAX, tb), i64::MAX);
        assert_eq!(ms_to_pts(i64::MIN, tb), i64::MIN);
    }

    #[test]
    fn test_samples_round_trip() {
        assert_eq!(ms_to_samples(5000, 48_000), 240_000);
        assert_eq!(samples_to_ms(240_000, 48_000), 5000);
        assert_eq!(ms_to_samples(1, 44_100), 44);
        assert_eq!(pts_to_samples(1024, Rational::new(1, 44_100), 48_000), 1115);
    }
}
