//! Mathematical helpers used throughout the engine

use crate::Sample;

/// Convert a level in decibel to a linear gain factor.
#[inline]
pub fn db_to_linear(db: Sample) -> Sample {
    (10.0 as Sample).powf(db / 20.0)
}

/// Convert a linear gain factor to a level in decibel.
///
/// Returns `-inf` for zero and NaN for negative input.
#[inline]
pub fn linear_to_db(linear: Sample) -> Sample {
    20.0 * linear.log10()
}

/// Convert an angle in degrees to radians.
#[inline]
pub fn deg_to_rad(angle: Sample) -> Sample {
    angle * (std::f32::consts::PI / 180.0)
}

/// Convert an angle in radians to degrees.
#[inline]
pub fn rad_to_deg(angle: Sample) -> Sample {
    angle * (180.0 / std::f32::consts::PI)
}

/// Wrap `x` into the interval `[0, full)`.
#[inline]
pub fn wrap(x: Sample, full: Sample) -> Sample {
    let r = x % full;
    if r < 0.0 {
        r + full
    } else {
        r
    }
}

/// Wrap an angle in degrees into `[-180, 180)`.
#[inline]
pub fn wrap_angle(deg: Sample) -> Sample {
    wrap(deg + 180.0, 360.0) - 180.0
}

/// Find the smallest power of two >= `number` (1 for inputs <= 1).
pub fn next_power_of_2(number: usize) -> usize {
    let mut p = 1;
    while p < number {
        p *= 2;
    }
    p
}

/// Absolute maximum of a block of samples; always >= 0.
pub fn max_amplitude(block: &[Sample]) -> Sample {
    block.iter().fold(0.0, |acc, &x| acc.max(x.abs()))
}

/// Root mean square of a block of samples.
pub fn rms(block: &[Sample]) -> Sample {
    if block.is_empty() {
        return 0.0;
    }
    let sum: Sample = block.iter().map(|&x| x * x).sum();
    (sum / block.len() as Sample).sqrt()
}

/// Check if a block contains only zeros.
///
/// Returns `false` as soon as a non-zero value is encountered.
pub fn has_only_zeros(block: &[Sample]) -> bool {
    block.iter().all(|&x| x == 0.0)
}

/// Raised cosine with the given period, evaluated at `x`.
///
/// The result ranges from 0 to 1; `x = 0` gives 1.
#[inline]
pub fn raised_cosine(x: Sample, period: Sample) -> Sample {
    (x * 2.0 * std::f32::consts::PI / period).cos() * 0.5 + 0.5
}
