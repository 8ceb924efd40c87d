//! Near-field-compensation filter design for circular harmonics
//!
//! The radial term of circular harmonic m for a spherical wave at distance
//! r is, in the Laplace domain, `theta_m(2sr/c) / (2sr/c)^m` with
//! `theta_m` the reverse Bessel polynomial.  Compensating a loudspeaker
//! ring of radius R for a source at distance r therefore yields
//!
//! ```text
//!   H_m(s) = prod_i (s - q_i c / 2r) / (s - q_i c / 2R)     (point source)
//!   H_m(s) = s^m  / prod_i (s - q_i c / 2R)                 (plane wave)
//! ```
//!
//! with `q_i` the roots of `theta_m`.  The roots have negative real parts
//! (the polynomials are Hurwitz), so the bilinear-transformed sections are
//! stable.  Roots are found once per mode at construction time with a
//! Durand-Kerner iteration on the exact integer coefficients; per-distance
//! coefficient updates only rescale and re-discretize the sections.

use rustfft::num_complex::Complex;
use sf_core::SourceModel;

use crate::biquad::SosCoefficients;

/// Relative tolerance deciding that a root is real.
const REAL_ROOT_EPS: f64 = 1e-8;

/// Per-mode radius-dependent coefficient generator.
pub struct NfcCoefficients {
    mode: usize,
    sample_rate: f64,
    array_radius: f64,
    speed_of_sound: f64,
    /// Roots of theta_mode, conjugate pairs first, real root (odd modes)
    /// last
    roots: Vec<Complex<f64>>,
    sections: Vec<SosCoefficients>,
}

impl NfcCoefficients {
    /// Number of second-order sections used for the given mode.
    pub fn sections_for_mode(mode: usize) -> usize {
        if mode == 0 {
            1
        } else {
            (mode + 1) / 2
        }
    }

    pub fn new(mode: usize, sample_rate: f64, array_radius: f64, speed_of_sound: f64) -> Self {
        let roots = bessel_roots(mode);
        log::debug!(
            "NFC mode {}: {} prototype roots, {} sections",
            mode,
            roots.len(),
            Self::sections_for_mode(mode)
        );
        let sections = vec![SosCoefficients::identity(); Self::sections_for_mode(mode)];

        Self {
            mode,
            sample_rate,
            array_radius,
            speed_of_sound,
            roots,
            sections,
        }
    }

    /// Recompute the sections for a source at `distance` meters.
    ///
    /// For plane waves the distance is ignored.
    pub fn reset(&mut self, distance: f64, model: SourceModel) {
        self.sections.clear();

        if self.mode == 0 {
            self.sections.push(SosCoefficients::identity());
            return;
        }

        let pole_scale = self.speed_of_sound / (2.0 * self.array_radius);
        let zero_scale = self.speed_of_sound / (2.0 * distance.max(f64::MIN_POSITIVE));
        let k = 2.0 * self.sample_rate;

        for &q in &self.roots {
            if q.im <= REAL_ROOT_EPS * q.norm() {
                continue;
            }
            // Conjugate pair: (s - p)(s - p*) = s^2 - 2 Re(p) s + |p|^2
            let p = q * pole_scale;
            let (den2, den1, den0) = (1.0, -2.0 * p.re, p.norm_sqr());
            let (num2, num1, num0) = match model {
                SourceModel::Point => {
                    let z = q * zero_scale;
                    (1.0, -2.0 * z.re, z.norm_sqr())
                }
                SourceModel::Plane => (1.0, 0.0, 0.0),
            };
            self.sections
                .push(bilinear(num2, num1, num0, den2, den1, den0, k));
        }

        if self.mode % 2 == 1 {
            // The single real root becomes a first-order section.
            let q = self
                .roots
                .iter()
                .min_by(|a, b| a.im.abs().total_cmp(&b.im.abs()))
                .copied()
                .unwrap_or(Complex::new(-1.0, 0.0));
            let p = q.re * pole_scale;
            let (den2, den1, den0) = (0.0, 1.0, -p);
            let (num2, num1, num0) = match model {
                SourceModel::Point => (0.0, 1.0, -q.re * zero_scale),
                SourceModel::Plane => (0.0, 1.0, 0.0),
            };
            self.sections
                .push(bilinear(num2, num1, num0, den2, den1, den0, k));
        }

        debug_assert_eq!(self.sections.len(), Self::sections_for_mode(self.mode));
    }

    pub fn sections(&self) -> &[SosCoefficients] {
        &self.sections
    }
}

/// Bilinear transform of `(num2 s^2 + num1 s + num0) / (den2 s^2 + ...)`
/// with `s = k (1 - z^-1) / (1 + z^-1)`.
fn bilinear(
    num2: f64,
    num1: f64,
    num0: f64,
    den2: f64,
    den1: f64,
    den0: f64,
    k: f64,
) -> SosCoefficients {
    let kk = k * k;
    let b0 = num2 * kk + num1 * k + num0;
    let b1 = 2.0 * num0 - 2.0 * num2 * kk;
    let b2 = num2 * kk - num1 * k + num0;
    let a0 = den2 * kk + den1 * k + den0;
    let a1 = 2.0 * den0 - 2.0 * den2 * kk;
    let a2 = den2 * kk - den1 * k + den0;

    SosCoefficients {
        b0: b0 / a0,
        b1: b1 / a0,
        b2: b2 / a0,
        a1: a1 / a0,
        a2: a2 / a0,
    }
}

/// Coefficients of the reverse Bessel polynomial theta_n in ascending
/// powers; monic.
fn bessel_polynomial(n: usize) -> Vec<f64> {
    // theta_0 = 1, theta_1 = s + 1,
    // theta_n = (2n - 1) theta_{n-1} + s^2 theta_{n-2}
    let mut prev = vec![1.0];
    if n == 0 {
        return prev;
    }
    let mut cur = vec![1.0, 1.0];
    for order in 2..=n {
        let mut next = vec![0.0; order + 1];
        for (i, &c) in cur.iter().enumerate() {
            next[i] += (2 * order - 1) as f64 * c;
        }
        for (i, &c) in prev.iter().enumerate() {
            next[i + 2] += c;
        }
        prev = cur;
        cur = next;
    }
    cur
}

/// All roots of theta_n, found by Durand-Kerner iteration.
///
/// Runs at construction time only (non-realtime).
fn bessel_roots(n: usize) -> Vec<Complex<f64>> {
    if n == 0 {
        return Vec::new();
    }

    let coeffs = bessel_polynomial(n);
    let eval = |x: Complex<f64>| {
        let mut y = Complex::new(0.0, 0.0);
        for &c in coeffs.iter().rev() {
            y = y * x + c;
        }
        y
    };

    // Standard starting values on a non-real spiral.
    let seed = Complex::new(0.4, 0.9);
    let mut roots: Vec<Complex<f64>> = (0..n)
        .scan(Complex::new(1.0, 0.0), |acc, _| {
            *acc *= seed;
            Some(*acc)
        })
        .collect();

    for _ in 0..500 {
        let mut max_step: f64 = 0.0;
        for i in 0..n {
            let mut denom = Complex::new(1.0, 0.0);
            for j in 0..n {
                if i != j {
                    denom *= roots[i] - roots[j];
                }
            }
            let step = eval(roots[i]) / denom;
            roots[i] -= step;
            max_step = max_step.max(step.norm() / (1.0 + roots[i].norm()));
        }
        if max_step < 1e-13 {
            break;
        }
    }

    // Clean up: force exact conjugate symmetry by averaging pairs.
    for root in &mut roots {
        if root.im.abs() < REAL_ROOT_EPS * root.norm() {
            root.im = 0.0;
        }
    }

    roots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biquad::Cascade;

    #[test]
    fn test_bessel_polynomials() {
        assert_eq!(bessel_polynomial(0), vec![1.0]);
        assert_eq!(bessel_polynomial(1), vec![1.0, 1.0]);
        assert_eq!(bessel_polynomial(2), vec![3.0, 3.0, 1.0]);
        assert_eq!(bessel_polynomial(3), vec![15.0, 15.0, 6.0, 1.0]);
    }

    #[test]
    fn test_known_roots() {
        let roots = bessel_roots(1);
        assert_eq!(roots.len(), 1);
        assert!((roots[0] - Complex::new(-1.0, 0.0)).norm() < 1e-9);

        // theta_2 = s^2 + 3s + 3 with roots (-3 +- j sqrt(3)) / 2
        let mut roots = bessel_roots(2);
        roots.sort_by(|a, b| a.im.total_cmp(&b.im));
        assert!((roots[0] - Complex::new(-1.5, -(3.0f64).sqrt() / 2.0)).norm() < 1e-9);
        assert!((roots[1] - Complex::new(-1.5, (3.0f64).sqrt() / 2.0)).norm() < 1e-9);
    }

    #[test]
    fn test_roots_are_hurwitz_up_to_high_orders() {
        for n in 1..=16 {
            let roots = bessel_roots(n);
            assert_eq!(roots.len(), n);
            for root in roots {
                assert!(root.re < 0.0, "order {n}: root {root} not in left half-plane");
            }
        }
    }

    #[test]
    fn test_mode_zero_is_identity() {
        let mut coeffs = NfcCoefficients::new(0, 44100.0, 1.5, 343.0);
        coeffs.reset(2.0, SourceModel::Point);
        assert_eq!(coeffs.sections(), &[SosCoefficients::identity()]);
    }

    #[test]
    fn test_point_source_dc_gain() {
        // DC gain of the mode-m point filter is (R / r)^m.
        for (mode, distance) in [(1usize, 3.0f64), (2, 2.0), (3, 4.5)] {
            let radius = 1.5;
            let mut coeffs = NfcCoefficients::new(mode, 44100.0, radius, 343.0);
            coeffs.reset(distance, SourceModel::Point);

            let mut cascade = Cascade::new(coeffs.sections().len());
            cascade.set_coefficients(coeffs.sections());

            let mut y = 0.0;
            for _ in 0..40_000 {
                y = cascade.process_sample(1.0);
            }
            let expected = (radius / distance).powi(mode as i32);
            assert!(
                (y - expected).abs() < 1e-3 * expected.max(1e-3),
                "mode {mode}: {y} vs {expected}"
            );
        }
    }

    #[test]
    fn test_plane_wave_blocks_dc() {
        let mut coeffs = NfcCoefficients::new(2, 44100.0, 1.5, 343.0);
        coeffs.reset(10.0, SourceModel::Plane);

        let mut cascade = Cascade::new(coeffs.sections().len());
        cascade.set_coefficients(coeffs.sections());

        let mut y = 1.0;
        for _ in 0..40_000 {
            y = cascade.process_sample(1.0);
        }
        assert!(y.abs() < 1e-6, "DC should be blocked, got {y}");
    }

    #[test]
    fn test_cascade_is_stable() {
        let mut coeffs = NfcCoefficients::new(7, 48000.0, 1.5, 343.0);
        coeffs.reset(5.0, SourceModel::Point);

        let mut cascade = Cascade::new(coeffs.sections().len());
        cascade.set_coefficients(coeffs.sections());

        let mut peak = 0.0f64;
        for i in 0..48_000 {
            let x = if i == 0 { 1.0 } else { 0.0 };
            peak = peak.max(cascade.process_sample(x).abs());
        }
        let mut tail = 0.0f64;
        for _ in 0..4800 {
            tail = tail.max(cascade.process_sample(0.0).abs());
        }
        assert!(tail < peak * 1e-3, "impulse response does not decay");
    }
}
