//! Polygamma helpers for the negative-binomial derivatives.
//!
//! `statrs` supplies `ln_gamma` and `digamma`; the trigamma function is evaluated
//! here by upward recurrence followed by its asymptotic series. The differences
//! `ψ(r + x) − ψ(r)` and `ψ1(r + x) − ψ1(r)` appear scaled by `r` and `r²` in the
//! dispersion derivatives; for moderate integer counts they are summed exactly so
//! that large dispersions neither overflow nor cancel.

use statrs::function::gamma::{digamma, ln_gamma};

/// Counts up to this value use the finite-sum form of the polygamma differences.
const EXACT_SUM_LIMIT: f64 = 256.0;

/// Second derivative of `ln Γ`.
pub fn trigamma(x: f64) -> f64 {
    if x.is_nan() || x <= 0.0 {
        return f64::NAN;
    }
    let mut x = x;
    let mut result = 0.0;
    while x < 12.0 {
        result += 1.0 / (x * x);
        x += 1.0;
    }
    let inv_x = 1.0 / x;
    let inv_x2 = inv_x * inv_x;
    result
        + inv_x
        + 0.5 * inv_x2
        + inv_x
            * inv_x2
            * (1.0 / 6.0 - inv_x2 * (1.0 / 30.0 - inv_x2 * (1.0 / 42.0 - inv_x2 * (1.0 / 30.0))))
}

#[inline]
fn exact_count(x: f64) -> Option<usize> {
    (x >= 0.0 && x <= EXACT_SUM_LIMIT && x.fract() == 0.0).then_some(x as usize)
}

/// `ln Γ(r + x) − ln Γ(r)`.
pub fn ln_gamma_ratio(r: f64, x: f64) -> f64 {
    match exact_count(x) {
        Some(count) => (0..count).map(|k| (r + k as f64).ln()).sum(),
        None => ln_gamma(r + x) - ln_gamma(r),
    }
}

/// `r · (ψ(r + x) − ψ(r))`.
pub fn scaled_digamma_difference(r: f64, x: f64) -> f64 {
    match exact_count(x) {
        Some(count) => (0..count).map(|k| r / (r + k as f64)).sum(),
        None => r * (digamma(r + x) - digamma(r)),
    }
}

/// `r² · (ψ1(r + x) − ψ1(r))`.
pub fn scaled_trigamma_difference(r: f64, x: f64) -> f64 {
    match exact_count(x) {
        Some(count) => -(0..count)
            .map(|k| {
                let q = r / (r + k as f64);
                q * q
            })
            .sum::<f64>(),
        None => r * (r * (trigamma(r + x) - trigamma(r))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use std::f64::consts::PI;

    #[test]
    fn trigamma_matches_known_values() {
        assert_relative_eq!(trigamma(1.0), PI * PI / 6.0, max_relative = 1e-12);
        assert_relative_eq!(trigamma(0.5), PI * PI / 2.0, max_relative = 1e-12);
        assert_relative_eq!(trigamma(2.0), PI * PI / 6.0 - 1.0, max_relative = 1e-12);
        assert!(trigamma(0.0).is_nan());
    }

    #[test]
    fn trigamma_satisfies_recurrence() {
        for &x in &[0.3, 1.7, 5.5, 12.25, 1e3] {
            let lhs = trigamma(x + 1.0);
            let rhs = trigamma(x) - 1.0 / (x * x);
            assert_relative_eq!(lhs, rhs, max_relative = 1e-10);
        }
    }

    #[test]
    fn exact_sums_agree_with_polygamma_differences() {
        for &r in &[0.4, 3.0, 25.0] {
            for &x in &[0.0, 1.0, 7.0, 40.0] {
                let exact = scaled_digamma_difference(r, x);
                let direct = r * (digamma(r + x) - digamma(r));
                assert_relative_eq!(exact, direct, max_relative = 1e-9, epsilon = 1e-12);

                let exact2 = scaled_trigamma_difference(r, x);
                let direct2 = r * r * (trigamma(r + x) - trigamma(r));
                assert_relative_eq!(exact2, direct2, max_relative = 1e-8, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn ln_gamma_ratio_matches_statrs() {
        for &(r, x) in &[(0.3, 0.0), (0.3, 5.0), (17.0, 200.0), (2.0, 3.5), (4.0, 1000.0)] {
            assert_relative_eq!(
                ln_gamma_ratio(r, x),
                ln_gamma(r + x) - ln_gamma(r),
                max_relative = 1e-10,
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn large_dispersion_stays_finite() {
        let r = 1e200;
        let value = scaled_digamma_difference(r, 12.0);
        assert_abs_diff_eq!(value, 12.0, epsilon = 1e-9);
        let curvature = scaled_trigamma_difference(r, 12.0);
        assert_abs_diff_eq!(curvature, -12.0, epsilon = 1e-9);
    }
}
