//! Normal distribution utilities.

use statrs::distribution::{ContinuousCDF, Normal};

const PROB_EPS: f64 = 1e-15;

#[inline]
fn standard_normal() -> Normal {
    // Safe by construction for mean=0, sigma=1.
    Normal::new(0.0, 1.0).expect("standard normal should be constructible")
}

/// Standard normal CDF `Φ(z)`.
pub fn std_cdf(z: f64) -> f64 {
    0.5 * statrs::function::erf::erfc(-z / std::f64::consts::SQRT_2)
}

/// Standard normal quantile `Φ⁻¹(p)`, with `p` clipped away from 0 and 1.
pub fn std_quantile(p: f64) -> f64 {
    standard_normal().inverse_cdf(p.clamp(PROB_EPS, 1.0 - PROB_EPS))
}

/// Two-sided p-value of a z statistic: `2 * (1 - Φ(|z|))`.
pub fn two_sided_p_value(z: f64) -> f64 {
    if z.is_nan() {
        return f64::NAN;
    }
    (2.0 * std_cdf(-z.abs())).min(1.0)
}
