//! Small numerically-stable math utilities used across probability code.

/// Stable sigmoid: `1 / (1 + exp(-x))`.
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    let e = (-x.abs()).exp();
    let recip = 1.0 / (1.0 + e);
    if x >= 0.0 { recip } else { e * recip }
}

/// Stable `log(sum(exp(xs)))`. Empty input gives `-inf`.
pub fn log_sum_exp(xs: &[f64]) -> f64 {
    let m = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !m.is_finite() {
        return m;
    }
    m + xs.iter().map(|&x| (x - m).exp()).sum::<f64>().ln()
}

/// Softmax of `eta` written into `out` (same length).
///
/// Returns `log(sum(exp(eta)))` so callers computing a categorical NLL do not
/// need a second pass.
pub fn softmax_into(eta: &[f64], out: &mut [f64]) -> f64 {
    debug_assert_eq!(eta.len(), out.len());
    let lse = log_sum_exp(eta);
    for (o, &e) in out.iter_mut().zip(eta) {
        *o = (e - lse).exp();
    }
    lse
}

/// Logit: `ln(p / (1 - p))`.
#[inline]
pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}
