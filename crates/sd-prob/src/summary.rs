//! Sample quantiles and (weighted) moments.

use sd_core::{Error, Result};

/// Quantile for sorted data via linear interpolation (Hyndman–Fan type 7).
///
/// - `q=0` returns min
/// - `q=1` returns max
/// - empty input returns `NaN`
pub fn quantile_linear_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }

    let q = q.clamp(0.0, 1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let i = pos.floor() as usize;
    let j = pos.ceil() as usize;
    if i == j {
        return sorted[i];
    }
    let t = pos - i as f64;
    (1.0 - t) * sorted[i] + t * sorted[j]
}

/// Quantile via sorting + linear interpolation.
pub fn quantile_linear(data: &[f64], q: f64) -> f64 {
    if data.is_empty() {
        return f64::NAN;
    }
    let mut v = data.to_vec();
    v.sort_by(f64::total_cmp);
    quantile_linear_sorted(&v, q)
}

/// Central percentile interval, e.g. `conf_level = 0.95` gives the 2.5% and
/// 97.5% quantiles.
pub fn percentile_interval(samples: &[f64], conf_level: f64) -> Result<(f64, f64)> {
    if samples.is_empty() {
        return Err(Error::Validation("percentile_interval requires samples".to_string()));
    }
    if !(conf_level.is_finite() && conf_level > 0.0 && conf_level < 1.0) {
        return Err(Error::Validation(format!("conf_level must be in (0,1), got {conf_level}")));
    }

    let mut v = samples.to_vec();
    v.sort_by(f64::total_cmp);
    let alpha = (1.0 - conf_level) / 2.0;
    Ok((quantile_linear_sorted(&v, alpha), quantile_linear_sorted(&v, 1.0 - alpha)))
}

/// Arithmetic mean (`NaN` on empty input).
pub fn mean(x: &[f64]) -> f64 {
    if x.is_empty() {
        return f64::NAN;
    }
    x.iter().sum::<f64>() / x.len() as f64
}

/// Unbiased sample variance (`NaN` for fewer than two values).
pub fn variance(x: &[f64]) -> f64 {
    if x.len() < 2 {
        return f64::NAN;
    }
    let m = mean(x);
    x.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (x.len() - 1) as f64
}

/// Weighted mean `Σ w x / Σ w`.
pub fn weighted_mean(x: &[f64], w: &[f64]) -> f64 {
    debug_assert_eq!(x.len(), w.len());
    let sw: f64 = w.iter().sum();
    if sw <= 0.0 {
        return f64::NAN;
    }
    x.iter().zip(w).map(|(xi, wi)| xi * wi).sum::<f64>() / sw
}

/// Weighted variance with the reliability-weight correction
/// `Σw / ((Σw)² − Σw²)`, which reduces to [`variance`] for equal weights.
pub fn weighted_variance(x: &[f64], w: &[f64]) -> f64 {
    debug_assert_eq!(x.len(), w.len());
    let sw: f64 = w.iter().sum();
    let sw2: f64 = w.iter().map(|v| v * v).sum();
    let denom = sw * sw - sw2;
    if x.len() < 2 || denom <= 0.0 {
        return f64::NAN;
    }
    let m = weighted_mean(x, w);
    let ss: f64 = x.iter().zip(w).map(|(xi, wi)| wi * (xi - m) * (xi - m)).sum();
    ss * sw / denom
}

/// Kish effective sample size `(Σw)² / Σw²`.
pub fn kish_ess(w: &[f64]) -> f64 {
    let sw: f64 = w.iter().sum();
    let sw2: f64 = w.iter().map(|v| v * v).sum();
    if sw2 <= 0.0 { 0.0 } else { sw * sw / sw2 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_quantile_linear_matches_type7() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_abs_diff_eq!(quantile_linear(&v, 0.0), 1.0);
        assert_abs_diff_eq!(quantile_linear(&v, 1.0), 5.0);
        assert_abs_diff_eq!(quantile_linear(&v, 0.5), 3.0);
        // pos = 0.99 * 4 = 3.96 -> 4 + 0.96 * 1
        let q = quantile_linear(&[5.0, 3.0, 1.0, 2.0, 4.0], 0.99);
        assert_abs_diff_eq!(q, 4.96, epsilon = 1e-12);
        assert!(quantile_linear(&[], 0.5).is_nan());
    }

    #[test]
    fn test_percentile_interval() {
        let v: Vec<f64> = (0..=100).map(|i| i as f64).collect();
        let (lo, hi) = percentile_interval(&v, 0.95).unwrap();
        assert_abs_diff_eq!(lo, 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(hi, 97.5, epsilon = 1e-12);
        assert!(percentile_interval(&v, 1.0).is_err());
        assert!(percentile_interval(&[], 0.9).is_err());
    }

    #[test]
    fn test_equal_weights_reduce_to_unweighted() {
        let x = [1.0, 4.0, 2.0, 8.0, 5.0];
        let w = [2.0; 5];
        assert_abs_diff_eq!(weighted_mean(&x, &w), mean(&x), epsilon = 1e-12);
        assert_abs_diff_eq!(weighted_variance(&x, &w), variance(&x), epsilon = 1e-12);
        assert_abs_diff_eq!(kish_ess(&w), 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_kish_ess_shrinks_with_unequal_weights() {
        assert!(kish_ess(&[1.0, 1.0, 10.0]) < 3.0);
        assert_eq!(kish_ess(&[]), 0.0);
    }
}
