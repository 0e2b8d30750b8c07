//! Covariate balance of the confounder across cohorts, before and after
//! weighting.
//!
//! Standardized mean differences use the pooled *unweighted* standard
//! deviation as denominator in both columns, so a change in SMD reflects a
//! change in the means only. Density overlays are Gaussian kernel estimates
//! on a common grid, returned as data.

use std::f64::consts::PI;

use sd_core::{Error, Result};
use sd_prob::summary::{quantile_linear, variance, weighted_mean, weighted_variance};
use serde::{Deserialize, Serialize};

use super::panel::Panel;

/// Balance check settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    /// Comparison group; `None` compares against never-treated units, or the
    /// earliest cohort when the panel has none.
    pub reference: Option<u32>,
    /// Number of grid points for the density overlays (0 disables them).
    pub density_grid_points: usize,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self { reference: None, density_grid_points: 64 }
    }
}

/// Balance of one group against the reference group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmdRow {
    /// Compared group (`None` = never treated).
    pub cohort: Option<u32>,
    /// Units in the group.
    pub n: usize,
    /// Unweighted mean of `X` in the group.
    pub mean_unweighted: f64,
    /// Weighted mean of `X` in the group.
    pub mean_weighted: f64,
    /// Unweighted standardized mean difference.
    pub smd_unweighted: f64,
    /// Weighted standardized mean difference.
    pub smd_weighted: f64,
    /// Unweighted variance ratio (group / reference).
    pub variance_ratio_unweighted: f64,
    /// Weighted variance ratio (group / reference).
    pub variance_ratio_weighted: f64,
}

/// Kernel density of `X` for one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DensityCurve {
    /// Group (`None` = never treated).
    pub cohort: Option<u32>,
    /// Whether the IPW weights were applied.
    pub weighted: bool,
    /// Kernel bandwidth.
    pub bandwidth: f64,
    /// Density at each grid point.
    pub density: Vec<f64>,
}

/// Output of [`check_balance`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceReport {
    /// Reference group.
    pub reference: Option<u32>,
    /// Reference group mean (unweighted, weighted).
    pub reference_means: (f64, f64),
    /// One row per non-reference group.
    pub rows: Vec<SmdRow>,
    /// Common grid for the densities.
    pub grid: Vec<f64>,
    /// Weighted and unweighted density per group.
    pub densities: Vec<DensityCurve>,
    /// Largest unweighted |SMD|.
    pub max_abs_smd_unweighted: f64,
    /// Largest weighted |SMD|.
    pub max_abs_smd_weighted: f64,
}

struct Group {
    cohort: Option<u32>,
    x: Vec<f64>,
    w: Vec<f64>,
}

/// Silverman's rule of thumb `0.9 · min(sd, IQR/1.34) · n^(-1/5)`.
pub fn silverman_bandwidth(x: &[f64]) -> f64 {
    let n = x.len();
    if n < 2 {
        return 1.0;
    }
    let sd = variance(x).sqrt();
    let iqr = quantile_linear(x, 0.75) - quantile_linear(x, 0.25);
    let spread = if iqr > 0.0 { sd.min(iqr / 1.34) } else { sd };
    let h = 0.9 * spread * (n as f64).powf(-0.2);
    if h.is_finite() && h > 0.0 { h } else { 1.0 }
}

/// Weighted Gaussian kernel density of `x` evaluated on `grid`.
pub fn kernel_density(x: &[f64], w: &[f64], bandwidth: f64, grid: &[f64]) -> Vec<f64> {
    let sw: f64 = w.iter().sum();
    let norm = 1.0 / (sw * bandwidth * (2.0 * PI).sqrt());
    grid.iter()
        .map(|&g| {
            x.iter()
                .zip(w)
                .map(|(&xi, &wi)| {
                    let z = (g - xi) / bandwidth;
                    wi * (-0.5 * z * z).exp()
                })
                .sum::<f64>()
                * norm
        })
        .collect()
}

/// Compare the confounder distribution of every cohort with the reference
/// group, unweighted and with `unit_weights` (panel unit order).
pub fn check_balance(
    panel: &Panel,
    unit_weights: &[f64],
    config: &BalanceConfig,
) -> Result<BalanceReport> {
    if unit_weights.len() != panel.n_units() {
        return Err(Error::Validation(format!(
            "expected {} unit weights, got {}",
            panel.n_units(),
            unit_weights.len()
        )));
    }
    if unit_weights.iter().any(|w| !(w.is_finite() && *w > 0.0)) {
        return Err(Error::Validation("unit weights must be finite and > 0".to_string()));
    }

    let mut groups: Vec<Group> = panel
        .cohort_sizes()
        .keys()
        .map(|&cohort| Group { cohort, x: Vec::new(), w: Vec::new() })
        .collect();
    for (u, &w) in panel.units().iter().zip(unit_weights) {
        if let Some(g) = groups.iter_mut().find(|g| g.cohort == u.cohort) {
            g.x.push(u.x);
            g.w.push(w);
        }
    }

    let reference_cohort = match config.reference {
        Some(g) => Some(g),
        None if panel.has_never_treated() => None,
        None => Some(
            *panel
                .cohorts()
                .first()
                .ok_or_else(|| Error::Validation("panel has no groups".to_string()))?,
        ),
    };
    let reference = groups
        .iter()
        .find(|g| g.cohort == reference_cohort)
        .ok_or_else(|| {
            Error::Validation(format!("reference group {:?} is empty", reference_cohort))
        })?;
    if reference.x.len() < 2 {
        return Err(Error::Validation("reference group needs at least two units".to_string()));
    }
    let ones = vec![1.0; reference.x.len()];
    let ref_mean_u = weighted_mean(&reference.x, &ones);
    let ref_mean_w = weighted_mean(&reference.x, &reference.w);
    let ref_var_u = variance(&reference.x);
    let ref_var_w = weighted_variance(&reference.x, &reference.w);

    let mut rows = Vec::new();
    for g in groups.iter().filter(|g| g.cohort != reference_cohort) {
        let n = g.x.len();
        let mean_u = g.x.iter().sum::<f64>() / n as f64;
        let mean_w = weighted_mean(&g.x, &g.w);
        let var_u = variance(&g.x);
        let var_w = weighted_variance(&g.x, &g.w);
        let sd_pooled = ((var_u + ref_var_u) / 2.0).sqrt();
        let smd = |m: f64, m_ref: f64| {
            if sd_pooled.is_finite() && sd_pooled > 0.0 {
                (m - m_ref) / sd_pooled
            } else {
                f64::NAN
            }
        };
        rows.push(SmdRow {
            cohort: g.cohort,
            n,
            mean_unweighted: mean_u,
            mean_weighted: mean_w,
            smd_unweighted: smd(mean_u, ref_mean_u),
            smd_weighted: smd(mean_w, ref_mean_w),
            variance_ratio_unweighted: var_u / ref_var_u,
            variance_ratio_weighted: var_w / ref_var_w,
        });
    }

    let max_abs = |f: fn(&SmdRow) -> f64| {
        rows.iter().map(f).filter(|v| v.is_finite()).fold(0.0_f64, |a, v| a.max(v.abs()))
    };
    let max_abs_smd_unweighted = max_abs(|r| r.smd_unweighted);
    let max_abs_smd_weighted = max_abs(|r| r.smd_weighted);

    let (grid, densities) = if config.density_grid_points >= 2 {
        let all_x: Vec<f64> = panel.units().iter().map(|u| u.x).collect();
        let h_all = silverman_bandwidth(&all_x);
        let lo = all_x.iter().copied().fold(f64::INFINITY, f64::min) - 3.0 * h_all;
        let hi = all_x.iter().copied().fold(f64::NEG_INFINITY, f64::max) + 3.0 * h_all;
        let m = config.density_grid_points;
        let step = (hi - lo) / (m - 1) as f64;
        let grid: Vec<f64> = (0..m).map(|k| lo + step * k as f64).collect();

        let mut densities = Vec::with_capacity(2 * groups.len());
        for g in &groups {
            let h = silverman_bandwidth(&g.x);
            let ones = vec![1.0; g.x.len()];
            densities.push(DensityCurve {
                cohort: g.cohort,
                weighted: false,
                bandwidth: h,
                density: kernel_density(&g.x, &ones, h, &grid),
            });
            densities.push(DensityCurve {
                cohort: g.cohort,
                weighted: true,
                bandwidth: h,
                density: kernel_density(&g.x, &g.w, h, &grid),
            });
        }
        (grid, densities)
    } else {
        (Vec::new(), Vec::new())
    };

    log::info!(
        "balance: max |SMD| unweighted={:.3} weighted={:.3}",
        max_abs_smd_unweighted,
        max_abs_smd_weighted
    );

    Ok(BalanceReport {
        reference: reference_cohort,
        reference_means: (ref_mean_u, ref_mean_w),
        rows,
        grid,
        densities,
        max_abs_smd_unweighted,
        max_abs_smd_weighted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::did::panel::tests::toy_panel;
    use crate::did::simulate::{PanelSimConfig, simulate_panel};
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_smd_on_toy_panel() {
        // x = 0.0, 0.1 (never); 0.2, 0.3 (cohort 3).
        let p = toy_panel(&[None, None, Some(3), Some(3)], 4);
        let r = check_balance(&p, &[1.0; 4], &BalanceConfig::default()).unwrap();
        assert_eq!(r.rows.len(), 1);
        let row = &r.rows[0];
        assert_eq!(row.cohort, Some(3));
        // Both groups have variance 0.005; difference in means 0.2.
        assert_abs_diff_eq!(row.smd_unweighted, 0.2 / 0.005_f64.sqrt(), epsilon = 1e-9);
        assert_abs_diff_eq!(row.smd_weighted, row.smd_unweighted, epsilon = 1e-9);
        assert_abs_diff_eq!(row.variance_ratio_unweighted, 1.0, epsilon = 1e-9);
        assert_eq!(r.grid.len(), 64);
        assert_eq!(r.densities.len(), 4);
    }

    #[test]
    fn test_reference_cohort_and_errors() {
        let p = toy_panel(&[None, Some(3), Some(3), Some(4)], 5);
        let cfg = BalanceConfig { reference: Some(3), density_grid_points: 0 };
        let r = check_balance(&p, &[1.0; 4], &cfg).unwrap();
        let cohorts: Vec<_> = r.rows.iter().map(|r| r.cohort).collect();
        assert_eq!(cohorts, vec![None, Some(4)]);
        assert!(r.grid.is_empty());

        assert!(check_balance(&p, &[1.0; 3], &cfg).is_err());
        assert!(check_balance(&p, &[1.0, 1.0, -1.0, 1.0], &cfg).is_err());
        let missing = BalanceConfig { reference: Some(9), ..Default::default() };
        assert!(check_balance(&p, &[1.0; 4], &missing).is_err());
    }

    #[test]
    fn test_default_reference_without_never_treated() {
        let p = toy_panel(&[Some(3), Some(3), Some(4), Some(4)], 5);
        let r = check_balance(&p, &[1.0; 4], &BalanceConfig::default()).unwrap();
        assert_eq!(r.reference, Some(3));
        let cohorts: Vec<_> = r.rows.iter().map(|r| r.cohort).collect();
        assert_eq!(cohorts, vec![Some(4)]);
        assert!(r.rows[0].smd_unweighted.is_finite());
    }

    #[test]
    fn test_density_integrates_to_one() {
        let x = [-1.0, 0.0, 0.5, 2.0];
        let w = [1.0, 2.0, 1.0, 0.5];
        let grid: Vec<f64> = (0..2001).map(|k| -8.0 + 0.008 * k as f64).collect();
        let d = kernel_density(&x, &w, 0.7, &grid);
        let integral: f64 = d.iter().sum::<f64>() * 0.008;
        assert_abs_diff_eq!(integral, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_true_propensity_weights_improve_balance() {
        let cfg = PanelSimConfig { n_units: 3000, ..Default::default() };
        let sim = simulate_panel(&cfg).unwrap();
        let weights: Vec<f64> = sim
            .panel
            .units()
            .iter()
            .map(|u| {
                let p = cfg.cohort_probabilities(u.x).unwrap();
                let k = match u.cohort {
                    None => 0,
                    Some(g) => 1 + cfg.cohorts.iter().position(|&c| c == g).unwrap(),
                };
                1.0 / p[k]
            })
            .collect();
        let r = check_balance(&sim.panel, &weights, &BalanceConfig::default()).unwrap();
        assert!(r.max_abs_smd_unweighted > 0.3, "{}", r.max_abs_smd_unweighted);
        assert!(r.max_abs_smd_weighted < r.max_abs_smd_unweighted);
        let strongest = r.rows.iter().find(|row| row.cohort == Some(4)).unwrap();
        assert!(strongest.smd_weighted.abs() < 0.5 * strongest.smd_unweighted.abs());
    }
}
