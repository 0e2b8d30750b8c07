//! Group-time average treatment effects (Callaway & Sant'Anna, 2021).
//!
//! `ATT(g, t)` compares the outcome change from the base period to `t` of
//! cohort `g` with that of a control group, either unconditionally or with
//! the controls reweighted by the odds of a logistic propensity on `X`.
//! Standard errors come from influence functions. Under IPW the influence
//! function carries the linearised effect of estimating the propensity, so
//! intervals stay calibrated when `X` drives the trends.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use nalgebra::{Matrix2, Vector2};

use sd_core::{Error, Result};
use sd_prob::normal::std_quantile;
use serde::{Deserialize, Serialize};

use super::panel::Panel;
use crate::optimizer::{LbfgsOptimizer, OptimizerConfig};
use crate::regression::MultinomialLogitModel;

/// Comparison units for each `(g, t)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlGroup {
    /// Never-treated units only.
    #[default]
    NeverTreated,
    /// Never-treated units plus cohorts not yet treated at `max(t, base)`.
    NotYetTreated,
}

/// Base period of pre-treatment comparisons.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasePeriod {
    /// `t − 1` before treatment.
    #[default]
    Varying,
    /// Always `g − 1`.
    Universal,
}

/// How control outcome changes are averaged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMethod {
    /// Plain difference of mean changes.
    Unconditional,
    /// Controls weighted by `p(X) / (1 − p(X))`, normalised.
    #[default]
    Ipw,
}

/// Group-time ATT settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttGtConfig {
    /// Control group.
    pub control_group: ControlGroup,
    /// Base period rule for pre-periods.
    pub base_period: BasePeriod,
    /// Estimator.
    pub method: EstimationMethod,
    /// Confidence level of the pointwise intervals.
    pub conf_level: f64,
    /// Prior sd of the logistic propensity coefficients.
    pub propensity_prior_sd: f64,
    /// Optimizer for the propensity fit.
    pub optimizer: OptimizerConfig,
}

impl Default for AttGtConfig {
    fn default() -> Self {
        Self {
            control_group: ControlGroup::NeverTreated,
            base_period: BasePeriod::Varying,
            method: EstimationMethod::Ipw,
            conf_level: 0.95,
            propensity_prior_sd: 10.0,
            optimizer: OptimizerConfig::default(),
        }
    }
}

/// One group-time estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupTimeAtt {
    /// Cohort.
    pub cohort: u32,
    /// Calendar period.
    pub period: u32,
    /// Base period.
    pub base_period: u32,
    /// `period − cohort`.
    pub event_time: i64,
    /// Point estimate.
    pub att: f64,
    /// Standard error.
    pub se: f64,
    /// Lower confidence bound.
    pub ci_lower: f64,
    /// Upper confidence bound.
    pub ci_upper: f64,
    /// Treated units.
    pub n_treated: usize,
    /// Control units.
    pub n_control: usize,
}

/// All group-time estimates of a panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttGtResult {
    /// Units in the panel.
    pub n_units: usize,
    /// Confidence level.
    pub conf_level: f64,
    /// Estimates ordered by cohort then period.
    pub estimates: Vec<GroupTimeAtt>,
    /// Units per cohort.
    pub cohort_sizes: Vec<(u32, usize)>,
    /// Influence function of each estimate over all units.
    #[serde(skip)]
    pub influence: Vec<Vec<f64>>,
}

/// Dynamic (event-time) aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicAtt {
    /// Event time.
    pub event_time: i64,
    /// Aggregated ATT.
    pub att: f64,
    /// Standard error.
    pub se: f64,
    /// Lower confidence bound.
    pub ci_lower: f64,
    /// Upper confidence bound.
    pub ci_upper: f64,
    /// Cohorts contributing.
    pub n_cohorts: usize,
}

/// Event-time profile plus the overall post-treatment average.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicAggregate {
    /// One entry per event time, ascending.
    pub effects: Vec<DynamicAtt>,
    /// Mean of the post-treatment (`e ≥ 0`) effects.
    pub overall_att: f64,
    /// Standard error of `overall_att`.
    pub overall_se: f64,
    /// Confidence interval of `overall_att`.
    pub overall_ci: (f64, f64),
}

struct PairEstimate {
    att: f64,
    influence: Vec<f64>,
    n_treated: usize,
    n_control: usize,
}

fn z_crit(conf_level: f64) -> f64 {
    std_quantile(0.5 * (1.0 + conf_level))
}

fn se_from_influence(influence: &[f64]) -> f64 {
    let n = influence.len() as f64;
    influence.iter().map(|v| v * v).sum::<f64>().sqrt() / n
}

/// Control-group membership by cohort for the comparison `(g, t)` with base `b`.
fn is_control(cohort: Option<u32>, g: u32, t: u32, b: u32, rule: ControlGroup) -> bool {
    match (cohort, rule) {
        (None, _) => true,
        (Some(_), ControlGroup::NeverTreated) => false,
        (Some(c), ControlGroup::NotYetTreated) => c != g && c > t.max(b),
    }
}

/// Logistic propensity of treated vs. control on `X` for one comparison.
struct OddsFit {
    /// `p/(1−p)` of each control unit.
    weights: Vec<f64>,
    /// Fitted propensity of every unit in the fit, controls first.
    prob: Vec<f64>,
    /// Inverse information of `(intercept, slope)`.
    inv_info: Matrix2<f64>,
}

fn fit_odds(
    panel: &Panel,
    treated: &[usize],
    controls: &[usize],
    config: &AttGtConfig,
) -> Result<OddsFit> {
    let units = panel.units();
    let members: Vec<usize> = controls.iter().chain(treated).copied().collect();
    let x: Vec<Vec<f64>> = members.iter().map(|&j| vec![units[j].x]).collect();
    let y: Vec<usize> = (0..members.len()).map(|k| usize::from(k >= controls.len())).collect();
    let model = MultinomialLogitModel::new(
        x,
        y,
        vec!["control".to_string(), "treated".to_string()],
        config.propensity_prior_sd,
    )?;
    let opt = LbfgsOptimizer::new(config.optimizer.clone()).minimize_model(&model)?;

    let mut row = [0.0; 2];
    let mut prob = Vec::with_capacity(members.len());
    let prior_prec = 1.0 / (config.propensity_prior_sd * config.propensity_prior_sd);
    let mut info = Matrix2::from_diagonal_element(prior_prec);
    for (k, &j) in members.iter().enumerate() {
        model.predict_row(k, &opt.parameters, &mut row);
        let p = row[1].clamp(1e-12, 1.0 - 1e-12);
        let xt = Vector2::new(1.0, units[j].x);
        info += xt * xt.transpose() * (p * (1.0 - p));
        prob.push(p);
    }
    let inv_info = info.try_inverse().ok_or_else(|| {
        Error::Computation("singular information in the propensity fit".to_string())
    })?;
    let weights = prob[..controls.len()].iter().map(|p| p / (1.0 - p)).collect();
    Ok(OddsFit { weights, prob, inv_info })
}

fn estimate_pair(
    delta: &[f64],
    x: &[f64],
    treated: &[usize],
    controls: &[usize],
    odds: Option<&OddsFit>,
) -> PairEstimate {
    let ones;
    let control_w: &[f64] = match odds {
        Some(fit) => &fit.weights,
        None => {
            ones = vec![1.0; controls.len()];
            &ones
        }
    };
    let n = delta.len() as f64;
    let n_t = treated.len() as f64;
    let m_t = treated.iter().map(|&j| delta[j]).sum::<f64>() / n_t;
    let sw: f64 = control_w.iter().sum();
    let m_c = controls.iter().zip(control_w).map(|(&j, w)| w * delta[j]).sum::<f64>() / sw;

    let mut influence = vec![0.0; delta.len()];
    for &j in treated {
        influence[j] = n / n_t * (delta[j] - m_t);
    }
    for (&j, w) in controls.iter().zip(control_w) {
        influence[j] = -n * w / sw * (delta[j] - m_c);
    }

    if let Some(fit) = odds {
        // Gradient of the ATT in the logistic coefficients, through the odds.
        let mut grad = Vector2::<f64>::zeros();
        for (&j, w) in controls.iter().zip(control_w) {
            grad -= Vector2::new(1.0, x[j]) * (w * (delta[j] - m_c) / sw);
        }
        let a = fit.inv_info * grad;
        let labelled = controls.iter().map(|&j| (j, 0.0)).chain(treated.iter().map(|&j| (j, 1.0)));
        for ((j, d), p) in labelled.zip(&fit.prob) {
            influence[j] += n * (d - p) * (a[0] + a[1] * x[j]);
        }
    }

    PairEstimate {
        att: m_t - m_c,
        influence,
        n_treated: treated.len(),
        n_control: controls.len(),
    }
}

/// Estimate `ATT(g, t)` for every cohort and period of the panel.
pub fn estimate_att_gt(panel: &Panel, config: &AttGtConfig) -> Result<AttGtResult> {
    if !(config.conf_level > 0.0 && config.conf_level < 1.0) {
        return Err(Error::Validation(format!(
            "conf_level must be in (0,1), got {}",
            config.conf_level
        )));
    }
    if panel.cohorts().is_empty() {
        return Err(Error::Validation("panel has no treated cohorts".to_string()));
    }

    let n_units = panel.n_units();
    let z = z_crit(config.conf_level);
    let sizes = panel.cohort_sizes();
    let mut estimates = Vec::new();
    let mut influence = Vec::new();
    let x: Vec<f64> = panel.units().iter().map(|u| u.x).collect();
    let mut odds_cache: BTreeMap<(u32, Vec<usize>), OddsFit> = BTreeMap::new();

    for &g in panel.cohorts() {
        let treated: Vec<usize> =
            (0..n_units).filter(|&j| panel.units()[j].cohort == Some(g)).collect();
        for t in 1..=panel.n_periods() {
            let b = if t >= g {
                g - 1
            } else {
                match config.base_period {
                    BasePeriod::Varying => t - 1,
                    BasePeriod::Universal => g - 1,
                }
            };
            if b < 1 || b == t {
                continue;
            }

            let controls: Vec<usize> = (0..n_units)
                .filter(|&j| is_control(panel.units()[j].cohort, g, t, b, config.control_group))
                .collect();
            if controls.is_empty() || treated.is_empty() {
                log::debug!("att_gt: skipping (g={g}, t={t}): no comparison units");
                continue;
            }

            let delta = (0..n_units)
                .map(|j| Some(panel.y(j, t)? - panel.y(j, b)?))
                .collect::<Option<Vec<f64>>>()
                .ok_or_else(|| {
                    Error::Validation(format!("periods {b} and {t} must lie in the panel"))
                })?;
            let odds = match config.method {
                EstimationMethod::Unconditional => None,
                EstimationMethod::Ipw => {
                    let fit = match odds_cache.entry((g, controls.clone())) {
                        Entry::Occupied(e) => e.into_mut(),
                        Entry::Vacant(e) => {
                            e.insert(fit_odds(panel, &treated, &controls, config)?)
                        }
                    };
                    Some(&*fit)
                }
            };

            let pair = estimate_pair(&delta, &x, &treated, &controls, odds);
            let se = se_from_influence(&pair.influence);
            if !pair.att.is_finite() {
                return Err(Error::Computation(format!("non-finite ATT at (g={g}, t={t})")));
            }
            estimates.push(GroupTimeAtt {
                cohort: g,
                period: t,
                base_period: b,
                event_time: i64::from(t) - i64::from(g),
                att: pair.att,
                se,
                ci_lower: pair.att - z * se,
                ci_upper: pair.att + z * se,
                n_treated: pair.n_treated,
                n_control: pair.n_control,
            });
            influence.push(pair.influence);
        }
    }

    if estimates.is_empty() {
        return Err(Error::Computation("no group-time ATT could be estimated".to_string()));
    }
    log::debug!("att_gt: {} group-time estimates", estimates.len());

    Ok(AttGtResult {
        n_units,
        conf_level: config.conf_level,
        estimates,
        cohort_sizes: panel.cohorts().iter().map(|&g| (g, sizes[&Some(g)])).collect(),
        influence,
    })
}

/// Aggregate group-time effects by event time with cohort-size weights.
pub fn aggregate_dynamic(result: &AttGtResult) -> Result<DynamicAggregate> {
    if result.influence.len() != result.estimates.len() {
        return Err(Error::Validation(
            "influence functions are missing (deserialized result?)".to_string(),
        ));
    }
    let z = z_crit(result.conf_level);
    let size_of = |g: u32| {
        result.cohort_sizes.iter().find(|(c, _)| *c == g).map(|&(_, n)| n as f64).unwrap_or(0.0)
    };

    let mut by_e: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (k, est) in result.estimates.iter().enumerate() {
        by_e.entry(est.event_time).or_default().push(k);
    }

    let mut effects = Vec::with_capacity(by_e.len());
    let mut post_influence: Vec<Vec<f64>> = Vec::new();
    for (&e, members) in &by_e {
        let total: f64 = members.iter().map(|&k| size_of(result.estimates[k].cohort)).sum();
        if !(total > 0.0) {
            return Err(Error::Computation(format!("no cohort weight at event time {e}")));
        }
        let mut att = 0.0;
        let mut inf = vec![0.0; result.n_units];
        for &k in members {
            let w = size_of(result.estimates[k].cohort) / total;
            att += w * result.estimates[k].att;
            for (acc, v) in inf.iter_mut().zip(&result.influence[k]) {
                *acc += w * v;
            }
        }
        let se = se_from_influence(&inf);
        effects.push(DynamicAtt {
            event_time: e,
            att,
            se,
            ci_lower: att - z * se,
            ci_upper: att + z * se,
            n_cohorts: members.len(),
        });
        if e >= 0 {
            post_influence.push(inf);
        }
    }

    let post: Vec<&DynamicAtt> = effects.iter().filter(|d| d.event_time >= 0).collect();
    if post.is_empty() {
        return Err(Error::Computation("no post-treatment group-time effects".to_string()));
    }
    let m = post.len() as f64;
    let overall_att = post.iter().map(|d| d.att).sum::<f64>() / m;
    let mut overall_inf = vec![0.0; result.n_units];
    for inf in &post_influence {
        for (acc, v) in overall_inf.iter_mut().zip(inf) {
            *acc += v / m;
        }
    }
    let overall_se = se_from_influence(&overall_inf);

    Ok(DynamicAggregate {
        effects,
        overall_att,
        overall_se,
        overall_ci: (overall_att - z * overall_se, overall_att + z * overall_se),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::did::panel::tests::toy_panel;
    use crate::did::simulate::{PanelSimConfig, simulate_panel};
    use approx::assert_abs_diff_eq;

    fn unconditional() -> AttGtConfig {
        AttGtConfig { method: EstimationMethod::Unconditional, ..Default::default() }
    }

    #[test]
    fn test_exact_effect_on_deterministic_panel() {
        let p = toy_panel(&[None, None, Some(3), Some(3), Some(4)], 5);
        let r = estimate_att_gt(&p, &unconditional()).unwrap();
        // Varying base skips t = 1 only: 4 estimates per cohort.
        assert_eq!(r.estimates.len(), 8);
        for est in &r.estimates {
            let expected = if est.event_time >= 0 { 2.0 } else { 0.0 };
            assert_abs_diff_eq!(est.att, expected, epsilon = 1e-12);
            assert_abs_diff_eq!(est.se, 0.0, epsilon = 1e-12);
            assert_eq!(est.n_control, 2);
        }
        let post = r.estimates.iter().find(|e| e.cohort == 3 && e.period == 5).unwrap();
        assert_eq!(post.base_period, 2);

        let dynamic = aggregate_dynamic(&r).unwrap();
        assert_abs_diff_eq!(dynamic.overall_att, 2.0, epsilon = 1e-12);
        let e0 = dynamic.effects.iter().find(|d| d.event_time == 0).unwrap();
        assert_eq!(e0.n_cohorts, 2);
    }

    #[test]
    fn test_not_yet_treated_and_universal_base() {
        let p = toy_panel(&[None, Some(3), Some(3), Some(5)], 6);
        let cfg = AttGtConfig {
            control_group: ControlGroup::NotYetTreated,
            base_period: BasePeriod::Universal,
            ..unconditional()
        };
        let r = estimate_att_gt(&p, &cfg).unwrap();
        // Cohort 3 at t = 3 (base 2): controls never + cohort 5.
        let e = r.estimates.iter().find(|e| e.cohort == 3 && e.period == 3).unwrap();
        assert_eq!(e.n_control, 2);
        // Cohort 3 at t = 5: cohort 5 already treated.
        let e = r.estimates.iter().find(|e| e.cohort == 3 && e.period == 5).unwrap();
        assert_eq!(e.n_control, 1);
        // Universal base: every pre-period of cohort 5 compares with period 4.
        assert!(r.estimates.iter().filter(|e| e.cohort == 5).all(|e| e.base_period == 4));
        assert!(!r.estimates.iter().any(|e| e.cohort == 5 && e.period == 4));
        for est in &r.estimates {
            let expected = if est.event_time >= 0 { 2.0 } else { 0.0 };
            assert_abs_diff_eq!(est.att, expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_influence_se_matches_two_sample_formula() {
        let cfg = PanelSimConfig { n_units: 300, ..Default::default() };
        let sim = simulate_panel(&cfg).unwrap();
        let r = estimate_att_gt(&sim.panel, &unconditional()).unwrap();
        let est = &r.estimates[r.estimates.len() - 1];
        let (g, t, b) = (est.cohort, est.period, est.base_period);
        let p = &sim.panel;
        let d = |j: usize| p.y(j, t).unwrap() - p.y(j, b).unwrap();
        let tr: Vec<f64> =
            (0..p.n_units()).filter(|&j| p.units()[j].cohort == Some(g)).map(d).collect();
        let co: Vec<f64> =
            (0..p.n_units()).filter(|&j| p.units()[j].cohort.is_none()).map(d).collect();
        let var = |v: &[f64]| {
            let m = v.iter().sum::<f64>() / v.len() as f64;
            v.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / (v.len() as f64).powi(2)
        };
        assert_abs_diff_eq!(est.se, (var(&tr) + var(&co)).sqrt(), epsilon = 1e-10);
    }

    #[test]
    fn test_ipw_removes_confounded_trend_bias() {
        let cfg = PanelSimConfig { n_units: 2000, seed: 21, ..Default::default() };
        let sim = simulate_panel(&cfg).unwrap();
        // Post event times 0..=6, truth 1 + 0.25 e.
        let truth = (0..=6).map(|e| cfg.true_effect(e)).sum::<f64>() / 7.0;

        let ipw = aggregate_dynamic(&estimate_att_gt(&sim.panel, &AttGtConfig::default()).unwrap())
            .unwrap();
        let naive = aggregate_dynamic(&estimate_att_gt(&sim.panel, &unconditional()).unwrap())
            .unwrap();
        assert!((ipw.overall_att - truth).abs() < 0.3, "ipw {} vs {}", ipw.overall_att, truth);
        assert!((ipw.overall_att - truth).abs() < (naive.overall_att - truth).abs());
        assert!(ipw.overall_se > 0.0);
        assert!(ipw.overall_ci.0 < ipw.overall_att && ipw.overall_att < ipw.overall_ci.1);
    }

    #[test]
    fn test_ipw_with_not_yet_treated_controls() {
        let cfg = PanelSimConfig { n_units: 2000, seed: 23, ..Default::default() };
        let sim = simulate_panel(&cfg).unwrap();
        let truth = (0..=6).map(|e| cfg.true_effect(e)).sum::<f64>() / 7.0;
        let ipw_cfg =
            AttGtConfig { control_group: ControlGroup::NotYetTreated, ..Default::default() };
        let naive_cfg = AttGtConfig { method: EstimationMethod::Unconditional, ..ipw_cfg.clone() };

        let r = estimate_att_gt(&sim.panel, &ipw_cfg).unwrap();
        let n_never = sim.panel.units().iter().filter(|u| u.cohort.is_none()).count();
        // Cohort 4 at t = 4 also compares with cohorts 6 and 8.
        let early = r.estimates.iter().find(|e| e.cohort == 4 && e.period == 4).unwrap();
        assert!(early.n_control > n_never);
        assert!(r.estimates.iter().all(|e| e.att.is_finite() && e.se > 0.0));

        let ipw = aggregate_dynamic(&r).unwrap();
        let naive = aggregate_dynamic(&estimate_att_gt(&sim.panel, &naive_cfg).unwrap()).unwrap();
        assert!((ipw.overall_att - truth).abs() < 0.35, "ipw {} vs {}", ipw.overall_att, truth);
        assert!((ipw.overall_att - truth).abs() < (naive.overall_att - truth).abs());
    }

    #[test]
    fn test_ipw_influence_includes_propensity_fit() {
        // Outcome changes that are linear in X are balanced away by the
        // estimated odds, so the corrected influence is smaller than the
        // fixed-weight one.
        let cfg = PanelSimConfig {
            n_units: 1500,
            x_trend: 1.0,
            noise_sd: 0.2,
            seed: 5,
            ..Default::default()
        };
        let sim = simulate_panel(&cfg).unwrap();
        let r = estimate_att_gt(&sim.panel, &AttGtConfig::default()).unwrap();
        let k = r.estimates.iter().position(|e| e.cohort == 4 && e.period == 8).unwrap();
        let est = &r.estimates[k];

        let p = &sim.panel;
        let treated: Vec<usize> =
            (0..p.n_units()).filter(|&j| p.units()[j].cohort == Some(4)).collect();
        let controls: Vec<usize> =
            (0..p.n_units()).filter(|&j| p.units()[j].cohort.is_none()).collect();
        let x: Vec<f64> = p.units().iter().map(|u| u.x).collect();
        let delta: Vec<f64> = (0..p.n_units())
            .map(|j| p.y(j, est.period).unwrap() - p.y(j, est.base_period).unwrap())
            .collect();
        let fit = fit_odds(p, &treated, &controls, &AttGtConfig::default()).unwrap();
        let fixed = estimate_pair(&delta, &x, &treated, &controls, None);
        let mut fixed_w = fixed.influence.clone();
        let sw: f64 = fit.weights.iter().sum();
        let m_c = controls.iter().zip(&fit.weights).map(|(&j, w)| w * delta[j]).sum::<f64>() / sw;
        for (&j, w) in controls.iter().zip(&fit.weights) {
            fixed_w[j] = -(p.n_units() as f64) * w / sw * (delta[j] - m_c);
        }

        let corrected = estimate_pair(&delta, &x, &treated, &controls, Some(&fit));
        assert_abs_diff_eq!(corrected.att, est.att, epsilon = 1e-12);
        assert_abs_diff_eq!(se_from_influence(&corrected.influence), est.se, epsilon = 1e-12);
        assert!(est.se < 0.8 * se_from_influence(&fixed_w), "{} vs fixed weights", est.se);
        assert_eq!(fixed.n_control, controls.len());
    }

    #[test]
    fn test_errors() {
        let never_only = toy_panel(&[None, None], 4);
        assert!(estimate_att_gt(&never_only, &unconditional()).is_err());
        let treated_only = toy_panel(&[Some(3), Some(3)], 4);
        assert!(estimate_att_gt(&treated_only, &unconditional()).is_err());
        let p = toy_panel(&[None, Some(3)], 4);
        let bad = AttGtConfig { conf_level: 1.0, ..unconditional() };
        assert!(estimate_att_gt(&p, &bad).is_err());

        let mut r = estimate_att_gt(&p, &unconditional()).unwrap();
        r.influence.clear();
        assert!(aggregate_dynamic(&r).is_err());
    }
}
