//! Dynamic event-time profile from event-study draws.
//!
//! For an interacted fit the total effect of cohort `g` at event time `e` is
//! `b_et[e] + b_et[e]:cohort[g]`, the interaction being zero for the
//! reference cohort (or when the model has no such term). The profile at `e`
//! averages the total effects of every cohort that realizes `e`, draw by
//! draw; the point estimate is the mean of those per-draw averages and the
//! interval their central percentile range. The reference event time is
//! reported as exactly zero.

use std::collections::BTreeSet;

use sd_core::{Error, Result};
use sd_prob::summary::{mean, percentile_interval};
use serde::{Deserialize, Serialize};

use super::event_study::{CohortFit, EventStudyFit};

/// How cohorts are combined at each event time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CohortWeighting {
    /// Unweighted mean over cohorts.
    #[default]
    Equal,
    /// Mean weighted by cohort size.
    CohortSize,
}

/// Aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Cohort weighting.
    pub weighting: CohortWeighting,
    /// Credible-interval level.
    pub conf_level: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self { weighting: CohortWeighting::Equal, conf_level: 0.95 }
    }
}

/// Aggregated effect at one event time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTimeEffect {
    /// Event time.
    pub event_time: i64,
    /// Posterior mean.
    pub estimate: f64,
    /// Lower interval bound.
    pub ci_lower: f64,
    /// Upper interval bound.
    pub ci_upper: f64,
    /// Cohorts contributing.
    pub n_cohorts: usize,
    /// True effect, when known.
    pub truth: Option<f64>,
    /// `estimate − truth`.
    pub bias: Option<f64>,
}

/// Total effect of one cohort at one event time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortEffect {
    /// Adoption period.
    pub cohort: u32,
    /// Event time.
    pub event_time: i64,
    /// Posterior mean.
    pub estimate: f64,
    /// Lower interval bound.
    pub ci_lower: f64,
    /// Upper interval bound.
    pub ci_upper: f64,
}

/// Event-time profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicProfile {
    /// Event time fixed at zero.
    pub reference_event_time: i64,
    /// Weighting used across cohorts.
    pub weighting: CohortWeighting,
    /// Interval level.
    pub conf_level: f64,
    /// One entry per event time, ascending.
    pub effects: Vec<EventTimeEffect>,
    /// Cohort-specific totals (empty for pooled fits).
    pub cohort_effects: Vec<CohortEffect>,
}

impl DynamicProfile {
    /// Effect at event time `e`.
    pub fn at(&self, e: i64) -> Option<&EventTimeEffect> {
        self.effects.iter().find(|x| x.event_time == e)
    }

    /// Attach true effects; event times without truth are treated as zero
    /// when negative and left unset otherwise.
    pub fn with_truth(mut self, truth: &[(i64, f64)]) -> Self {
        for eff in &mut self.effects {
            let t = truth
                .iter()
                .find(|(e, _)| *e == eff.event_time)
                .map(|&(_, v)| v)
                .or(if eff.event_time < 0 { Some(0.0) } else { None });
            eff.truth = t;
            eff.bias = t.map(|v| eff.estimate - v);
        }
        self
    }

    /// Mean absolute bias over event times with a known truth.
    pub fn mean_abs_bias(&self) -> Option<f64> {
        let b: Vec<f64> = self.effects.iter().filter_map(|e| e.bias.map(f64::abs)).collect();
        if b.is_empty() { None } else { Some(mean(&b)) }
    }
}

fn summarize(draws: &[f64], conf_level: f64) -> Result<(f64, f64, f64)> {
    let (lo, hi) = percentile_interval(draws, conf_level)?;
    Ok((mean(draws), lo, hi))
}

fn reference_effect(e: i64, n_cohorts: usize) -> EventTimeEffect {
    EventTimeEffect {
        event_time: e,
        estimate: 0.0,
        ci_lower: 0.0,
        ci_upper: 0.0,
        n_cohorts,
        truth: None,
        bias: None,
    }
}

/// Per-draw weighted mean of aligned columns.
fn combine(columns: &[(Vec<f64>, f64)]) -> Result<Vec<f64>> {
    let n = columns.first().map(|(c, _)| c.len()).unwrap_or(0);
    if columns.iter().any(|(c, _)| c.len() != n) {
        return Err(Error::Validation("cohort draws have different lengths".to_string()));
    }
    let total: f64 = columns.iter().map(|(_, w)| w).sum();
    if !(total > 0.0) {
        return Err(Error::Validation("cohort weights must sum to > 0".to_string()));
    }
    Ok((0..n).map(|d| columns.iter().map(|(c, w)| w * c[d]).sum::<f64>() / total).collect())
}

fn cohort_weight(weighting: CohortWeighting, n_units: usize) -> f64 {
    match weighting {
        CohortWeighting::Equal => 1.0,
        CohortWeighting::CohortSize => n_units as f64,
    }
}

/// Draws of the total effect of cohort `g` at event time `e`.
pub fn total_effect_draws(fit: &EventStudyFit, g: u32, e: i64) -> Result<Vec<f64>> {
    let support = fit
        .cohort(g)
        .ok_or_else(|| Error::Validation(format!("cohort {g} is not in the fit")))?;
    if !support.event_times.contains(&e) {
        return Err(Error::Validation(format!("cohort {g} does not realize event time {e}")));
    }
    if e == fit.reference_event_time {
        return Ok(vec![0.0; fit.draws.n_draws()]);
    }
    let main = fit
        .main_effect_draws(e)
        .ok_or_else(|| Error::Validation(format!("fit has no main effect at event time {e}")))?;
    if fit.reference_cohort == Some(g) {
        return Ok(main);
    }
    match fit.interaction_draws(e, g) {
        Some(inter) => Ok(main.iter().zip(&inter).map(|(m, i)| m + i).collect()),
        None => Ok(main),
    }
}

fn realized_event_times<'a>(supports: impl Iterator<Item = &'a [i64]>) -> Vec<i64> {
    let set: BTreeSet<i64> = supports.flat_map(|s| s.iter().copied()).collect();
    set.into_iter().collect()
}

/// Aggregate a cohort-interacted (or pooled) fit into the dynamic profile via
/// cohort-specific total effects.
pub fn aggregate_interacted(
    fit: &EventStudyFit,
    config: &AggregationConfig,
) -> Result<DynamicProfile> {
    let ref_e = fit.reference_event_time;
    let times = realized_event_times(fit.cohort_support.iter().map(|c| c.event_times.as_slice()));
    let mut effects = Vec::with_capacity(times.len());
    let mut cohort_effects = Vec::new();

    for e in times {
        let cohorts: Vec<_> =
            fit.cohort_support.iter().filter(|c| c.event_times.contains(&e)).collect();
        if e == ref_e {
            effects.push(reference_effect(e, cohorts.len()));
            continue;
        }
        let mut columns = Vec::with_capacity(cohorts.len());
        for c in &cohorts {
            let total = total_effect_draws(fit, c.cohort, e)?;
            let (estimate, ci_lower, ci_upper) = summarize(&total, config.conf_level)?;
            cohort_effects.push(CohortEffect {
                cohort: c.cohort,
                event_time: e,
                estimate,
                ci_lower,
                ci_upper,
            });
            columns.push((total, cohort_weight(config.weighting, c.n_units)));
        }
        let per_draw = combine(&columns)?;
        let (estimate, ci_lower, ci_upper) = summarize(&per_draw, config.conf_level)?;
        effects.push(EventTimeEffect {
            event_time: e,
            estimate,
            ci_lower,
            ci_upper,
            n_cohorts: cohorts.len(),
            truth: None,
            bias: None,
        });
    }

    Ok(DynamicProfile {
        reference_event_time: ref_e,
        weighting: config.weighting,
        conf_level: config.conf_level,
        effects,
        cohort_effects,
    })
}

/// Profile of a pooled fit: the event-time coefficient itself.
pub fn aggregate_pooled(fit: &EventStudyFit, config: &AggregationConfig) -> Result<DynamicProfile> {
    let ref_e = fit.reference_event_time;
    let times = realized_event_times(fit.cohort_support.iter().map(|c| c.event_times.as_slice()));
    let mut effects = Vec::with_capacity(times.len());
    for e in times {
        let n_cohorts = fit.cohort_support.iter().filter(|c| c.event_times.contains(&e)).count();
        if e == ref_e {
            effects.push(reference_effect(e, n_cohorts));
            continue;
        }
        let draws = fit
            .main_effect_draws(e)
            .ok_or_else(|| Error::Validation(format!("fit has no main effect at event time {e}")))?;
        let (estimate, ci_lower, ci_upper) = summarize(&draws, config.conf_level)?;
        effects.push(EventTimeEffect {
            event_time: e,
            estimate,
            ci_lower,
            ci_upper,
            n_cohorts,
            truth: None,
            bias: None,
        });
    }
    Ok(DynamicProfile {
        reference_event_time: ref_e,
        weighting: config.weighting,
        conf_level: config.conf_level,
        effects,
        cohort_effects: Vec::new(),
    })
}

/// Merge per-cohort fits: at each event time, average the cohorts' pooled
/// coefficients draw by draw (draws aligned by index).
pub fn aggregate_cohort_fits(
    fits: &[CohortFit],
    config: &AggregationConfig,
) -> Result<DynamicProfile> {
    let first = fits
        .first()
        .ok_or_else(|| Error::Validation("no per-cohort fits to aggregate".to_string()))?;
    let n_draws = first.fit.draws.n_draws();
    if fits.iter().any(|f| f.fit.draws.n_draws() != n_draws) {
        return Err(Error::Validation("per-cohort fits have different draw counts".to_string()));
    }
    let ref_e = first.fit.reference_event_time;
    if fits.iter().any(|f| f.fit.reference_event_time != ref_e) {
        return Err(Error::Validation("per-cohort fits use different reference times".to_string()));
    }

    let supports: Vec<_> = fits
        .iter()
        .map(|f| {
            f.fit.cohort(f.cohort).ok_or_else(|| {
                Error::Validation(format!("fit for cohort {} lacks its support", f.cohort))
            })
        })
        .collect::<Result<_>>()?;
    let times = realized_event_times(supports.iter().map(|s| s.event_times.as_slice()));

    let mut effects = Vec::with_capacity(times.len());
    let mut cohort_effects = Vec::new();
    for e in times {
        let members: Vec<usize> =
            (0..fits.len()).filter(|&k| supports[k].event_times.contains(&e)).collect();
        if e == ref_e {
            effects.push(reference_effect(e, members.len()));
            continue;
        }
        let mut columns = Vec::with_capacity(members.len());
        for &k in &members {
            let draws = fits[k].fit.main_effect_draws(e).ok_or_else(|| {
                Error::Validation(format!("cohort {} fit has no event time {e}", fits[k].cohort))
            })?;
            let (estimate, ci_lower, ci_upper) = summarize(&draws, config.conf_level)?;
            cohort_effects.push(CohortEffect {
                cohort: fits[k].cohort,
                event_time: e,
                estimate,
                ci_lower,
                ci_upper,
            });
            columns.push((draws, cohort_weight(config.weighting, supports[k].n_units)));
        }
        let per_draw = combine(&columns)?;
        let (estimate, ci_lower, ci_upper) = summarize(&per_draw, config.conf_level)?;
        effects.push(EventTimeEffect {
            event_time: e,
            estimate,
            ci_lower,
            ci_upper,
            n_cohorts: members.len(),
            truth: None,
            bias: None,
        });
    }

    Ok(DynamicProfile {
        reference_event_time: ref_e,
        weighting: config.weighting,
        conf_level: config.conf_level,
        effects,
        cohort_effects,
    })
}
