//! JSON report of a pipeline run.

use sd_inference::CacheStatus;
use sd_inference::did::{
    AttGtResult, BalanceReport, DynamicAggregate, DynamicProfile, EventStudyFit, EventStudySpec,
    Panel, PropensityEstimate, WeightTable,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct CohortCount {
    pub cohort: Option<u32>,
    pub n_units: usize,
}

#[derive(Debug, Serialize)]
pub struct PanelSummary {
    pub n_units: usize,
    pub n_periods: u32,
    pub n_observations: usize,
    pub cohorts: Vec<CohortCount>,
}

impl PanelSummary {
    pub fn from_panel(panel: &Panel) -> Self {
        Self {
            n_units: panel.n_units(),
            n_periods: panel.n_periods(),
            n_observations: panel.observations().len(),
            cohorts: panel
                .cohort_sizes()
                .into_iter()
                .map(|(cohort, n_units)| CohortCount { cohort, n_units })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PropensitySummary {
    pub sampler: String,
    pub n_draws: usize,
    pub categories: Vec<Option<u32>>,
    pub coefficients: Vec<(String, f64)>,
    pub score_min: f64,
    pub score_max: f64,
}

impl PropensitySummary {
    pub fn from_estimate(est: &PropensityEstimate) -> Self {
        let scores = est.scores.iter().map(|s| s.prop_score);
        Self {
            sampler: est.sampler.clone(),
            n_draws: est.n_draws,
            categories: est.categories.clone(),
            coefficients: est.coefficients.clone(),
            score_min: scores.clone().fold(f64::INFINITY, f64::min),
            score_max: scores.fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WeightSummary {
    pub trim_quantile: f64,
    pub cap: f64,
    pub n_trimmed: usize,
    pub ess_raw: f64,
    pub ess_trimmed: f64,
    pub max_raw_weight: f64,
}

impl WeightSummary {
    pub fn from_table(table: &WeightTable, trim_quantile: f64) -> Self {
        Self {
            trim_quantile,
            cap: table.cap,
            n_trimmed: table.n_trimmed,
            ess_raw: table.ess_raw,
            ess_trimmed: table.ess_trimmed,
            max_raw_weight: table.records.iter().map(|r| r.ipw_weight).fold(0.0, f64::max),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FitSummary {
    pub spec: EventStudySpec,
    pub reference_cohort: Option<u32>,
    pub n_terms: usize,
    pub n_draws: usize,
    pub n_obs: usize,
    pub sigma: f64,
    pub sd_id: f64,
    pub sd_period: f64,
    pub converged: bool,
    pub log_marginal: f64,
    pub cache: &'static str,
}

impl FitSummary {
    pub fn from_fit(fit: &EventStudyFit, cache: Option<CacheStatus>) -> Self {
        Self {
            spec: fit.spec.clone(),
            reference_cohort: fit.reference_cohort,
            n_terms: fit.terms.len(),
            n_draws: fit.draws.n_draws(),
            n_obs: fit.n_obs,
            sigma: fit.sigma,
            sd_id: fit.sd_id,
            sd_period: fit.sd_period,
            converged: fit.converged,
            log_marginal: fit.log_marginal,
            cache: match cache {
                None => "disabled",
                Some(CacheStatus::Hit) => "hit",
                Some(CacheStatus::Miss) => "miss",
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AttGtSummary {
    pub estimates: AttGtResult,
    pub dynamic: DynamicAggregate,
}

#[derive(Debug, Serialize)]
pub struct PipelineReport {
    pub tool_version: &'static str,
    pub panel: PanelSummary,
    pub ground_truth: Vec<(i64, f64)>,
    pub propensity: PropensitySummary,
    pub weights: WeightSummary,
    pub balance: BalanceReport,
    pub event_study: FitSummary,
    pub profile: DynamicProfile,
    pub per_cohort_profile: Option<DynamicProfile>,
    pub att_gt: AttGtSummary,
    pub wall_s: f64,
}
