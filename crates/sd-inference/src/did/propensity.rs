//! Cohort propensity scores from a categorical regression of cohort
//! membership on the confounder.
//!
//! The model `G ~ 1 + X` is handed to a [`PosteriorSampler`]. For every
//! posterior draw the predicted probability array `[draw, unit, category]`
//! is evaluated; a unit's propensity score is the posterior mean of the
//! probability of the cohort it was actually observed in.

use sd_core::{Error, LogDensityModel, PosteriorSampler, Result};
use serde::{Deserialize, Serialize};

use super::panel::Panel;
use crate::laplace::LaplaceConfig;
use crate::regression::MultinomialLogitModel;

/// Propensity model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PropensityConfig {
    /// Standard deviation of the Normal prior on every coefficient.
    pub prior_sd: f64,
    /// Sampler settings used by the CLI when it builds the default sampler.
    pub sampler: LaplaceConfig,
}

impl Default for PropensityConfig {
    fn default() -> Self {
        Self { prior_sd: 5.0, sampler: LaplaceConfig::default() }
    }
}

/// Predicted probabilities, flat `[draw, unit, category]`.
#[derive(Debug, Clone)]
pub struct ProbabilityArray {
    n_draws: usize,
    n_units: usize,
    n_categories: usize,
    data: Vec<f64>,
}

impl ProbabilityArray {
    /// Shape `(draws, units, categories)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.n_draws, self.n_units, self.n_categories)
    }

    /// `P(unit i in category k)` under draw `d`.
    #[inline]
    pub fn at(&self, d: usize, i: usize, k: usize) -> f64 {
        self.data[(d * self.n_units + i) * self.n_categories + k]
    }

    /// Posterior mean over draws of `[.., i, category_of[i]]`.
    pub fn mean_of_selected(&self, category_of: &[usize]) -> Vec<f64> {
        (0..self.n_units)
            .map(|i| {
                (0..self.n_draws).map(|d| self.at(d, i, category_of[i])).sum::<f64>()
                    / self.n_draws as f64
            })
            .collect()
    }

    /// Posterior mean probability matrix (unit × category).
    pub fn mean_matrix(&self) -> Vec<Vec<f64>> {
        (0..self.n_units)
            .map(|i| {
                (0..self.n_categories)
                    .map(|k| {
                        (0..self.n_draws).map(|d| self.at(d, i, k)).sum::<f64>()
                            / self.n_draws as f64
                    })
                    .collect()
            })
            .collect()
    }
}

/// Estimated propensity of one unit's observed cohort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitPropensity {
    /// Unit identifier.
    pub id: u64,
    /// Observed cohort (`None` = never treated).
    pub cohort: Option<u32>,
    /// Posterior mean probability of the observed cohort.
    pub prop_score: f64,
}

/// Output of [`estimate_propensity`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropensityEstimate {
    /// Model categories in column order; the first is the reference.
    pub categories: Vec<Option<u32>>,
    /// Posterior mean of every coefficient, by name.
    pub coefficients: Vec<(String, f64)>,
    /// Per-unit scores in panel order.
    pub scores: Vec<UnitPropensity>,
    /// Posterior mean probability matrix (unit × category).
    pub mean_probabilities: Vec<Vec<f64>>,
    /// Number of posterior draws used.
    pub n_draws: usize,
    /// Sampler that produced the draws.
    pub sampler: String,
}

fn category_label(c: Option<u32>) -> String {
    match c {
        Some(g) => g.to_string(),
        None => "never".to_string(),
    }
}

/// Build the categorical model `G ~ 1 + X` for a panel.
///
/// Categories are never-treated (reference, when present) followed by the
/// cohorts in adoption order.
pub fn cohort_model(
    panel: &Panel,
    prior_sd: f64,
) -> Result<(MultinomialLogitModel, Vec<Option<u32>>, Vec<usize>)> {
    let mut categories: Vec<Option<u32>> = Vec::new();
    if panel.has_never_treated() {
        categories.push(None);
    }
    categories.extend(panel.cohorts().iter().map(|&g| Some(g)));
    if categories.len() < 2 {
        return Err(Error::Validation(
            "propensity model needs at least two observed cohorts".to_string(),
        ));
    }

    let category_of: Vec<usize> = panel
        .units()
        .iter()
        .map(|u| categories.iter().position(|&c| c == u.cohort).unwrap_or(0))
        .collect();
    let x: Vec<Vec<f64>> = panel.units().iter().map(|u| vec![u.x]).collect();
    let labels = categories.iter().map(|&c| category_label(c)).collect();

    let model = MultinomialLogitModel::new(x, category_of.clone(), labels, prior_sd)?;
    Ok((model, categories, category_of))
}

/// Predicted probability array for every posterior draw.
pub fn predicted_probabilities(
    model: &MultinomialLogitModel,
    draws: &[Vec<f64>],
) -> ProbabilityArray {
    let n_units = model.n_obs();
    let k = model.n_categories();
    let mut data = vec![0.0; draws.len() * n_units * k];
    for (d, params) in draws.iter().enumerate() {
        for i in 0..n_units {
            let start = (d * n_units + i) * k;
            model.predict_row(i, params, &mut data[start..start + k]);
        }
    }
    ProbabilityArray { n_draws: draws.len(), n_units, n_categories: k, data }
}

/// Estimate each unit's propensity of its observed cohort.
pub fn estimate_propensity<S: PosteriorSampler>(
    panel: &Panel,
    sampler: &S,
    config: &PropensityConfig,
    seed: u64,
) -> Result<PropensityEstimate> {
    let (model, categories, category_of) = cohort_model(panel, config.prior_sd)?;
    log::info!(
        "propensity: fitting {} categories on {} units ({} parameters)",
        categories.len(),
        panel.n_units(),
        model.dim()
    );

    let draws = sampler.sample(&model, seed)?;
    if draws.n_draws() == 0 {
        return Err(Error::Computation("sampler returned no draws".to_string()));
    }

    let probs = predicted_probabilities(&model, &draws.draws);
    let prop = probs.mean_of_selected(&category_of);
    if let Some(p) = prop.iter().find(|p| !(p.is_finite() && **p > 0.0)) {
        return Err(Error::Computation(format!("invalid propensity score {p}")));
    }

    let scores = panel
        .units()
        .iter()
        .zip(prop)
        .map(|(u, prop_score)| UnitPropensity { id: u.id, cohort: u.cohort, prop_score })
        .collect();
    let coefficients = draws
        .param_names
        .iter()
        .enumerate()
        .map(|(j, name)| (name.clone(), draws.mean(j)))
        .collect();

    Ok(PropensityEstimate {
        categories,
        coefficients,
        scores,
        mean_probabilities: probs.mean_matrix(),
        n_draws: draws.n_draws(),
        sampler: sampler.name().to_string(),
    })
}
