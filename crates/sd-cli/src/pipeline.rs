//! `staggered pipeline`: simulate → propensity → weights → balance →
//! event study → aggregation, with the group-time ATT alongside.

use anyhow::Result;
use sd_inference::did::{
    EventStudyConfig, EventStudyFit, EventStudySpec, PanelSimConfig, PropensityConfig,
    WeightConfig, aggregate_cohort_fits, aggregate_dynamic, aggregate_interacted,
    aggregate_pooled, check_balance, construct_weights, estimate_att_gt, estimate_propensity,
    fit_event_study, fit_per_cohort, simulate_panel,
};
use sd_inference::{LaplaceSampler, load_or_compute};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Instant;

use crate::config::RunConfig;
use crate::report::{
    AttGtSummary, FitSummary, PanelSummary, PipelineReport, PropensitySummary, WeightSummary,
};

fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    let out = h.finalize();
    let mut s = String::with_capacity(64);
    for b in out {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// Every input that changes the fitted draws.
#[derive(Serialize)]
struct FitKey<'a> {
    seed: u64,
    simulation: &'a PanelSimConfig,
    propensity: &'a PropensityConfig,
    weights: &'a WeightConfig,
    event_study: &'a EventStudyConfig,
}

fn fit_file_name(cfg: &RunConfig) -> Result<String> {
    let spec = match &cfg.event_study.spec {
        EventStudySpec::Pooled => "pooled",
        EventStudySpec::CohortInteracted { .. } => "interacted",
    };
    let key = FitKey {
        seed: cfg.seed,
        simulation: &cfg.simulation,
        propensity: &cfg.propensity,
        weights: &cfg.weights,
        event_study: &cfg.event_study,
    };
    let digest = sha256_hex(&serde_json::to_vec(&key)?);
    Ok(format!("event_study_{}_{}.json", spec, &digest[..16]))
}

pub fn run_pipeline(cfg: &RunConfig, cache_dir: Option<&Path>) -> Result<PipelineReport> {
    let start = Instant::now();

    let sim = simulate_panel(&cfg.simulation)?;
    let panel = &sim.panel;
    tracing::info!(
        units = panel.n_units(),
        periods = panel.n_periods(),
        cohorts = panel.cohorts().len(),
        "panel simulated"
    );

    let sampler = LaplaceSampler::new(cfg.propensity.sampler.clone());
    let propensity = estimate_propensity(panel, &sampler, &cfg.propensity, cfg.seed)?;
    let weights = construct_weights(&propensity.scores, &cfg.weights)?;
    tracing::info!(cap = weights.cap, trimmed = weights.n_trimmed, "weights constructed");

    let balance = check_balance(panel, &weights.unit_weights(panel)?, &cfg.balance)?;
    tracing::info!(
        smd_unweighted = balance.max_abs_smd_unweighted,
        smd_weighted = balance.max_abs_smd_weighted,
        "balance checked"
    );

    let obs_w = weights.observation_weights(panel)?;
    let fit_seed = cfg.seed.wrapping_add(1);
    let fit_now = || fit_event_study(panel, &obs_w, &cfg.event_study, fit_seed);
    let (fit, cache): (EventStudyFit, _) = match cache_dir {
        Some(dir) => {
            let (fit, status) = load_or_compute(&dir.join(fit_file_name(cfg)?), fit_now)?;
            (fit, Some(status))
        }
        None => (fit_now()?, None),
    };
    tracing::info!(draws = fit.draws.n_draws(), converged = fit.converged, "event study fitted");

    let agg = cfg.aggregation.to_config();
    let profile = match fit.spec {
        EventStudySpec::Pooled => aggregate_pooled(&fit, &agg)?,
        EventStudySpec::CohortInteracted { .. } => aggregate_interacted(&fit, &agg)?,
    }
    .with_truth(&sim.ground_truth);

    let per_cohort_profile = if cfg.aggregation.per_cohort {
        let fits = fit_per_cohort(panel, &obs_w, &cfg.event_study, cfg.threads, fit_seed)?;
        tracing::info!(fits = fits.len(), "per-cohort fits complete");
        Some(aggregate_cohort_fits(&fits, &agg)?.with_truth(&sim.ground_truth))
    } else {
        None
    };

    let att = estimate_att_gt(panel, &cfg.att_gt)?;
    let dynamic = aggregate_dynamic(&att)?;
    tracing::info!(overall_att = dynamic.overall_att, se = dynamic.overall_se, "group-time ATT");

    Ok(PipelineReport {
        tool_version: sd_core::VERSION,
        panel: PanelSummary::from_panel(panel),
        ground_truth: sim.ground_truth.clone(),
        propensity: PropensitySummary::from_estimate(&propensity),
        weights: WeightSummary::from_table(&weights, cfg.weights.trim_quantile),
        balance,
        event_study: FitSummary::from_fit(&fit, cache),
        profile,
        per_cohort_profile,
        att_gt: AttGtSummary { estimates: att, dynamic },
        wall_s: start.elapsed().as_secs_f64(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sd_inference::did::EffectProfile;

    #[test]
    fn test_fit_file_name_tracks_fit_inputs() {
        let base = RunConfig::default();
        let name = fit_file_name(&base).unwrap();
        assert!(name.starts_with("event_study_interacted_"));
        assert_eq!(name, fit_file_name(&base.clone()).unwrap());

        let mut effect = base.clone();
        effect.simulation.effect = EffectProfile::Constant { effect: 5.0 };
        let mut trim = base.clone();
        trim.weights.trim_quantile = 0.95;
        let mut draws = base.clone();
        draws.event_study.n_draws = 200;
        let mut prior = base.clone();
        prior.propensity.prior_sd = 2.0;
        for changed in [effect, trim, draws, prior] {
            assert_ne!(fit_file_name(&changed).unwrap(), name);
        }
    }

    #[test]
    fn test_fit_file_name_ignores_reporting_options() {
        let base = RunConfig::default();
        let mut other = base.clone();
        other.threads = 4;
        other.aggregation.per_cohort = true;
        other.balance.density_grid_points = 16;
        assert_eq!(fit_file_name(&base).unwrap(), fit_file_name(&other).unwrap());
    }
}
