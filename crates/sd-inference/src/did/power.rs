//! Monte-Carlo power analysis of the group-time ATT estimator.
//!
//! Each trial runs generate → estimate `ATT(g, t)` → aggregate the dynamic
//! effect → test `z = ATT / SE`. A failure at any stage marks the trial
//! inconclusive: it is logged, excluded from the power denominator, and the
//! batch carries on.

use std::fmt;
use std::time::Instant;

use rayon::prelude::*;
use sd_core::{Error, Result};
use sd_prob::normal::two_sided_p_value;
use serde::{Deserialize, Serialize};

use super::att_gt::{AttGtConfig, aggregate_dynamic, estimate_att_gt};
use super::simulate::{PanelSimConfig, simulate_panel};

/// Power analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Data-generating process; `effect_scale` and `seed` are set per trial.
    pub simulation: PanelSimConfig,
    /// Estimator settings.
    pub att: AttGtConfig,
    /// Multipliers of the true effect profile (0 = null).
    pub effect_scales: Vec<f64>,
    /// Trials per effect scale.
    pub n_trials: usize,
    /// Significance level.
    pub alpha: f64,
    /// Base seed.
    pub seed: u64,
    /// Worker threads (0 = rayon default).
    pub n_threads: usize,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            simulation: PanelSimConfig::default(),
            att: AttGtConfig::default(),
            effect_scales: vec![0.0, 0.25, 0.5, 1.0],
            n_trials: 100,
            alpha: 0.05,
            seed: 2021,
            n_threads: 0,
        }
    }
}

/// Stage of the per-trial pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStage {
    /// Panel simulation.
    Generate,
    /// Group-time ATT estimation.
    Estimate,
    /// Dynamic aggregation.
    Aggregate,
    /// z test.
    Test,
}

impl fmt::Display for TrialStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Generate => "generate",
            Self::Estimate => "estimate",
            Self::Aggregate => "aggregate",
            Self::Test => "test",
        };
        f.write_str(s)
    }
}

/// Result of one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrialOutcome {
    /// The test was carried out.
    Completed {
        /// Overall dynamic ATT.
        estimate: f64,
        /// Its standard error.
        se: f64,
        /// `estimate / se`.
        z: f64,
        /// Two-sided p-value.
        p_value: f64,
        /// `p_value < alpha`.
        rejected: bool,
    },
    /// The trial failed before a test decision.
    Inconclusive {
        /// Failing stage.
        stage: TrialStage,
        /// Error message.
        reason: String,
    },
}

/// One trial with its coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialRecord {
    /// Index into `effect_scales`.
    pub scale_index: usize,
    /// Trial index within the scale.
    pub trial: usize,
    /// Seed used for the simulated panel.
    pub seed: u64,
    /// Outcome.
    pub outcome: TrialOutcome,
}

/// Rejection summary at one effect scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerPoint {
    /// Effect multiplier.
    pub effect_scale: f64,
    /// Trials run.
    pub n_trials: usize,
    /// Trials with a test decision.
    pub n_valid: usize,
    /// Valid trials that rejected.
    pub n_rejected: usize,
    /// Trials that failed.
    pub n_inconclusive: usize,
    /// `n_rejected / n_valid`.
    pub power: Option<f64>,
    /// Monte-Carlo standard error of `power`.
    pub mc_se: Option<f64>,
    /// Mean estimate over valid trials.
    pub mean_estimate: Option<f64>,
}

/// Power curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerResult {
    /// Significance level.
    pub alpha: f64,
    /// One point per effect scale, in input order.
    pub points: Vec<PowerPoint>,
    /// Every trial.
    pub trials: Vec<TrialRecord>,
    /// Wall-clock time in seconds.
    pub wall_s: f64,
}

/// Seed of trial `trial` at scale `scale_index`.
pub fn trial_seed(base: u64, scale_index: usize, trial: usize) -> u64 {
    base.wrapping_add((scale_index as u64) << 32).wrapping_add(trial as u64)
}

fn inconclusive(stage: TrialStage, e: Error) -> TrialOutcome {
    TrialOutcome::Inconclusive { stage, reason: e.to_string() }
}

/// Run a single trial through the pipeline.
pub fn run_trial(config: &PowerConfig, effect_scale: f64, seed: u64) -> TrialOutcome {
    let sim_cfg = PanelSimConfig { effect_scale, seed, ..config.simulation.clone() };
    let sim = match simulate_panel(&sim_cfg) {
        Ok(s) => s,
        Err(e) => return inconclusive(TrialStage::Generate, e),
    };
    let att = match estimate_att_gt(&sim.panel, &config.att) {
        Ok(r) => r,
        Err(e) => return inconclusive(TrialStage::Estimate, e),
    };
    let dynamic = match aggregate_dynamic(&att) {
        Ok(d) => d,
        Err(e) => return inconclusive(TrialStage::Aggregate, e),
    };

    let (estimate, se) = (dynamic.overall_att, dynamic.overall_se);
    if !(estimate.is_finite() && se.is_finite() && se > 0.0) {
        return inconclusive(
            TrialStage::Test,
            Error::Computation(format!("invalid test inputs: estimate={estimate}, se={se}")),
        );
    }
    let z = estimate / se;
    let p_value = two_sided_p_value(z);
    TrialOutcome::Completed { estimate, se, z, p_value, rejected: p_value < config.alpha }
}

fn summarize(effect_scale: f64, trials: &[&TrialRecord]) -> PowerPoint {
    let mut n_rejected = 0;
    let mut estimates = Vec::new();
    for t in trials {
        if let TrialOutcome::Completed { estimate, rejected, .. } = &t.outcome {
            estimates.push(*estimate);
            if *rejected {
                n_rejected += 1;
            }
        }
    }
    let n_valid = estimates.len();
    let (power, mc_se, mean_estimate) = if n_valid > 0 {
        let p = n_rejected as f64 / n_valid as f64;
        let se = (p * (1.0 - p) / n_valid as f64).sqrt();
        (Some(p), Some(se), Some(estimates.iter().sum::<f64>() / n_valid as f64))
    } else {
        (None, None, None)
    };
    PowerPoint {
        effect_scale,
        n_trials: trials.len(),
        n_valid,
        n_rejected,
        n_inconclusive: trials.len() - n_valid,
        power,
        mc_se,
        mean_estimate,
    }
}

/// Run every trial of the grid in parallel and summarize per effect scale.
pub fn run_power_analysis(config: &PowerConfig) -> Result<PowerResult> {
    if !(config.alpha > 0.0 && config.alpha < 1.0) {
        return Err(Error::Validation(format!("alpha must be in (0,1), got {}", config.alpha)));
    }
    if config.n_trials == 0 {
        return Err(Error::Validation("n_trials must be >= 1".to_string()));
    }
    if config.effect_scales.is_empty() || config.effect_scales.iter().any(|s| !s.is_finite()) {
        return Err(Error::Validation("effect_scales must be non-empty and finite".to_string()));
    }

    let start = Instant::now();
    let grid: Vec<(usize, usize)> = (0..config.effect_scales.len())
        .flat_map(|s| (0..config.n_trials).map(move |t| (s, t)))
        .collect();

    let run_trials = |grid: &[(usize, usize)]| -> Vec<TrialRecord> {
        grid.par_iter()
            .map(|&(s, t)| {
                let seed = trial_seed(config.seed, s, t);
                let outcome = run_trial(config, config.effect_scales[s], seed);
                if let TrialOutcome::Inconclusive { stage, reason } = &outcome {
                    log::warn!("trial {t} (scale {s}) inconclusive at {stage}: {reason}");
                }
                TrialRecord { scale_index: s, trial: t, seed, outcome }
            })
            .collect()
    };

    let trials = if config.n_threads > 0 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.n_threads)
            .build()
            .map_err(|e| Error::Computation(format!("failed to create thread pool: {e}")))?;
        pool.install(|| run_trials(&grid))
    } else {
        run_trials(&grid)
    };

    let points: Vec<PowerPoint> = config
        .effect_scales
        .iter()
        .enumerate()
        .map(|(s, &scale)| {
            let members: Vec<&TrialRecord> = trials.iter().filter(|r| r.scale_index == s).collect();
            summarize(scale, &members)
        })
        .collect();

    for p in &points {
        log::info!(
            "power: scale={} valid={}/{} power={:?}",
            p.effect_scale,
            p.n_valid,
            p.n_trials,
            p.power
        );
    }

    Ok(PowerResult { alpha: config.alpha, points, trials, wall_s: start.elapsed().as_secs_f64() })
}
