//! Run configuration (YAML or JSON).
//!
//! Every section is optional and falls back to the library defaults, so an
//! empty file is a valid configuration.

use anyhow::{Result, bail};
use sd_inference::did::{
    AggregationConfig, AttGtConfig, BalanceConfig, CohortWeighting, EventStudyConfig,
    PanelSimConfig, PowerConfig, PropensityConfig, WeightConfig,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationSection {
    /// Cohort weighting at each event time.
    pub weighting: CohortWeighting,
    /// Credible-interval level.
    pub conf_level: f64,
    /// Also fit one pooled model per cohort and merge the draws.
    pub per_cohort: bool,
}

impl Default for AggregationSection {
    fn default() -> Self {
        Self { weighting: CohortWeighting::Equal, conf_level: 0.95, per_cohort: false }
    }
}

impl AggregationSection {
    pub fn to_config(&self) -> AggregationConfig {
        AggregationConfig { weighting: self.weighting, conf_level: self.conf_level }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerSection {
    pub effect_scales: Vec<f64>,
    pub n_trials: usize,
    pub alpha: f64,
}

impl Default for PowerSection {
    fn default() -> Self {
        let d = PowerConfig::default();
        Self { effect_scales: d.effect_scales, n_trials: d.n_trials, alpha: d.alpha }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Seed of the estimation steps (posterior draws, power trials). The
    /// simulated panel uses `simulation.seed`.
    pub seed: u64,
    /// Threads (0 = auto).
    pub threads: usize,
    pub simulation: PanelSimConfig,
    pub propensity: PropensityConfig,
    pub weights: WeightConfig,
    pub balance: BalanceConfig,
    pub event_study: EventStudyConfig,
    pub aggregation: AggregationSection,
    pub att_gt: AttGtConfig,
    pub power: PowerSection,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: 2021,
            threads: 0,
            simulation: PanelSimConfig::default(),
            propensity: PropensityConfig::default(),
            weights: WeightConfig::default(),
            balance: BalanceConfig::default(),
            event_study: EventStudyConfig::default(),
            aggregation: AggregationSection::default(),
            att_gt: AttGtConfig::default(),
            power: PowerSection::default(),
        }
    }
}

impl RunConfig {
    pub fn power_config(&self) -> PowerConfig {
        PowerConfig {
            simulation: self.simulation.clone(),
            att: self.att_gt.clone(),
            effect_scales: self.power.effect_scales.clone(),
            n_trials: self.power.n_trials,
            alpha: self.power.alpha,
            seed: self.seed,
            n_threads: self.threads,
        }
    }
}

/// Read a run configuration; `None` gives the defaults.
pub fn read_run_config(path: Option<&Path>) -> Result<RunConfig> {
    let Some(path) = path else {
        return Ok(RunConfig::default());
    };
    let bytes = std::fs::read(path)?;
    // YAML is a superset of JSON.
    let cfg: RunConfig = if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        RunConfig::default()
    } else {
        serde_yaml_ng::from_slice(&bytes)?
    };
    validate(&cfg)?;
    tracing::info!(path = %path.display(), "loaded run config");
    Ok(cfg)
}

fn validate(cfg: &RunConfig) -> Result<()> {
    if !(cfg.aggregation.conf_level > 0.0 && cfg.aggregation.conf_level < 1.0) {
        bail!("aggregation.conf_level must be in (0,1), got {}", cfg.aggregation.conf_level);
    }
    if cfg.power.n_trials == 0 {
        bail!("power.n_trials must be >= 1");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sd_inference::did::{EffectProfile, EventStudySpec};

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
seed: 7
simulation:
  n_units: 120
  effect:
    kind: constant
    effect: 2.0
event_study:
  spec:
    kind: pooled
aggregation:
  per_cohort: true
"#;
        let cfg: RunConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(cfg.seed, 7);
        assert_eq!(cfg.simulation.n_units, 120);
        assert_eq!(cfg.simulation.n_periods, 10);
        assert_eq!(cfg.simulation.effect, EffectProfile::Constant { effect: 2.0 });
        assert_eq!(cfg.event_study.spec, EventStudySpec::Pooled);
        assert_eq!(cfg.event_study.reference_event_time, -1);
        assert!(cfg.aggregation.per_cohort);
        assert_eq!(cfg.weights.trim_quantile, 0.99);
    }

    #[test]
    fn test_power_config_uses_run_seed_and_threads() {
        let cfg = RunConfig { seed: 3, threads: 2, ..Default::default() };
        let p = cfg.power_config();
        assert_eq!(p.seed, 3);
        assert_eq!(p.n_threads, 2);
        assert_eq!(p.effect_scales, cfg.power.effect_scales);
    }

    #[test]
    fn test_invalid_sections_rejected() {
        let mut cfg = RunConfig::default();
        cfg.aggregation.conf_level = 1.5;
        assert!(validate(&cfg).is_err());
    }
}
