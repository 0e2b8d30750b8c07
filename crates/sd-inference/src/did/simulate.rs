//! Synthetic staggered-adoption panels with confounded treatment timing.
//!
//! Cohort membership follows a multinomial logit in the confounder `X`, and
//! `X` also shifts outcome trends, so naive comparisons across cohorts are
//! biased while `X`-weighted comparisons are not.
//!
//! Outcome:
//!
//! `Y_it = x_level·X_i + x_trend·X_i·t + α_i + λ_t + s·τ(t − G_i)·1{t ≥ G_i} + ε_it`
//! with `s` the effect scale.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, StandardNormal};
use sd_core::{Error, Result};
use sd_prob::math::softmax_into;
use serde::{Deserialize, Serialize};

use super::panel::{Panel, PanelObservation, Unit, event_time};

/// Dynamic treatment effect `τ(e)` for event times `e ≥ 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EffectProfile {
    /// Same effect at every post-treatment event time.
    Constant {
        /// Effect size.
        effect: f64,
    },
    /// `τ(e) = intercept + slope · e`.
    Linear {
        /// Effect on impact (`e = 0`).
        intercept: f64,
        /// Change per period since adoption.
        slope: f64,
    },
    /// `τ(e) = values[e]`, last value carried forward.
    Custom {
        /// Effects for `e = 0, 1, ...`.
        values: Vec<f64>,
    },
}

impl EffectProfile {
    /// Effect at event time `e` (0 before adoption).
    pub fn at(&self, e: i64) -> f64 {
        if e < 0 {
            return 0.0;
        }
        match self {
            Self::Constant { effect } => *effect,
            Self::Linear { intercept, slope } => intercept + slope * e as f64,
            Self::Custom { values } => match values.get(e as usize).or(values.last()) {
                Some(v) => *v,
                None => 0.0,
            },
        }
    }
}

/// Simulation parameters (the document-level constants of a study).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelSimConfig {
    /// Number of units.
    pub n_units: usize,
    /// Number of periods (`1..=n_periods`).
    pub n_periods: u32,
    /// Adoption periods of the treated cohorts.
    pub cohorts: Vec<u32>,
    /// Baseline cohort probabilities: never-treated first, then one per cohort.
    pub cohort_probs: Vec<f64>,
    /// Logit slope of each cohort's membership on `X`, relative to never-treated.
    pub confounder_slopes: Vec<f64>,
    /// Level effect of `X` on the outcome.
    pub x_level: f64,
    /// Effect of `X × period` on the outcome (confounded trends).
    pub x_trend: f64,
    /// Standard deviation of unit effects.
    pub unit_sd: f64,
    /// Standard deviation of period effects.
    pub period_sd: f64,
    /// Idiosyncratic noise standard deviation.
    pub noise_sd: f64,
    /// Dynamic treatment effect.
    pub effect: EffectProfile,
    /// Multiplier applied to `effect`.
    pub effect_scale: f64,
    /// RNG seed.
    pub seed: u64,
}

impl Default for PanelSimConfig {
    fn default() -> Self {
        Self {
            n_units: 500,
            n_periods: 10,
            cohorts: vec![4, 6, 8],
            cohort_probs: vec![0.4, 0.2, 0.2, 0.2],
            confounder_slopes: vec![1.0, 0.5, 0.25],
            x_level: 1.0,
            x_trend: 0.3,
            unit_sd: 1.0,
            period_sd: 0.5,
            noise_sd: 1.0,
            effect: EffectProfile::Linear { intercept: 1.0, slope: 0.25 },
            effect_scale: 1.0,
            seed: 42,
        }
    }
}

impl PanelSimConfig {
    fn validate_cohort_model(&self) -> Result<()> {
        if self.cohort_probs.len() != self.cohorts.len() + 1 {
            return Err(Error::Validation(format!(
                "cohort_probs needs {} entries (never-treated + cohorts), got {}",
                self.cohorts.len() + 1,
                self.cohort_probs.len()
            )));
        }
        if self.cohort_probs.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(Error::Validation("cohort_probs must be finite and >= 0".to_string()));
        }
        let total: f64 = self.cohort_probs.iter().sum();
        if (total - 1.0).abs() > 1e-6 {
            return Err(Error::Validation(format!("cohort_probs must sum to 1, got {total}")));
        }
        if self.confounder_slopes.len() != self.cohorts.len() {
            return Err(Error::Validation(format!(
                "confounder_slopes needs {} entries, got {}",
                self.cohorts.len(),
                self.confounder_slopes.len()
            )));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.n_units < 2 {
            return Err(Error::Validation("n_units must be >= 2".to_string()));
        }
        if self.n_periods < 2 {
            return Err(Error::Validation("n_periods must be >= 2".to_string()));
        }
        if let Some(&g) = self.cohorts.iter().find(|&&g| g < 2 || g > self.n_periods) {
            return Err(Error::Validation(format!(
                "adoption period {} must lie in 2..={} (one pre-period required)",
                g, self.n_periods
            )));
        }
        let mut sorted = self.cohorts.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != self.cohorts.len() {
            return Err(Error::Validation("adoption periods must be distinct".to_string()));
        }
        self.validate_cohort_model()?;
        for (name, v) in [
            ("unit_sd", self.unit_sd),
            ("period_sd", self.period_sd),
            ("noise_sd", self.noise_sd),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(Error::Validation(format!("{name} must be finite and >= 0")));
            }
        }
        Ok(())
    }

    /// True cohort probabilities for a unit with confounder `x`
    /// (never-treated first).
    pub fn cohort_probabilities(&self, x: f64) -> Result<Vec<f64>> {
        self.validate_cohort_model()?;
        let eta: Vec<f64> = std::iter::once(self.cohort_probs[0].ln())
            .chain(
                self.cohort_probs[1..]
                    .iter()
                    .zip(&self.confounder_slopes)
                    .map(|(p, s)| p.ln() + s * x),
            )
            .collect();
        let mut prob = vec![0.0; eta.len()];
        softmax_into(&eta, &mut prob);
        Ok(prob)
    }

    /// True (scaled) effect at event time `e`.
    pub fn true_effect(&self, e: i64) -> f64 {
        self.effect_scale * self.effect.at(e)
    }
}

/// A simulated panel with its ground truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedPanel {
    /// The panel.
    pub panel: Panel,
    /// Period effects `λ_t` used to generate the outcome.
    pub period_effects: Vec<f64>,
    /// True dynamic effect `(e, scale·τ(e))` for every realized event time.
    pub ground_truth: Vec<(i64, f64)>,
}

fn normal(sd: f64) -> Result<Normal<f64>> {
    Normal::new(0.0, sd).map_err(|e| Error::Validation(format!("invalid normal sd {sd}: {e}")))
}

/// Simulate a balanced panel.
pub fn simulate_panel(config: &PanelSimConfig) -> Result<SimulatedPanel> {
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let unit_dist = normal(config.unit_sd)?;
    let period_dist = normal(config.period_sd)?;
    let noise_dist = normal(config.noise_sd)?;

    let period_effects: Vec<f64> =
        (0..config.n_periods).map(|_| period_dist.sample(&mut rng)).collect();

    let t = config.n_periods as usize;
    let mut units = Vec::with_capacity(config.n_units);
    let mut observations = Vec::with_capacity(config.n_units * t);

    for i in 0..config.n_units {
        let id = i as u64 + 1;
        let x: f64 = StandardNormal.sample(&mut rng);
        let prob = config.cohort_probabilities(x)?;
        let u: f64 = rng.random();
        let mut acc = 0.0;
        let mut category = prob.len() - 1;
        for (k, p) in prob.iter().enumerate() {
            acc += p;
            if u < acc {
                category = k;
                break;
            }
        }
        let cohort = if category == 0 { None } else { Some(config.cohorts[category - 1]) };
        let unit_effect = unit_dist.sample(&mut rng);

        for period in 1..=config.n_periods {
            let et = event_time(period, cohort);
            let treated = et.is_some_and(|e| e >= 0);
            let tau = et.map_or(0.0, |e| config.true_effect(e));
            let y = config.x_level * x
                + config.x_trend * x * f64::from(period)
                + unit_effect
                + period_effects[period as usize - 1]
                + tau
                + noise_dist.sample(&mut rng);
            observations.push(PanelObservation { id, period, y, event_time: et, treated });
        }
        units.push(Unit { id, cohort, x, unit_effect });
    }

    let panel = Panel::new(config.n_periods, units, observations)?;

    let mut realized: Vec<i64> =
        panel.cohorts().iter().flat_map(|&g| panel.event_times(g)).collect();
    realized.sort_unstable();
    realized.dedup();
    let ground_truth = realized.into_iter().map(|e| (e, config.true_effect(e))).collect();

    log::debug!(
        "simulated panel: units={}, periods={}, cohorts={:?}",
        panel.n_units(),
        panel.n_periods(),
        panel.cohorts()
    );

    Ok(SimulatedPanel { panel, period_effects, ground_truth })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_effect_profiles() {
        let c = EffectProfile::Constant { effect: 2.0 };
        assert_eq!(c.at(-1), 0.0);
        assert_eq!(c.at(3), 2.0);
        let l = EffectProfile::Linear { intercept: 1.0, slope: 0.5 };
        assert_eq!(l.at(0), 1.0);
        assert_eq!(l.at(4), 3.0);
        let v = EffectProfile::Custom { values: vec![0.5, 1.0] };
        assert_eq!(v.at(0), 0.5);
        assert_eq!(v.at(7), 1.0);
        assert_eq!(EffectProfile::Custom { values: vec![] }.at(2), 0.0);
    }

    #[test]
    fn test_simulation_is_deterministic_and_balanced() {
        let cfg = PanelSimConfig { n_units: 120, ..Default::default() };
        let a = simulate_panel(&cfg).unwrap();
        let b = simulate_panel(&cfg).unwrap();
        assert_eq!(a.panel.observations(), b.panel.observations());
        assert_eq!(a.panel.observations().len(), 120 * 10);
        assert_eq!(a.panel.cohorts(), &[4, 6, 8]);

        // Realized event times span 1-8 .. 10-4.
        assert_eq!(a.ground_truth.first().map(|g| g.0), Some(-7));
        assert_eq!(a.ground_truth.last().map(|g| g.0), Some(6));
        for &(e, v) in &a.ground_truth {
            if e < 0 {
                assert_eq!(v, 0.0);
            }
        }
    }

    #[test]
    fn test_noise_free_outcome_matches_formula() {
        let cfg = PanelSimConfig {
            n_units: 30,
            unit_sd: 0.0,
            period_sd: 0.0,
            noise_sd: 0.0,
            effect: EffectProfile::Constant { effect: 3.0 },
            effect_scale: 2.0,
            ..Default::default()
        };
        let sim = simulate_panel(&cfg).unwrap();
        for (idx, u) in sim.panel.units().iter().enumerate() {
            for o in sim.panel.unit_observations(idx) {
                let tau = if o.treated { 6.0 } else { 0.0 };
                let expected = cfg.x_level * u.x + cfg.x_trend * u.x * f64::from(o.period) + tau;
                assert_abs_diff_eq!(o.y, expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_confounder_shifts_early_adoption() {
        // With a positive slope on the earliest cohort, its mean X exceeds the never-treated mean.
        let cfg = PanelSimConfig {
            n_units: 3000,
            confounder_slopes: vec![1.5, 0.0, 0.0],
            ..Default::default()
        };
        let sim = simulate_panel(&cfg).unwrap();
        let mean_x = |g: Option<u32>| {
            let xs: Vec<f64> =
                sim.panel.units().iter().filter(|u| u.cohort == g).map(|u| u.x).collect();
            sd_prob::summary::mean(&xs)
        };
        assert!(mean_x(Some(4)) > mean_x(None) + 0.5);

        let p = cfg.cohort_probabilities(0.0).unwrap();
        assert_abs_diff_eq!(p[0], 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(p.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_validation() {
        let bad = PanelSimConfig { cohorts: vec![1, 6, 8], ..Default::default() };
        assert!(simulate_panel(&bad).is_err());
        let bad = PanelSimConfig { cohort_probs: vec![0.5, 0.5, 0.5, 0.5], ..Default::default() };
        assert!(simulate_panel(&bad).is_err());
        let bad = PanelSimConfig { confounder_slopes: vec![1.0], ..Default::default() };
        assert!(simulate_panel(&bad).is_err());
        let bad = PanelSimConfig { n_units: 1, ..Default::default() };
        assert!(simulate_panel(&bad).is_err());
    }

    #[test]
    fn test_cohort_probabilities_reject_malformed_config() {
        let empty = PanelSimConfig { cohort_probs: vec![], ..Default::default() };
        assert!(empty.cohort_probabilities(0.0).is_err());
        let short = PanelSimConfig { confounder_slopes: vec![1.0, 0.5], ..Default::default() };
        assert!(short.cohort_probabilities(1.0).is_err());
    }
}
