//! Inverse-probability weights with percentile trimming.

use std::collections::HashMap;

use sd_core::{Error, Result};
use sd_prob::summary::{kish_ess, quantile_linear};
use serde::{Deserialize, Serialize};

use super::panel::Panel;
use super::propensity::UnitPropensity;

/// Weight construction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightConfig {
    /// Quantile of the raw weights used as the cap (type-7 interpolation).
    pub trim_quantile: f64,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self { trim_quantile: 0.99 }
    }
}

/// Per-unit propensity and weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropensityRecord {
    /// Unit identifier.
    pub id: u64,
    /// Observed cohort.
    pub cohort: Option<u32>,
    /// Estimated probability of the observed cohort.
    pub prop_score: f64,
    /// `1 / prop_score`.
    pub ipw_weight: f64,
    /// `min(ipw_weight, cap)`.
    pub ipw_weight_trimmed: f64,
}

/// Weights for every unit plus trimming diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightTable {
    /// One record per unit, in input order.
    pub records: Vec<PropensityRecord>,
    /// Cap applied to the raw weights.
    pub cap: f64,
    /// Units whose weight was capped.
    pub n_trimmed: usize,
    /// Kish effective sample size of the raw weights.
    pub ess_raw: f64,
    /// Kish effective sample size of the trimmed weights.
    pub ess_trimmed: f64,
    #[serde(skip)]
    index: HashMap<u64, usize>,
}

impl WeightTable {
    /// Trimmed weight of unit `id`.
    pub fn weight_of(&self, id: u64) -> Option<f64> {
        if self.index.is_empty() {
            return self.records.iter().find(|r| r.id == id).map(|r| r.ipw_weight_trimmed);
        }
        self.index.get(&id).map(|&k| self.records[k].ipw_weight_trimmed)
    }

    /// Trimmed weights in panel unit order.
    pub fn unit_weights(&self, panel: &Panel) -> Result<Vec<f64>> {
        panel
            .units()
            .iter()
            .map(|u| {
                self.weight_of(u.id)
                    .ok_or_else(|| Error::Validation(format!("no weight for unit {}", u.id)))
            })
            .collect()
    }

    /// Trimmed weights joined onto the panel observations by unit id.
    pub fn observation_weights(&self, panel: &Panel) -> Result<Vec<f64>> {
        let per_unit = self.unit_weights(panel)?;
        let t = panel.n_periods() as usize;
        Ok(per_unit.iter().flat_map(|&w| std::iter::repeat_n(w, t)).collect())
    }
}

/// Build weights from propensity scores.
pub fn construct_weights(scores: &[UnitPropensity], config: &WeightConfig) -> Result<WeightTable> {
    if scores.is_empty() {
        return Err(Error::Validation("no propensity scores".to_string()));
    }
    let q = config.trim_quantile;
    if !(q > 0.0 && q <= 1.0) {
        return Err(Error::Validation(format!("trim_quantile must be in (0, 1], got {q}")));
    }
    if let Some(s) = scores.iter().find(|s| !(s.prop_score > 0.0 && s.prop_score <= 1.0)) {
        return Err(Error::Validation(format!(
            "prop_score of unit {} must be in (0, 1], got {}",
            s.id, s.prop_score
        )));
    }

    let raw: Vec<f64> = scores.iter().map(|s| 1.0 / s.prop_score).collect();
    if raw.iter().any(|w| !w.is_finite()) {
        return Err(Error::Computation("non-finite inverse propensity weight".to_string()));
    }
    let cap = quantile_linear(&raw, q);

    let mut n_trimmed = 0;
    let mut index = HashMap::with_capacity(scores.len());
    let records: Vec<PropensityRecord> = scores
        .iter()
        .zip(&raw)
        .enumerate()
        .map(|(k, (s, &w))| {
            if w > cap {
                n_trimmed += 1;
            }
            index.insert(s.id, k);
            PropensityRecord {
                id: s.id,
                cohort: s.cohort,
                prop_score: s.prop_score,
                ipw_weight: w,
                ipw_weight_trimmed: w.min(cap),
            }
        })
        .collect();
    if index.len() != records.len() {
        return Err(Error::Validation("duplicate unit ids in propensity scores".to_string()));
    }

    let trimmed: Vec<f64> = records.iter().map(|r| r.ipw_weight_trimmed).collect();
    let table = WeightTable {
        cap,
        n_trimmed,
        ess_raw: kish_ess(&raw),
        ess_trimmed: kish_ess(&trimmed),
        records,
        index,
    };
    log::info!(
        "weights: cap={:.3} trimmed={} ess {:.1} -> {:.1}",
        table.cap,
        table.n_trimmed,
        table.ess_raw,
        table.ess_trimmed
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::did::panel::tests::toy_panel;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn scores(p: &[f64]) -> Vec<UnitPropensity> {
        p.iter()
            .enumerate()
            .map(|(i, &prop_score)| UnitPropensity { id: i as u64 + 1, cohort: None, prop_score })
            .collect()
    }

    #[test]
    fn test_cap_is_type7_quantile() {
        // Raw weights 1..=5; 0.9 quantile = 4 + 0.6 * 1.
        let p = [1.0, 0.5, 1.0 / 3.0, 0.25, 0.2];
        let t = construct_weights(&scores(&p), &WeightConfig { trim_quantile: 0.9 }).unwrap();
        assert_relative_eq!(t.cap, 4.6, epsilon = 1e-12);
        assert_eq!(t.n_trimmed, 1);
        assert_relative_eq!(t.records[4].ipw_weight, 5.0, epsilon = 1e-12);
        assert_relative_eq!(t.records[4].ipw_weight_trimmed, 4.6, epsilon = 1e-12);
        assert_relative_eq!(t.records[0].ipw_weight_trimmed, 1.0);
        assert!(t.ess_trimmed >= t.ess_raw);
    }

    #[test]
    fn test_quantile_one_trims_nothing() {
        let t = construct_weights(&scores(&[0.3, 0.6, 0.9]), &WeightConfig { trim_quantile: 1.0 })
            .unwrap();
        assert_eq!(t.n_trimmed, 0);
        assert!(t.records.iter().all(|r| r.ipw_weight == r.ipw_weight_trimmed));
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let cfg = WeightConfig::default();
        assert!(construct_weights(&[], &cfg).is_err());
        assert!(construct_weights(&scores(&[0.5, 0.0]), &cfg).is_err());
        assert!(construct_weights(&scores(&[0.5, 1.2]), &cfg).is_err());
        assert!(construct_weights(&scores(&[0.5, f64::NAN]), &cfg).is_err());
        assert!(construct_weights(&scores(&[0.5]), &WeightConfig { trim_quantile: 0.0 }).is_err());
        let mut dup = scores(&[0.5, 0.5]);
        dup[1].id = 1;
        assert!(construct_weights(&dup, &cfg).is_err());
    }

    #[test]
    fn test_join_onto_observations() {
        let panel = toy_panel(&[None, Some(3), Some(4)], 4);
        let t = construct_weights(&scores(&[0.5, 0.25, 0.8]), &WeightConfig { trim_quantile: 1.0 })
            .unwrap();
        let w = t.observation_weights(&panel).unwrap();
        assert_eq!(w.len(), 12);
        assert_relative_eq!(w[0], 2.0);
        assert_relative_eq!(w[7], 4.0);
        assert_relative_eq!(w[11], 1.25);

        let short = construct_weights(&scores(&[0.5, 0.25]), &WeightConfig::default()).unwrap();
        assert!(short.observation_weights(&panel).is_err());
    }

    #[test]
    fn test_lookup_after_deserialize() {
        let t = construct_weights(&scores(&[0.5, 0.25]), &WeightConfig::default()).unwrap();
        let back: WeightTable = serde_json::from_str(&serde_json::to_string(&t).unwrap()).unwrap();
        assert_eq!(back.weight_of(2), t.weight_of(2));
        assert_eq!(back.weight_of(9), None);
    }

    proptest! {
        #[test]
        fn prop_trimmed_weights_bounded(
            p in prop::collection::vec(0.001f64..=1.0, 1..200),
            q in 0.5f64..=1.0,
        ) {
            let t = construct_weights(&scores(&p), &WeightConfig { trim_quantile: q }).unwrap();
            for r in &t.records {
                prop_assert!(r.ipw_weight_trimmed > 0.0);
                prop_assert!(r.ipw_weight_trimmed <= t.cap);
                prop_assert!(r.ipw_weight_trimmed <= r.ipw_weight);
                prop_assert!(r.ipw_weight >= 1.0);
            }
            prop_assert_eq!(
                t.n_trimmed,
                t.records.iter().filter(|r| r.ipw_weight > t.cap).count()
            );
        }
    }
}
