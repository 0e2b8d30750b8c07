//! Balanced unit × period panel.

use std::collections::BTreeMap;

use sd_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// One cross-sectional unit with its time-invariant attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Unit identifier.
    pub id: u64,
    /// Adoption period; `None` for never-treated units.
    pub cohort: Option<u32>,
    /// Confounder.
    pub x: f64,
    /// Unit-level random effect used to generate the outcome.
    pub unit_effect: f64,
}

/// One `(unit, period)` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelObservation {
    /// Unit identifier.
    pub id: u64,
    /// Calendar period (1-based).
    pub period: u32,
    /// Outcome.
    pub y: f64,
    /// `period - cohort` for treated units, `None` for never-treated.
    pub event_time: Option<i64>,
    /// Treated-yet indicator (`period >= cohort`).
    pub treated: bool,
}

/// Event time of `period` for a unit adopting in `cohort`.
#[inline]
pub fn event_time(period: u32, cohort: Option<u32>) -> Option<i64> {
    cohort.map(|g| i64::from(period) - i64::from(g))
}

/// Balanced panel, rows sorted by `(unit, period)` in unit order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Panel {
    n_periods: u32,
    units: Vec<Unit>,
    observations: Vec<PanelObservation>,
    cohorts: Vec<u32>,
}

impl Panel {
    /// Build a panel, checking balance, ordering and the derived columns.
    pub fn new(
        n_periods: u32,
        units: Vec<Unit>,
        observations: Vec<PanelObservation>,
    ) -> Result<Self> {
        if units.is_empty() || n_periods == 0 {
            return Err(Error::Validation("panel must have units and periods".to_string()));
        }
        let t = n_periods as usize;
        if observations.len() != units.len() * t {
            return Err(Error::Validation(format!(
                "unbalanced panel: {} observations for {} units x {} periods",
                observations.len(),
                units.len(),
                t
            )));
        }
        if units.windows(2).any(|w| w[0].id >= w[1].id) {
            return Err(Error::Validation("unit ids must be strictly increasing".to_string()));
        }
        for (u, unit) in units.iter().enumerate() {
            if let Some(g) = unit.cohort {
                if g == 0 || g > n_periods {
                    return Err(Error::Validation(format!(
                        "unit {} adopts in period {} outside 1..={}",
                        unit.id, g, n_periods
                    )));
                }
            }
            for (s, obs) in observations[u * t..(u + 1) * t].iter().enumerate() {
                let period = s as u32 + 1;
                if obs.id != unit.id || obs.period != period {
                    return Err(Error::Validation(format!(
                        "row {} should be (unit {}, period {}), got ({}, {})",
                        u * t + s,
                        unit.id,
                        period,
                        obs.id,
                        obs.period
                    )));
                }
                let et = event_time(period, unit.cohort);
                if obs.event_time != et || obs.treated != et.is_some_and(|e| e >= 0) {
                    return Err(Error::Validation(format!(
                        "inconsistent event time for unit {} period {}",
                        unit.id, period
                    )));
                }
                if !obs.y.is_finite() {
                    return Err(Error::Validation(format!(
                        "non-finite outcome for unit {} period {}",
                        unit.id, period
                    )));
                }
            }
        }

        let mut cohorts: Vec<u32> = units.iter().filter_map(|u| u.cohort).collect();
        cohorts.sort_unstable();
        cohorts.dedup();

        Ok(Self { n_periods, units, observations, cohorts })
    }

    /// Number of periods.
    pub fn n_periods(&self) -> u32 {
        self.n_periods
    }

    /// Number of units.
    pub fn n_units(&self) -> usize {
        self.units.len()
    }

    /// Units in panel order.
    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    /// All observations, unit-major.
    pub fn observations(&self) -> &[PanelObservation] {
        &self.observations
    }

    /// Distinct adoption periods, ascending.
    pub fn cohorts(&self) -> &[u32] {
        &self.cohorts
    }

    /// Whether any never-treated units are present.
    pub fn has_never_treated(&self) -> bool {
        self.units.iter().any(|u| u.cohort.is_none())
    }

    /// Position of a unit id.
    pub fn unit_index(&self, id: u64) -> Option<usize> {
        self.units.binary_search_by_key(&id, |u| u.id).ok()
    }

    /// Observations of the unit at position `idx`.
    pub fn unit_observations(&self, idx: usize) -> &[PanelObservation] {
        let t = self.n_periods as usize;
        &self.observations[idx * t..(idx + 1) * t]
    }

    /// Outcome of the unit at position `idx` in `period` (1-based); `None`
    /// outside the panel.
    #[inline]
    pub fn y(&self, idx: usize, period: u32) -> Option<f64> {
        if idx >= self.units.len() || period == 0 || period > self.n_periods {
            return None;
        }
        Some(self.observations[idx * self.n_periods as usize + (period as usize - 1)].y)
    }

    /// Unit counts per cohort (`None` = never treated), in cohort order with
    /// never-treated first.
    pub fn cohort_sizes(&self) -> BTreeMap<Option<u32>, usize> {
        let mut out = BTreeMap::new();
        for u in &self.units {
            *out.entry(u.cohort).or_insert(0) += 1;
        }
        out
    }

    /// Event times realized by cohort `g` in this panel.
    pub fn event_times(&self, g: u32) -> Vec<i64> {
        (1..=self.n_periods).map(|t| i64::from(t) - i64::from(g)).collect()
    }

    /// Sub-panel with the units whose cohort is in `keep`.
    pub fn subset(&self, keep: &[Option<u32>]) -> Result<Self> {
        let t = self.n_periods as usize;
        let mut units = Vec::new();
        let mut observations = Vec::new();
        for (idx, u) in self.units.iter().enumerate() {
            if keep.contains(&u.cohort) {
                units.push(u.clone());
                observations.extend_from_slice(&self.observations[idx * t..(idx + 1) * t]);
            }
        }
        Self::new(self.n_periods, units, observations)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Tiny deterministic panel: y = id + period + 2 * treated.
    pub(crate) fn toy_panel(cohorts: &[Option<u32>], n_periods: u32) -> Panel {
        let mut units = Vec::new();
        let mut obs = Vec::new();
        for (i, &g) in cohorts.iter().enumerate() {
            let id = i as u64 + 1;
            units.push(Unit { id, cohort: g, x: i as f64 * 0.1, unit_effect: 0.0 });
            for t in 1..=n_periods {
                let et = event_time(t, g);
                let treated = et.is_some_and(|e| e >= 0);
                let y = id as f64 + t as f64 + if treated { 2.0 } else { 0.0 };
                obs.push(PanelObservation { id, period: t, y, event_time: et, treated });
            }
        }
        Panel::new(n_periods, units, obs).unwrap()
    }

    #[test]
    fn test_derived_columns_and_lookups() {
        let p = toy_panel(&[None, Some(3), Some(3), Some(4)], 5);
        assert_eq!(p.n_units(), 4);
        assert_eq!(p.cohorts(), &[3, 4]);
        assert!(p.has_never_treated());
        assert_eq!(p.unit_index(3), Some(2));
        assert_eq!(p.unit_index(99), None);
        assert_eq!(p.y(1, 3), Some(2.0 + 3.0 + 2.0));
        assert_eq!(p.y(1, 0), None);
        assert_eq!(p.y(1, 6), None);
        assert_eq!(p.y(4, 1), None);
        let sizes = p.cohort_sizes();
        assert_eq!(sizes[&None], 1);
        assert_eq!(sizes[&Some(3)], 2);
        assert_eq!(p.event_times(4), vec![-3, -2, -1, 0, 1]);

        let never = p.unit_observations(0);
        assert!(never.iter().all(|o| o.event_time.is_none() && !o.treated));
    }

    #[test]
    fn test_subset_keeps_selected_cohorts() {
        let p = toy_panel(&[None, Some(3), Some(4), None], 5);
        let s = p.subset(&[None, Some(4)]).unwrap();
        assert_eq!(s.n_units(), 3);
        assert_eq!(s.cohorts(), &[4]);
        assert_eq!(s.observations().len(), 15);
    }

    #[test]
    fn test_rejects_inconsistent_rows() {
        let p = toy_panel(&[None, Some(3)], 4);
        let mut obs = p.observations().to_vec();
        obs[5].event_time = Some(7);
        assert!(Panel::new(4, p.units().to_vec(), obs).is_err());

        let mut obs = p.observations().to_vec();
        obs.pop();
        assert!(Panel::new(4, p.units().to_vec(), obs).is_err());

        let mut units = p.units().to_vec();
        units[1].cohort = Some(9);
        assert!(Panel::new(4, units, p.observations().to_vec()).is_err());
    }
}
