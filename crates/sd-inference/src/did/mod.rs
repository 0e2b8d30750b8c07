//! Staggered difference-in-differences under confounded adoption timing.
//!
//! This module provides:
//! - **Panel simulation** with cohort membership driven by a confounder and
//!   a known dynamic effect profile.
//! - **Propensity scores** of the observed cohort from a categorical
//!   regression, turned into trimmed **inverse-probability weights**.
//! - **Balance diagnostics** (standardized mean differences, densities).
//! - A weighted **event study** with unit/period random effects, pooled or
//!   cohort-interacted, plus per-cohort parallel fits.
//! - **Aggregation** of event-study draws into a dynamic profile.
//! - **Group-time ATT** (Callaway & Sant'Anna, 2021) and a Monte-Carlo
//!   **power analysis** built on it.

pub mod aggregate;
pub mod att_gt;
pub mod balance;
pub mod event_study;
pub mod panel;
pub mod power;
pub mod propensity;
pub mod simulate;
pub mod weights;

pub use aggregate::{
    AggregationConfig, CohortEffect, CohortWeighting, DynamicProfile, EventTimeEffect,
    aggregate_cohort_fits, aggregate_interacted, aggregate_pooled, total_effect_draws,
};
pub use att_gt::{
    AttGtConfig, AttGtResult, BasePeriod, ControlGroup, DynamicAggregate, DynamicAtt,
    EstimationMethod, GroupTimeAtt, aggregate_dynamic, estimate_att_gt,
};
pub use balance::{BalanceConfig, BalanceReport, DensityCurve, SmdRow, check_balance};
pub use event_study::{
    CohortFit, CohortSupport, EventStudyConfig, EventStudyFit, EventStudyPriors, EventStudySpec,
    EventTerm, fit_event_study, fit_per_cohort,
};
pub use panel::{Panel, PanelObservation, Unit};
pub use power::{
    PowerConfig, PowerPoint, PowerResult, TrialOutcome, TrialRecord, TrialStage,
    run_power_analysis,
};
pub use propensity::{PropensityConfig, PropensityEstimate, UnitPropensity, estimate_propensity};
pub use simulate::{EffectProfile, PanelSimConfig, SimulatedPanel, simulate_panel};
pub use weights::{PropensityRecord, WeightConfig, WeightTable, construct_weights};
