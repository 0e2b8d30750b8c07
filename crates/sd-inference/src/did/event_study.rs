//! IPW-weighted event-study regression with unit and period random effects.
//!
//! Model, for observation `o` of unit `i` in period `t`:
//!
//! `y_o ~ N(b0 + r_id[i] + r_period[t] + Σ b_et[e]·D_oe [+ Σ b_et[e]:cohort[g]·D_oge], σ)`
//!
//! with `r_id ~ N(0, sd_id)`, `r_period ~ N(0, sd_period)` and each
//! observation's log-likelihood multiplied by its weight.
//!
//! Given the three scale parameters the model is Gaussian in every location
//! parameter, so they are integrated out exactly. The scales are set to the
//! mode of their marginal posterior; location draws then come from their
//! exact conditional Gaussian. The unit block of the precision is diagonal,
//! which keeps every evaluation at `O(n_units · q²)` with `q` the number of
//! non-unit location parameters.

use std::f64::consts::PI;
use std::time::Instant;

use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use sd_core::{Error, PosteriorDraws, Result};
use serde::{Deserialize, Serialize};

use super::panel::Panel;
use crate::laplace::{cholesky_jittered, gaussian_draws_from_precision, log_det_from_cholesky};
use crate::optimizer::{LbfgsOptimizer, ObjectiveFunction, OptimizerConfig};

/// Fixed-effect structure of the event study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventStudySpec {
    /// One dummy per event time shared by all cohorts.
    Pooled,
    /// Event-time main effects plus cohort × event-time interactions.
    CohortInteracted {
        /// Cohort without interactions; the earliest cohort if unset.
        #[serde(default)]
        reference_cohort: Option<u32>,
    },
}

impl Default for EventStudySpec {
    fn default() -> Self {
        Self::CohortInteracted { reference_cohort: None }
    }
}

/// Normal prior scales for the location parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventStudyPriors {
    /// Prior sd of the intercept.
    pub intercept_sd: f64,
    /// Prior sd of every event-time coefficient.
    pub coef_sd: f64,
    /// Prior sd of the log scale parameters, centred at the log outcome sd.
    pub log_scale_sd: f64,
}

impl Default for EventStudyPriors {
    fn default() -> Self {
        Self { intercept_sd: 100.0, coef_sd: 10.0, log_scale_sd: 2.0 }
    }
}

/// Event-study settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventStudyConfig {
    /// Fixed-effect structure.
    pub spec: EventStudySpec,
    /// Omitted event time.
    pub reference_event_time: i64,
    /// Posterior draws to return.
    pub n_draws: usize,
    /// Rescale weights to mean 1 before fitting.
    pub normalize_weights: bool,
    /// Priors.
    pub priors: EventStudyPriors,
    /// Optimizer for the scale parameters.
    pub optimizer: OptimizerConfig,
}

impl Default for EventStudyConfig {
    fn default() -> Self {
        Self {
            spec: EventStudySpec::default(),
            reference_event_time: -1,
            n_draws: 1000,
            normalize_weights: true,
            priors: EventStudyPriors::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

/// One event-time coefficient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTerm {
    /// Parameter name in the draws.
    pub name: String,
    /// Event time.
    pub event_time: i64,
    /// `Some(g)` for a cohort interaction, `None` for a main effect.
    pub cohort: Option<u32>,
}

/// Event times observed for one cohort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortSupport {
    /// Adoption period.
    pub cohort: u32,
    /// Units in the cohort.
    pub n_units: usize,
    /// Realized event times (reference included).
    pub event_times: Vec<i64>,
}

/// A fitted event study.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStudyFit {
    /// Specification that was fitted.
    pub spec: EventStudySpec,
    /// Omitted event time.
    pub reference_event_time: i64,
    /// Reference cohort of an interacted fit.
    pub reference_cohort: Option<u32>,
    /// Event-time coefficients.
    pub terms: Vec<EventTerm>,
    /// Posterior draws of every parameter.
    pub draws: PosteriorDraws,
    /// Residual sd at the mode.
    pub sigma: f64,
    /// Unit random-effect sd at the mode.
    pub sd_id: f64,
    /// Period random-effect sd at the mode.
    pub sd_period: f64,
    /// Whether the scale optimisation converged.
    pub converged: bool,
    /// Observations used.
    pub n_obs: usize,
    /// Log marginal posterior density of the scales at the mode.
    pub log_marginal: f64,
    /// Cohorts in the fitted data.
    pub cohort_support: Vec<CohortSupport>,
}

impl EventStudyFit {
    /// Draws of the main effect at event time `e`.
    pub fn main_effect_draws(&self, e: i64) -> Option<Vec<f64>> {
        self.term_draws(e, None)
    }

    /// Draws of the interaction for cohort `g` at event time `e`.
    pub fn interaction_draws(&self, e: i64, g: u32) -> Option<Vec<f64>> {
        self.term_draws(e, Some(g))
    }

    fn term_draws(&self, e: i64, cohort: Option<u32>) -> Option<Vec<f64>> {
        let term = self.terms.iter().find(|t| t.event_time == e && t.cohort == cohort)?;
        self.draws.column_by_name(&term.name).ok()
    }

    /// Support of cohort `g`.
    pub fn cohort(&self, g: u32) -> Option<&CohortSupport> {
        self.cohort_support.iter().find(|c| c.cohort == g)
    }
}

/// Per-cohort pooled fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortFit {
    /// Adoption period of the fitted cohort.
    pub cohort: u32,
    /// Fit on that cohort plus the never-treated units.
    pub fit: EventStudyFit,
}

/// Coefficient name of a main effect or interaction.
pub fn term_name(e: i64, cohort: Option<u32>) -> String {
    match cohort {
        None => format!("b_et[{e}]"),
        Some(g) => format!("b_et[{e}]:cohort[{g}]"),
    }
}

fn event_terms(
    panel: &Panel,
    spec: &EventStudySpec,
    ref_e: i64,
) -> Result<(Vec<EventTerm>, Option<u32>)> {
    let cohorts = panel.cohorts();
    if cohorts.is_empty() {
        return Err(Error::Validation("event study needs at least one treated cohort".to_string()));
    }

    let mut mains: Vec<i64> = cohorts.iter().flat_map(|&g| panel.event_times(g)).collect();
    mains.sort_unstable();
    mains.dedup();
    mains.retain(|&e| e != ref_e);
    let mut terms: Vec<EventTerm> = mains
        .iter()
        .map(|&e| EventTerm { name: term_name(e, None), event_time: e, cohort: None })
        .collect();

    let reference = match spec {
        EventStudySpec::Pooled => None,
        EventStudySpec::CohortInteracted { reference_cohort } => {
            let refc = reference_cohort.unwrap_or(cohorts[0]);
            if !cohorts.contains(&refc) {
                return Err(Error::Validation(format!(
                    "reference cohort {refc} not present in panel (cohorts {cohorts:?})"
                )));
            }
            let ref_times = panel.event_times(refc);
            for &g in cohorts.iter().filter(|&&g| g != refc) {
                for e in panel.event_times(g) {
                    if e != ref_e && ref_times.contains(&e) {
                        terms.push(EventTerm {
                            name: term_name(e, Some(g)),
                            event_time: e,
                            cohort: Some(g),
                        });
                    }
                }
            }
            Some(refc)
        }
    };
    Ok((terms, reference))
}

/// Weighted sufficient statistics of the design.
///
/// Location vector is `[u (units) | b0, fixed.., v (periods)]`; everything
/// below refers to the second block, of size `q`.
struct Design {
    q: usize,
    n_fixed: usize,
    n_periods: usize,
    n_units: usize,
    sw: f64,
    swyy: f64,
    /// Per-unit `Σ w`.
    unit_sw: Vec<f64>,
    /// Per-unit `Σ w y`.
    unit_swy: Vec<f64>,
    /// Per-unit `Σ w z` (rows).
    unit_swz: DMatrix<f64>,
    /// `Σ w z zᵀ`.
    gram: DMatrix<f64>,
    /// `Σ w z y`.
    swzy: DVector<f64>,
}

impl Design {
    fn build(panel: &Panel, weights: &[f64], terms: &[EventTerm], ref_cohort: Option<u32>) -> Self {
        let n_fixed = terms.len();
        let n_periods = panel.n_periods() as usize;
        let n_units = panel.n_units();
        let q = 1 + n_fixed + n_periods;

        let mut unit_sw = vec![0.0; n_units];
        let mut unit_swy = vec![0.0; n_units];
        let mut unit_swz = DMatrix::zeros(n_units, q);
        let mut gram = DMatrix::zeros(q, q);
        let mut swzy = DVector::zeros(q);
        let mut sw = 0.0;
        let mut swyy = 0.0;

        let mut cols = Vec::with_capacity(4);
        for (j, unit) in panel.units().iter().enumerate() {
            let obs = panel.unit_observations(j);
            let w_unit = &weights[j * n_periods..(j + 1) * n_periods];
            for (o, &w) in obs.iter().zip(w_unit) {
                cols.clear();
                cols.push(0);
                if let Some(e) = o.event_time {
                    for (k, t) in terms.iter().enumerate() {
                        let hit = t.event_time == e
                            && match t.cohort {
                                None => true,
                                Some(g) => unit.cohort == Some(g) && Some(g) != ref_cohort,
                            };
                        if hit {
                            cols.push(1 + k);
                        }
                    }
                }
                cols.push(1 + n_fixed + (o.period as usize - 1));

                sw += w;
                swyy += w * o.y * o.y;
                unit_sw[j] += w;
                unit_swy[j] += w * o.y;
                for &a in &cols {
                    unit_swz[(j, a)] += w;
                    swzy[a] += w * o.y;
                    for &b in &cols {
                        gram[(a, b)] += w;
                    }
                }
            }
        }

        Self { q, n_fixed, n_periods, n_units, sw, swyy, unit_sw, unit_swy, unit_swz, gram, swzy }
    }
}

/// Conditional posterior of the location parameters at fixed scales.
struct Conditional {
    /// Unit-block precision diagonal.
    d: Vec<f64>,
    /// Schur complement `S` (precision of the non-unit block).
    schur: DMatrix<f64>,
    /// `b_r − Cᵀ D⁻¹ b_u`.
    rhs: DVector<f64>,
    /// `b_u`.
    b_u: Vec<f64>,
    s2: f64,
}

struct MarginalObjective<'a> {
    design: &'a Design,
    priors: &'a EventStudyPriors,
    log_scale_center: f64,
}

impl MarginalObjective<'_> {
    /// `params = [ln σ, ln sd_id, ln sd_period]`.
    fn conditional(&self, params: &[f64]) -> Conditional {
        let dz = self.design;
        let s2 = (2.0 * params[0]).exp();
        let su2 = (2.0 * params[1]).exp();
        let sv2 = (2.0 * params[2]).exp();

        let d: Vec<f64> = dz.unit_sw.iter().map(|&w| w / s2 + 1.0 / su2).collect();
        let b_u: Vec<f64> = dz.unit_swy.iter().map(|&v| v / s2).collect();

        let mut schur = &dz.gram / s2;
        schur[(0, 0)] += 1.0 / self.priors.intercept_sd.powi(2);
        for k in 0..dz.n_fixed {
            schur[(1 + k, 1 + k)] += 1.0 / self.priors.coef_sd.powi(2);
        }
        for t in 0..dz.n_periods {
            let idx = 1 + dz.n_fixed + t;
            schur[(idx, idx)] += 1.0 / sv2;
        }

        // C = unit_swz / s2, so Cᵀ D⁻¹ C = unit_swzᵀ diag(1/(s2² d)) unit_swz.
        let mut scaled = dz.unit_swz.clone();
        for (j, mut row) in scaled.row_iter_mut().enumerate() {
            row /= s2 * s2 * d[j];
        }
        schur -= dz.unit_swz.transpose() * &scaled;

        let mut rhs = &dz.swzy / s2;
        let mut adj = DVector::zeros(dz.q);
        for j in 0..dz.n_units {
            let f = b_u[j] / (s2 * d[j]);
            for a in 0..dz.q {
                adj[a] += dz.unit_swz[(j, a)] * f;
            }
        }
        rhs -= adj;

        Conditional { d, schur, rhs, b_u, s2 }
    }

    fn log_marginal(&self, params: &[f64]) -> Result<(f64, Conditional, DVector<f64>)> {
        let dz = self.design;
        let cond = self.conditional(params);
        let chol = cholesky_jittered(&cond.schur)?;
        let r_hat = chol.solve(&cond.rhs);

        let unit_quad: f64 = cond.b_u.iter().zip(&cond.d).map(|(b, d)| b * b / d).sum();
        let quad = unit_quad + cond.rhs.dot(&r_hat);
        let log_det = cond.d.iter().map(|d| d.ln()).sum::<f64>() + log_det_from_cholesky(&chol)?;

        let log_prior_norm = self.priors.intercept_sd.ln()
            + dz.n_fixed as f64 * self.priors.coef_sd.ln()
            + dz.n_periods as f64 * params[2]
            + dz.n_units as f64 * params[1];

        let ll = -dz.sw * params[0] - 0.5 * dz.sw * (2.0 * PI).ln() - log_prior_norm
            - 0.5 * dz.swyy / cond.s2
            + 0.5 * quad
            - 0.5 * log_det;

        let hyper: f64 = params
            .iter()
            .map(|&p| {
                let z = (p - self.log_scale_center) / self.priors.log_scale_sd;
                -0.5 * z * z
            })
            .sum();

        let value = ll + hyper;
        if !value.is_finite() {
            return Err(Error::Computation("non-finite marginal likelihood".to_string()));
        }
        Ok((value, cond, r_hat))
    }
}

impl ObjectiveFunction for MarginalObjective<'_> {
    /// Negative log marginal per unit of weight, so tolerances do not scale
    /// with the panel size.
    fn eval(&self, params: &[f64]) -> Result<f64> {
        Ok(-self.log_marginal(params)?.0 / self.design.sw)
    }
}

fn validate_config(config: &EventStudyConfig) -> Result<()> {
    if config.n_draws == 0 {
        return Err(Error::Validation("n_draws must be >= 1".to_string()));
    }
    let p = &config.priors;
    for (name, v) in
        [("intercept_sd", p.intercept_sd), ("coef_sd", p.coef_sd), ("log_scale_sd", p.log_scale_sd)]
    {
        if !(v.is_finite() && v > 0.0) {
            return Err(Error::Validation(format!("{name} must be finite and > 0")));
        }
    }
    Ok(())
}

/// Fit the event study on `panel` with per-observation weights.
pub fn fit_event_study(
    panel: &Panel,
    obs_weights: &[f64],
    config: &EventStudyConfig,
    seed: u64,
) -> Result<EventStudyFit> {
    validate_config(config)?;
    let n_obs = panel.observations().len();
    if obs_weights.len() != n_obs {
        return Err(Error::Validation(format!(
            "expected {} observation weights, got {}",
            n_obs,
            obs_weights.len()
        )));
    }
    if obs_weights.iter().any(|w| !(w.is_finite() && *w > 0.0)) {
        return Err(Error::Validation("observation weights must be finite and > 0".to_string()));
    }
    let weights: Vec<f64> = if config.normalize_weights {
        let m = obs_weights.iter().sum::<f64>() / n_obs as f64;
        obs_weights.iter().map(|w| w / m).collect()
    } else {
        obs_weights.to_vec()
    };

    let start = Instant::now();
    let ref_e = config.reference_event_time;
    let (terms, reference_cohort) = event_terms(panel, &config.spec, ref_e)?;
    let design = Design::build(panel, &weights, &terms, reference_cohort);

    let ybar = design.unit_swy.iter().sum::<f64>() / design.sw;
    let y_var = (design.swyy / design.sw - ybar * ybar).max(1e-12);
    let center = 0.5 * y_var.ln();
    let objective =
        MarginalObjective { design: &design, priors: &config.priors, log_scale_center: center };

    let init = [center - 0.35, center - 0.7, center - 1.4];
    let bounds = [(center - 12.0, center + 5.0); 3];
    let opt = LbfgsOptimizer::new(config.optimizer.clone()).minimize(&objective, &init, &bounds)?;
    if !opt.converged {
        log::warn!("event study: scale optimisation did not converge ({})", opt.message);
    }
    let (log_marginal, cond, r_hat) = objective.log_marginal(&opt.parameters)?;
    let [ln_sigma, ln_sd_id, ln_sd_period] =
        [opt.parameters[0], opt.parameters[1], opt.parameters[2]];

    let chol = cholesky_jittered(&cond.schur)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let r_draws = gaussian_draws_from_precision(r_hat.as_slice(), &chol, config.n_draws, &mut rng)?;

    let (sigma, sd_id, sd_period) = (ln_sigma.exp(), ln_sd_id.exp(), ln_sd_period.exp());
    let q = design.q;
    let n_units = design.n_units;

    let mut names = Vec::with_capacity(q + 3 + n_units);
    names.push("b_Intercept".to_string());
    names.extend(terms.iter().map(|t| t.name.clone()));
    names.extend(["sd_id".to_string(), "sd_period".to_string(), "sigma".to_string()]);
    names.extend(panel.units().iter().map(|u| format!("r_id[{}]", u.id)));
    names.extend((1..=design.n_periods).map(|t| format!("r_period[{t}]")));

    let mut draws = Vec::with_capacity(config.n_draws);
    for r in &r_draws {
        let mut row = Vec::with_capacity(names.len());
        row.extend_from_slice(&r[..1 + design.n_fixed]);
        row.extend([sd_id, sd_period, sigma]);
        for j in 0..n_units {
            let cr: f64 = (0..q).map(|a| design.unit_swz[(j, a)] * r[a]).sum::<f64>() / cond.s2;
            let mean = (cond.b_u[j] - cr) / cond.d[j];
            let z: f64 = StandardNormal.sample(&mut rng);
            row.push(mean + z / cond.d[j].sqrt());
        }
        row.extend_from_slice(&r[1 + design.n_fixed..]);
        draws.push(row);
    }

    let mut mode = Vec::with_capacity(names.len());
    mode.extend_from_slice(&r_hat.as_slice()[..1 + design.n_fixed]);
    mode.extend([sd_id, sd_period, sigma]);
    for j in 0..n_units {
        let cr: f64 = (0..q).map(|a| design.unit_swz[(j, a)] * r_hat[a]).sum::<f64>() / cond.s2;
        mode.push((cond.b_u[j] - cr) / cond.d[j]);
    }
    mode.extend_from_slice(&r_hat.as_slice()[1 + design.n_fixed..]);

    let sizes = panel.cohort_sizes();
    let cohort_support = panel
        .cohorts()
        .iter()
        .map(|&g| CohortSupport {
            cohort: g,
            n_units: sizes.get(&Some(g)).copied().unwrap_or(0),
            event_times: panel.event_times(g),
        })
        .collect();

    log::info!(
        "event study: {} terms, sigma={:.3} sd_id={:.3} sd_period={:.3} ({:.2}s)",
        terms.len(),
        sigma,
        sd_id,
        sd_period,
        start.elapsed().as_secs_f64()
    );

    Ok(EventStudyFit {
        spec: config.spec.clone(),
        reference_event_time: ref_e,
        reference_cohort,
        terms,
        draws: PosteriorDraws::new(names, draws, mode)?,
        sigma,
        sd_id,
        sd_period,
        converged: opt.converged,
        n_obs,
        log_marginal,
        cohort_support,
    })
}

/// Fit one pooled event study per cohort, each on that cohort's units plus
/// the never-treated units, in parallel. Returns after every fit finished,
/// ordered by cohort.
///
/// `n_threads = 0` uses the global rayon pool.
pub fn fit_per_cohort(
    panel: &Panel,
    obs_weights: &[f64],
    config: &EventStudyConfig,
    n_threads: usize,
    seed: u64,
) -> Result<Vec<CohortFit>> {
    if !panel.has_never_treated() {
        return Err(Error::Validation("per-cohort fits need never-treated units".to_string()));
    }
    if obs_weights.len() != panel.observations().len() {
        return Err(Error::Validation(format!(
            "expected {} observation weights, got {}",
            panel.observations().len(),
            obs_weights.len()
        )));
    }
    let t = panel.n_periods() as usize;
    let pooled = EventStudyConfig { spec: EventStudySpec::Pooled, ..config.clone() };

    let fit_one = |g: u32| -> Result<CohortFit> {
        let keep = [None, Some(g)];
        let sub = panel.subset(&keep)?;
        let w: Vec<f64> = panel
            .units()
            .iter()
            .enumerate()
            .filter(|(_, u)| keep.contains(&u.cohort))
            .flat_map(|(j, _)| obs_weights[j * t..(j + 1) * t].iter().copied())
            .collect();
        log::debug!("per-cohort fit: cohort {} ({} units)", g, sub.n_units());
        let fit = fit_event_study(&sub, &w, &pooled, seed.wrapping_add(u64::from(g)))?;
        Ok(CohortFit { cohort: g, fit })
    };

    let run = || -> Result<Vec<CohortFit>> {
        panel.cohorts().par_iter().map(|&g| fit_one(g)).collect()
    };

    if n_threads > 0 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build()
            .map_err(|e| Error::Computation(format!("failed to create thread pool: {e}")))?;
        pool.install(run)
    } else {
        run()
    }
}
