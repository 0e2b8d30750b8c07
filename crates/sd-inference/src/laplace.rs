//! Laplace (Gaussian) posterior approximation.
//!
//! The posterior of a [`LogDensityModel`] is approximated by a Normal centred
//! at the MAP with covariance `H⁻¹`, where `H` is the Hessian of the NLL at
//! the mode. [`LaplaceSampler`] draws from that Normal and is the default
//! implementation of the [`PosteriorSampler`] seam.
//!
//! The same machinery gives the Laplace approximation to the marginal
//! likelihood:
//!
//! `Z = ∫ exp(-NLL(x)) dx ≈ exp(-NLL(x_hat)) * (2π)^(d/2) * |H|^(-1/2)`

use nalgebra::{DMatrix, DVector, linalg::Cholesky};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use sd_core::{Error, LogDensityModel, PosteriorDraws, PosteriorSampler, Result};
use serde::{Deserialize, Serialize};

use crate::optimizer::{LbfgsOptimizer, OptimizerConfig};

/// Configuration of the Laplace sampler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaplaceConfig {
    /// Number of posterior draws.
    pub n_draws: usize,
    /// Relative finite-difference step for the Hessian.
    pub hessian_step: f64,
    /// Optimizer used to find the mode.
    pub optimizer: OptimizerConfig,
}

impl Default for LaplaceConfig {
    fn default() -> Self {
        Self { n_draws: 1000, hessian_step: 1e-4, optimizer: OptimizerConfig::default() }
    }
}

/// Result of a Laplace approximation at a given mode.
#[derive(Debug, Clone)]
pub struct LaplaceResult {
    /// Dimension of the parameter vector.
    pub dim: usize,
    /// NLL evaluated at the mode.
    pub nll_at_mode: f64,
    /// `log |H|` where `H` is the Hessian of NLL at the mode.
    pub log_det_hessian: f64,
    /// `log Z` where `Z = ∫ exp(-NLL(x)) dx` under the Laplace approximation.
    pub log_marginal: f64,
}

/// Hessian of the NLL by central differences of the analytic gradient.
pub fn numerical_hessian<M: LogDensityModel + ?Sized>(
    model: &M,
    params: &[f64],
    rel_step: f64,
) -> Result<DMatrix<f64>> {
    let n = params.len();
    let mut hessian = DMatrix::zeros(n, n);
    let mut work = params.to_vec();
    for j in 0..n {
        let eps = rel_step * params[j].abs().max(1.0);

        work[j] = params[j] + eps;
        let grad_plus = model.grad_nll(&work)?;
        work[j] = params[j] - eps;
        let grad_minus = model.grad_nll(&work)?;
        work[j] = params[j];

        for i in 0..n {
            hessian[(i, j)] = (grad_plus[i] - grad_minus[i]) / (2.0 * eps);
        }
    }

    let ht = hessian.transpose();
    Ok((&hessian + &ht) * 0.5)
}

/// Cholesky factor of a (numerically) positive-definite matrix.
///
/// Numeric Hessians can be slightly indefinite even at a mode, so a growing
/// diagonal jitter is tried before giving up.
pub(crate) fn cholesky_jittered(h: &DMatrix<f64>) -> Result<Cholesky<f64, nalgebra::Dyn>> {
    let n = h.nrows();
    if n != h.ncols() {
        return Err(Error::Validation("matrix must be square".to_string()));
    }
    let max_abs_diag = (0..n).map(|i| h[(i, i)].abs()).fold(0.0_f64, f64::max).max(1.0);

    let mut jitter = 1e-10 * max_abs_diag;
    for attempt in 0..9 {
        let mut h_try = h.clone();
        if attempt > 0 {
            for i in 0..n {
                h_try[(i, i)] += jitter;
            }
            jitter *= 10.0;
        }
        if let Some(chol) = Cholesky::new(h_try) {
            return Ok(chol);
        }
    }

    Err(Error::Computation("matrix is not positive definite".to_string()))
}

/// `log |A|` from a Cholesky factor.
pub(crate) fn log_det_from_cholesky(chol: &Cholesky<f64, nalgebra::Dyn>) -> Result<f64> {
    let l = chol.l_dirty();
    let mut sum = 0.0;
    for i in 0..l.nrows() {
        let d = l[(i, i)];
        if !d.is_finite() || d <= 0.0 {
            return Err(Error::Computation("non-finite/negative Cholesky diagonal".to_string()));
        }
        sum += d.ln();
    }
    Ok(2.0 * sum)
}

/// Draws from `N(mean, P⁻¹)` given the Cholesky factor `L` of the precision `P = L Lᵀ`.
///
/// `x = mean + L⁻ᵀ z` with `z ~ N(0, I)`.
pub(crate) fn gaussian_draws_from_precision(
    mean: &[f64],
    precision_chol: &Cholesky<f64, nalgebra::Dyn>,
    n_draws: usize,
    rng: &mut StdRng,
) -> Result<Vec<Vec<f64>>> {
    let d = mean.len();
    let lt = precision_chol.l().transpose();
    let mut out = Vec::with_capacity(n_draws);
    for _ in 0..n_draws {
        let z: DVector<f64> =
            DVector::from_iterator(d, (0..d).map(|_| StandardNormal.sample(&mut *rng)));
        let step = lt
            .solve_upper_triangular(&z)
            .ok_or_else(|| Error::Computation("triangular solve failed".to_string()))?;
        out.push(mean.iter().zip(step.iter()).map(|(m, s)| m + s).collect());
    }
    Ok(out)
}

/// Compute a Laplace approximation to the marginal likelihood at `params_mode`.
pub fn laplace_log_marginal<M: LogDensityModel + ?Sized>(
    model: &M,
    params_mode: &[f64],
) -> Result<LaplaceResult> {
    if params_mode.len() != model.dim() {
        return Err(Error::Validation("params length mismatch".to_string()));
    }

    let nll = model.nll(params_mode)?;
    if !nll.is_finite() {
        return Err(Error::Validation("nll at mode must be finite".to_string()));
    }

    let h = numerical_hessian(model, params_mode, 1e-4)?;
    let log_det = log_det_from_cholesky(&cholesky_jittered(&h)?)?;

    let d = params_mode.len() as f64;
    let log2pi = (2.0 * std::f64::consts::PI).ln();

    Ok(LaplaceResult {
        dim: params_mode.len(),
        nll_at_mode: nll,
        log_det_hessian: log_det,
        log_marginal: -nll + 0.5 * d * log2pi - 0.5 * log_det,
    })
}

/// Gaussian posterior sampler centred at the MAP.
#[derive(Debug, Clone, Default)]
pub struct LaplaceSampler {
    config: LaplaceConfig,
}

impl LaplaceSampler {
    /// Create a sampler.
    pub fn new(config: LaplaceConfig) -> Self {
        Self { config }
    }

    /// Sampler configuration.
    pub fn config(&self) -> &LaplaceConfig {
        &self.config
    }
}

impl PosteriorSampler for LaplaceSampler {
    fn sample<M: LogDensityModel + ?Sized>(&self, model: &M, seed: u64) -> Result<PosteriorDraws> {
        if self.config.n_draws == 0 {
            return Err(Error::Validation("n_draws must be >= 1".to_string()));
        }
        let opt = LbfgsOptimizer::new(self.config.optimizer.clone()).minimize_model(model)?;
        log::debug!(
            "laplace: mode found (dim={}, nll={:.4}, iters={})",
            model.dim(),
            opt.fval,
            opt.n_iter
        );

        let h = numerical_hessian(model, &opt.parameters, self.config.hessian_step)?;
        let chol = cholesky_jittered(&h)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let draws =
            gaussian_draws_from_precision(&opt.parameters, &chol, self.config.n_draws, &mut rng)?;

        PosteriorDraws::new(model.parameter_names(), draws, opt.parameters)
    }

    fn name(&self) -> &str {
        "laplace"
    }
}
