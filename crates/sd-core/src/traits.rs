//! Core traits
//!
//! Estimation code depends on these interfaces, not on concrete models or
//! samplers: the propensity model is sampled through [`PosteriorSampler`] the
//! same way any other [`LogDensityModel`] would be.

use crate::Result;
use crate::types::PosteriorDraws;

/// Model interface for optimisation and posterior approximation.
///
/// `nll` is the negative log posterior density up to an additive constant
/// (likelihood plus any priors the model carries).
pub trait LogDensityModel: Send + Sync {
    /// Number of parameters.
    fn dim(&self) -> usize;

    /// Parameter names (stable order).
    fn parameter_names(&self) -> Vec<String>;

    /// Parameter bounds (min, max) (stable order).
    fn parameter_bounds(&self) -> Vec<(f64, f64)> {
        vec![(f64::NEG_INFINITY, f64::INFINITY); self.dim()]
    }

    /// Suggested initial values (stable order).
    fn parameter_init(&self) -> Vec<f64>;

    /// Negative log density.
    fn nll(&self, params: &[f64]) -> Result<f64>;

    /// Gradient of `nll`.
    fn grad_nll(&self, params: &[f64]) -> Result<Vec<f64>>;
}

/// Opaque posterior sampler: given a model, return posterior draws.
///
/// How the draws are produced (Laplace approximation, MCMC, a remote
/// probabilistic-programming service) is the implementation's business.
pub trait PosteriorSampler: Send + Sync {
    /// Draw from the posterior of `model`. Identical seeds give identical draws.
    fn sample<M: LogDensityModel + ?Sized>(&self, model: &M, seed: u64) -> Result<PosteriorDraws>;

    /// Sampler name (e.g. "laplace").
    fn name(&self) -> &str;
}
