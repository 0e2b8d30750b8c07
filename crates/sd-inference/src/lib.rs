//! # sd-inference
//!
//! Estimation for the staggered difference-in-differences study.
//!
//! This crate provides:
//! - L-BFGS optimisation of [`sd_core::LogDensityModel`] objectives
//! - A Laplace (Gaussian) posterior sampler behind the
//!   [`sd_core::PosteriorSampler`] seam
//! - Categorical (multinomial logit) regression
//! - The DiD pipeline: simulation, propensity weighting, balance, event
//!   study, aggregation, group-time ATT and power analysis

#![warn(missing_docs)]
#![warn(clippy::all)]

/// JSON cache of fitted results.
pub mod cache;
/// Staggered DiD pipeline.
pub mod did;
/// Laplace approximation and Gaussian posterior sampler.
pub mod laplace;
/// Generic numerical optimizer (L-BFGS backend).
pub mod optimizer;
/// Categorical regression models.
pub mod regression;

pub use cache::{CacheStatus, load_or_compute};
pub use laplace::{LaplaceConfig, LaplaceSampler, laplace_log_marginal};
pub use optimizer::{LbfgsOptimizer, ObjectiveFunction, OptimizationResult, OptimizerConfig};
pub use regression::MultinomialLogitModel;
