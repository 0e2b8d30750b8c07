//! Probability building blocks.
//!
//! This crate hosts reusable probability math used by the estimators:
//! - small numeric helpers (stable sigmoid/softmax primitives)
//! - standard Normal CDF, quantile and p-values
//! - sample quantiles and (weighted) moments

pub mod math;
pub mod normal;
pub mod summary;
