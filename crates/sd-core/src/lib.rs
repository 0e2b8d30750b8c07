//! # sd-core
//!
//! Core types, traits, and error handling for staggered DiD studies.
//!
//! This crate provides:
//! - Common error types
//! - Core traits (`LogDensityModel`, `PosteriorSampler`)
//! - Shared data structures (`PosteriorDraws`)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::{LogDensityModel, PosteriorSampler};
pub use types::PosteriorDraws;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
