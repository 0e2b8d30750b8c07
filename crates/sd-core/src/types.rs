//! Common data types

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Posterior draws returned by a [`crate::PosteriorSampler`].
///
/// `draws[d][j]` is draw `d` of parameter `j`; `mode` is the point the sampler
/// centred on (MAP for Laplace-type samplers).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PosteriorDraws {
    /// Parameter names (column order).
    pub param_names: Vec<String>,
    /// Draws, row-major (one row per draw).
    pub draws: Vec<Vec<f64>>,
    /// Posterior mode / centre.
    pub mode: Vec<f64>,
}

impl PosteriorDraws {
    /// Create draws, validating that every row matches the parameter count.
    pub fn new(param_names: Vec<String>, draws: Vec<Vec<f64>>, mode: Vec<f64>) -> Result<Self> {
        let p = param_names.len();
        if mode.len() != p {
            return Err(Error::Validation(format!(
                "mode has {} entries, expected {}",
                mode.len(),
                p
            )));
        }
        if let Some((d, row)) = draws.iter().enumerate().find(|(_, r)| r.len() != p) {
            return Err(Error::Validation(format!(
                "draw {} has {} entries, expected {}",
                d,
                row.len(),
                p
            )));
        }
        Ok(Self { param_names, draws, mode })
    }

    /// Number of draws.
    pub fn n_draws(&self) -> usize {
        self.draws.len()
    }

    /// Number of parameters.
    pub fn dim(&self) -> usize {
        self.param_names.len()
    }

    /// Column index of a named parameter.
    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.param_names.iter().position(|n| n == name)
    }

    /// All draws of parameter `idx`.
    pub fn column(&self, idx: usize) -> Vec<f64> {
        self.draws.iter().map(|d| d[idx]).collect()
    }

    /// All draws of a named parameter.
    pub fn column_by_name(&self, name: &str) -> Result<Vec<f64>> {
        let idx = self
            .param_index(name)
            .ok_or_else(|| Error::Validation(format!("unknown parameter '{name}'")))?;
        Ok(self.column(idx))
    }

    /// Posterior mean of parameter `idx`.
    pub fn mean(&self, idx: usize) -> f64 {
        if self.draws.is_empty() {
            return f64::NAN;
        }
        self.draws.iter().map(|d| d[idx]).sum::<f64>() / self.draws.len() as f64
    }
}
