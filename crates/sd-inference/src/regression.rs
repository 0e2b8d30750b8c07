//! Categorical regression models.
//!
//! [`MultinomialLogitModel`] implements [`sd_core::LogDensityModel`], so it
//! can be fitted by MAP ([`crate::optimizer::LbfgsOptimizer::minimize_model`])
//! or sampled through any [`sd_core::PosteriorSampler`]. With two categories it
//! is ordinary logistic regression.

use sd_core::{Error, LogDensityModel, Result};
use sd_prob::math::softmax_into;

#[inline]
fn row_dot(x_row: &[f64], beta: &[f64]) -> f64 {
    debug_assert_eq!(x_row.len(), beta.len());
    x_row.iter().zip(beta).map(|(&x, &b)| x * b).sum()
}

/// Dense row-major design matrix.
#[derive(Debug, Clone)]
struct DenseX {
    n: usize,
    p: usize,
    data: Vec<f64>,
}

impl DenseX {
    fn from_rows(x: Vec<Vec<f64>>) -> Result<Self> {
        let n = x.len();
        let p = x.first().map(|r| r.len()).unwrap_or(0);
        if n == 0 || p == 0 {
            return Err(Error::Validation("X must be non-empty (n>0, p>0)".to_string()));
        }
        let mut data = Vec::with_capacity(n * p);
        for (i, row) in x.into_iter().enumerate() {
            if row.len() != p {
                return Err(Error::Validation(format!(
                    "X must be rectangular: row {} has len {}, expected {}",
                    i,
                    row.len(),
                    p
                )));
            }
            if row.iter().any(|v| !v.is_finite()) {
                return Err(Error::Validation("X must contain only finite values".to_string()));
            }
            data.extend(row);
        }
        Ok(Self { n, p, data })
    }

    #[inline]
    fn row(&self, i: usize) -> &[f64] {
        let start = i * self.p;
        &self.data[start..start + self.p]
    }
}

/// Multinomial (categorical) logit with an intercept per category.
///
/// Model: `P(y_i = k) = softmax(eta_i)_k`, `eta_ik = a_k + X_i · b_k`, with
/// category 0 as reference (`a_0 = 0`, `b_0 = 0`) and independent
/// `Normal(0, prior_sd)` priors on every free coefficient.
///
/// Parameter layout: for each non-reference category `k = 1..K`, the block
/// `[a_k, b_k1, ..., b_kp]`.
#[derive(Debug, Clone)]
pub struct MultinomialLogitModel {
    x: DenseX,
    y: Vec<usize>,
    labels: Vec<String>,
    prior_sd: f64,
}

impl MultinomialLogitModel {
    /// Create a model from row-wise `X`, category indices `y` and category
    /// labels (`labels[0]` is the reference category).
    pub fn new(
        x: Vec<Vec<f64>>,
        y: Vec<usize>,
        labels: Vec<String>,
        prior_sd: f64,
    ) -> Result<Self> {
        let x = DenseX::from_rows(x)?;
        if y.len() != x.n {
            return Err(Error::Validation(format!(
                "y has wrong length: expected n={}, got {}",
                x.n,
                y.len()
            )));
        }
        if labels.len() < 2 {
            return Err(Error::Validation("need at least 2 categories".to_string()));
        }
        if let Some(&bad) = y.iter().find(|&&k| k >= labels.len()) {
            return Err(Error::Validation(format!(
                "category index {} out of range for {} categories",
                bad,
                labels.len()
            )));
        }
        if !(prior_sd.is_finite() && prior_sd > 0.0) {
            return Err(Error::Validation(format!("prior_sd must be > 0, got {prior_sd}")));
        }
        Ok(Self { x, y, labels, prior_sd })
    }

    /// Number of categories (including the reference).
    pub fn n_categories(&self) -> usize {
        self.labels.len()
    }

    /// Number of observations.
    pub fn n_obs(&self) -> usize {
        self.x.n
    }

    #[inline]
    fn block(&self) -> usize {
        self.x.p + 1
    }

    fn check_params(&self, params: &[f64]) -> Result<()> {
        if params.len() != self.dim() {
            return Err(Error::Validation(format!(
                "expected {} parameters, got {}",
                self.dim(),
                params.len()
            )));
        }
        if params.iter().any(|v| !v.is_finite()) {
            return Err(Error::Validation("params must contain only finite values".to_string()));
        }
        Ok(())
    }

    /// Linear predictors of one row into `eta` (length K, `eta[0] = 0`).
    fn eta_row(&self, x_row: &[f64], params: &[f64], eta: &mut [f64]) {
        let b = self.block();
        eta[0] = 0.0;
        for k in 1..self.n_categories() {
            let coef = &params[(k - 1) * b..k * b];
            eta[k] = coef[0] + row_dot(x_row, &coef[1..]);
        }
    }

    /// Category probabilities for observation `i` under `params`.
    pub fn predict_row(&self, i: usize, params: &[f64], out: &mut [f64]) {
        let mut eta = vec![0.0; self.n_categories()];
        self.eta_row(self.x.row(i), params, &mut eta);
        softmax_into(&eta, out);
    }

    /// Category probabilities for a new covariate row.
    pub fn predict(&self, x_row: &[f64], params: &[f64]) -> Result<Vec<f64>> {
        self.check_params(params)?;
        if x_row.len() != self.x.p {
            return Err(Error::Validation(format!(
                "x_row has {} features, expected {}",
                x_row.len(),
                self.x.p
            )));
        }
        let mut eta = vec![0.0; self.n_categories()];
        self.eta_row(x_row, params, &mut eta);
        let mut out = vec![0.0; self.n_categories()];
        softmax_into(&eta, &mut out);
        Ok(out)
    }
}

impl LogDensityModel for MultinomialLogitModel {
    fn dim(&self) -> usize {
        (self.n_categories() - 1) * self.block()
    }

    fn parameter_names(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.dim());
        for label in &self.labels[1..] {
            out.push(format!("b_mu{}_Intercept", label));
            for j in 0..self.x.p {
                out.push(format!("b_mu{}_x{}", label, j + 1));
            }
        }
        out
    }

    fn parameter_init(&self) -> Vec<f64> {
        vec![0.0; self.dim()]
    }

    fn nll(&self, params: &[f64]) -> Result<f64> {
        self.check_params(params)?;
        let k = self.n_categories();
        let mut eta = vec![0.0; k];
        let mut prob = vec![0.0; k];
        let mut nll = 0.0;
        for i in 0..self.x.n {
            self.eta_row(self.x.row(i), params, &mut eta);
            let lse = softmax_into(&eta, &mut prob);
            nll += lse - eta[self.y[i]];
        }
        let inv_var = 1.0 / (self.prior_sd * self.prior_sd);
        nll += 0.5 * inv_var * params.iter().map(|v| v * v).sum::<f64>();
        Ok(nll)
    }

    fn grad_nll(&self, params: &[f64]) -> Result<Vec<f64>> {
        self.check_params(params)?;
        let k = self.n_categories();
        let b = self.block();
        let mut grad = vec![0.0; self.dim()];
        let mut eta = vec![0.0; k];
        let mut prob = vec![0.0; k];
        for i in 0..self.x.n {
            let row = self.x.row(i);
            self.eta_row(row, params, &mut eta);
            softmax_into(&eta, &mut prob);
            for c in 1..k {
                let err = prob[c] - if self.y[i] == c { 1.0 } else { 0.0 };
                let g = &mut grad[(c - 1) * b..c * b];
                g[0] += err;
                for (gj, &xj) in g[1..].iter_mut().zip(row) {
                    *gj += err * xj;
                }
            }
        }
        let inv_var = 1.0 / (self.prior_sd * self.prior_sd);
        for (g, &p) in grad.iter_mut().zip(params) {
            *g += inv_var * p;
        }
        Ok(grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::LbfgsOptimizer;
    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng};

    fn labels(k: usize) -> Vec<String> {
        (0..k).map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let x = vec![vec![0.3], vec![-1.2], vec![2.0], vec![0.0], vec![0.7]];
        let y = vec![0, 1, 2, 2, 1];
        let m = MultinomialLogitModel::new(x, y, labels(3), 2.0).unwrap();
        let params = vec![0.1, -0.4, 0.3, 0.8];
        let g = m.grad_nll(&params).unwrap();
        for j in 0..params.len() {
            let mut p = params.clone();
            let h = 1e-6;
            p[j] += h;
            let fp = m.nll(&p).unwrap();
            p[j] -= 2.0 * h;
            let fm = m.nll(&p).unwrap();
            assert_abs_diff_eq!(g[j], (fp - fm) / (2.0 * h), epsilon = 1e-6);
        }
    }

    #[test]
    fn test_parameter_names_follow_categories() {
        let m = MultinomialLogitModel::new(
            vec![vec![0.0], vec![1.0]],
            vec![0, 1],
            vec!["never".into(), "4".into()],
            5.0,
        )
        .unwrap();
        assert_eq!(m.parameter_names(), vec!["b_mu4_Intercept", "b_mu4_x1"]);
        assert_eq!(m.dim(), 2);
    }

    #[test]
    fn test_map_recovers_logistic_coefficients() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let n = 4000;
        let mut x = Vec::with_capacity(n);
        let mut y = Vec::with_capacity(n);
        for _ in 0..n {
            let xi: f64 = rng.random_range(-2.0..2.0);
            let p = sd_prob::math::sigmoid(-0.5 + 1.5 * xi);
            y.push(usize::from(rng.random::<f64>() < p));
            x.push(vec![xi]);
        }
        let m = MultinomialLogitModel::new(x, y, labels(2), 10.0).unwrap();
        let fit = LbfgsOptimizer::default().minimize_model(&m).unwrap();
        assert_abs_diff_eq!(fit.parameters[0], -0.5, epsilon = 0.15);
        assert_abs_diff_eq!(fit.parameters[1], 1.5, epsilon = 0.2);

        let p = m.predict(&[0.0], &fit.parameters).unwrap();
        assert_abs_diff_eq!(p.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_validation() {
        assert!(MultinomialLogitModel::new(vec![], vec![], labels(2), 1.0).is_err());
        assert!(MultinomialLogitModel::new(vec![vec![1.0]], vec![2], labels(2), 1.0).is_err());
        assert!(MultinomialLogitModel::new(vec![vec![1.0]], vec![0], labels(1), 1.0).is_err());
        assert!(MultinomialLogitModel::new(vec![vec![1.0]], vec![0], labels(2), 0.0).is_err());
    }
}
