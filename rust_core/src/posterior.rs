//! Unnormalised log posterior and its closed-form gradient.
//!
//! `logπ(x) = -‖Ax - y‖² / (2σ²) - Σᵢ φ((Lx)ᵢ)`
//!
//! Estimators consume the posterior through [`LogDensity`]. Minimisers work on
//! the negated value; samplers use it directly.

use crate::error::{ConfigError, Result};
use crate::forward::{ForwardOperator, Measurement};
use crate::prior::Prior;
use std::sync::Arc;

/// Capability set an estimator needs from a target density.
pub trait LogDensity {
    fn dim(&self) -> usize;

    fn log_density(&self, x: &[f64]) -> f64;

    fn log_density_and_gradient(&self, x: &[f64]) -> (f64, Vec<f64>);
}

/// Per-problem configuration: forward operator, data, likelihood variance and
/// the selected prior.
///
/// Owned by one caller. `set_prior` swaps the prior between estimation calls;
/// estimators only borrow the context immutably.
#[derive(Debug, Clone)]
pub struct PosteriorContext {
    forward: Arc<ForwardOperator>,
    data: Vec<f64>,
    likelihood_variance: f64,
    prior: Option<Prior>,
}

impl PosteriorContext {
    /// A context with a flat prior; call `set_prior` before estimating under a
    /// regularized posterior.
    pub fn new(
        forward: Arc<ForwardOperator>,
        measurement: &Measurement,
        likelihood_variance: f64,
    ) -> Result<Self> {
        let rows = forward.matrix().nrows();
        if measurement.values.len() != rows {
            return Err(ConfigError::DimensionMismatch {
                what: "measurement length",
                expected: rows,
                actual: measurement.values.len(),
            }
            .into());
        }
        if !(likelihood_variance > 0.0 && likelihood_variance.is_finite()) {
            return Err(ConfigError::InvalidHyperparameter {
                name: "likelihood_variance",
                value: likelihood_variance,
                reason: "must be finite and positive",
            }
            .into());
        }
        Ok(Self {
            forward,
            data: measurement.values.clone(),
            likelihood_variance,
            prior: None,
        })
    }

    pub fn with_prior(mut self, prior: Prior) -> Result<Self> {
        self.set_prior(prior)?;
        Ok(self)
    }

    pub fn set_prior(&mut self, prior: Prior) -> Result<()> {
        let n = self.grid_size();
        let op = prior.operator();
        if op.grid_size() != n || op.stacked().ncols() != n * n {
            return Err(ConfigError::DimensionMismatch {
                what: "prior grid size",
                expected: n,
                actual: op.grid_size(),
            }
            .into());
        }
        self.prior = Some(prior);
        Ok(())
    }

    pub fn clear_prior(&mut self) {
        self.prior = None;
    }

    pub fn grid_size(&self) -> usize {
        self.forward.grid_size()
    }

    pub fn forward(&self) -> &ForwardOperator {
        &self.forward
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn likelihood_variance(&self) -> f64 {
        self.likelihood_variance
    }

    pub fn prior(&self) -> Option<&Prior> {
        self.prior.as_ref()
    }

    /// Gradient-based samplers need a differentiable prior (`β > 0` for the
    /// pseudo-Huber families).
    pub fn check_differentiable(&self) -> std::result::Result<(), ConfigError> {
        match &self.prior {
            Some(prior) if !prior.is_smooth() => Err(ConfigError::InvalidHyperparameter {
                name: "beta",
                value: prior.beta(),
                reason: "gradient-based sampling requires beta > 0",
            }),
            _ => Ok(()),
        }
    }

    /// `Ax - y`.
    pub fn residual(&self, x: &[f64]) -> Vec<f64> {
        let mut r = self.forward.project(x);
        for (ri, yi) in r.iter_mut().zip(&self.data) {
            *ri -= yi;
        }
        r
    }

    pub fn log_likelihood(&self, x: &[f64]) -> f64 {
        let r = self.residual(x);
        -0.5 / self.likelihood_variance * r.iter().map(|v| v * v).sum::<f64>()
    }

    pub fn log_prior(&self, x: &[f64]) -> f64 {
        match &self.prior {
            None => 0.0,
            Some(prior) => {
                let u = prior.operator().stacked().apply(x);
                -u.iter().map(|&ui| prior.row_penalty(ui)).sum::<f64>()
            }
        }
    }
}

impl LogDensity for PosteriorContext {
    fn dim(&self) -> usize {
        self.forward.matrix().ncols()
    }

    fn log_density(&self, x: &[f64]) -> f64 {
        self.log_likelihood(x) + self.log_prior(x)
    }

    fn log_density_and_gradient(&self, x: &[f64]) -> (f64, Vec<f64>) {
        let r = self.residual(x);
        let inv_var = 1.0 / self.likelihood_variance;
        let mut logp = -0.5 * inv_var * r.iter().map(|v| v * v).sum::<f64>();
        let mut grad = self.forward.matrix().apply_transpose(&r);
        grad.iter_mut().for_each(|g| *g *= -inv_var);

        if let Some(prior) = &self.prior {
            let l = prior.operator().stacked();
            let u = l.apply(x);
            logp -= u.iter().map(|&ui| prior.row_penalty(ui)).sum::<f64>();
            let dphi: Vec<f64> = u.iter().map(|&ui| prior.row_penalty_derivative(ui)).collect();
            for (g, lt) in grad.iter_mut().zip(l.apply_transpose(&dphi)) {
                *g -= lt;
            }
        }
        (logp, grad)
    }
}
