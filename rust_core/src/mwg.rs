//! Metropolis-within-Gibbs: single-coordinate random-walk updates.
//!
//! A proposal `x_j + σ·z` only touches the rows of `A` and `L` that have a
//! non-zero in column `j`, so the change in log posterior is evaluated from
//! cached residual `Ax - y` and regularization image `Lx`.

use crate::chain::Chain;
use crate::diagnostics::SamplerStats;
use crate::error::{ConfigError, Result};
use crate::posterior::{LogDensity, PosteriorContext};
use crate::progress::ProgressObserver;
use log::{debug, info};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOrder {
    Fixed,
    /// Reshuffled every sweep.
    Random,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MwgConfig {
    /// Sampling sweeps.
    pub num_samples: usize,
    /// Warm-up sweeps during which the proposal scale adapts.
    pub num_warmup: usize,
    pub sampsigma: f64,
    pub target_accept: f64,
    pub scan: ScanOrder,
    pub thinning: usize,
    pub keep_chain: bool,
}

impl Default for MwgConfig {
    fn default() -> Self {
        Self {
            num_samples: 100,
            num_warmup: 20,
            sampsigma: 1.0,
            target_accept: 0.44,
            scan: ScanOrder::Fixed,
            thinning: 1,
            keep_chain: false,
        }
    }
}

impl MwgConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.num_samples == 0 {
            return Err(ConfigError::InvalidHyperparameter {
                name: "num_samples",
                value: 0.0,
                reason: "needs at least one sampling-phase draw",
            });
        }
        if self.thinning == 0 {
            return Err(ConfigError::InvalidHyperparameter {
                name: "thinning",
                value: 0.0,
                reason: "must be at least 1",
            });
        }
        if !(self.sampsigma > 0.0 && self.sampsigma.is_finite()) {
            return Err(ConfigError::InvalidHyperparameter {
                name: "sampsigma",
                value: self.sampsigma,
                reason: "must be finite and positive",
            });
        }
        if !(self.target_accept > 0.0 && self.target_accept < 1.0) {
            return Err(ConfigError::InvalidHyperparameter {
                name: "target_accept",
                value: self.target_accept,
                reason: "must lie in (0, 1)",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MwgOutput {
    pub chain: Chain,
    /// Proposal scale after adaptation.
    pub sampsigma: f64,
    pub stats: SamplerStats,
}

/// Current point plus the products the local updates depend on.
pub(crate) struct CoordinateState<'a> {
    ctx: &'a PosteriorContext,
    x: Vec<f64>,
    residual: Vec<f64>,
    reg: Vec<f64>,
}

impl<'a> CoordinateState<'a> {
    pub(crate) fn new(ctx: &'a PosteriorContext, x: &[f64]) -> Self {
        let residual = ctx.residual(x);
        let reg = match ctx.prior() {
            Some(prior) => prior.operator().stacked().apply(x),
            None => Vec::new(),
        };
        Self {
            ctx,
            x: x.to_vec(),
            residual,
            reg,
        }
    }

    /// `logπ(x + δ e_j) - logπ(x)`.
    pub(crate) fn delta_log_posterior(&self, j: usize, delta: f64) -> f64 {
        let (rows, vals) = self.ctx.forward().matrix().column(j);
        let mut d_sq = 0.0;
        for (&i, &a) in rows.iter().zip(vals) {
            let r = self.residual[i];
            d_sq += delta * a * (2.0 * r + delta * a);
        }
        let mut out = -0.5 / self.ctx.likelihood_variance() * d_sq;

        if let Some(prior) = self.ctx.prior() {
            let (rows, vals) = prior.operator().stacked().column(j);
            for (&i, &l) in rows.iter().zip(vals) {
                let u = self.reg[i];
                out -= prior.row_penalty(u + delta * l) - prior.row_penalty(u);
            }
        }
        out
    }

    pub(crate) fn commit(&mut self, j: usize, delta: f64) {
        self.x[j] += delta;
        let (rows, vals) = self.ctx.forward().matrix().column(j);
        for (&i, &a) in rows.iter().zip(vals) {
            self.residual[i] += delta * a;
        }
        if let Some(prior) = self.ctx.prior() {
            let (rows, vals) = prior.operator().stacked().column(j);
            for (&i, &l) in rows.iter().zip(vals) {
                self.reg[i] += delta * l;
            }
        }
    }

    pub(crate) fn x(&self) -> &[f64] {
        &self.x
    }
}

/// Run a Metropolis-within-Gibbs chain from `initial`.
pub fn sample(
    ctx: &PosteriorContext,
    initial: &[f64],
    config: &MwgConfig,
    rng: &mut ChaCha8Rng,
    observer: &dyn ProgressObserver,
) -> Result<MwgOutput> {
    config.validate()?;
    let dim = ctx.dim();
    if initial.len() != dim {
        return Err(ConfigError::DimensionMismatch {
            what: "initial point",
            expected: dim,
            actual: initial.len(),
        }
        .into());
    }
    if !ctx.log_density(initial).is_finite() {
        return Err(ConfigError::NonFiniteStart.into());
    }
    info!(
        "MWG: dim={dim}, warmup={}, samples={}, sampsigma {:.3}",
        config.num_warmup, config.num_samples, config.sampsigma
    );

    let mut state = CoordinateState::new(ctx, initial);
    let mut stats = SamplerStats::default();
    let mut chain = Chain::new(dim, config.thinning, config.keep_chain);
    let mut log_sigma = config.sampsigma.ln();
    let mut order: Vec<usize> = (0..dim).collect();
    let total_sweeps = config.num_warmup + config.num_samples;

    for sweep in 0..total_sweeps {
        let is_warmup = sweep < config.num_warmup;
        let sigma = log_sigma.exp();
        if config.scan == ScanOrder::Random {
            order.shuffle(rng);
        }

        let mut accepted_in_sweep = 0usize;
        for &j in &order {
            let z: f64 = StandardNormal.sample(rng);
            let delta = sigma * z;
            let log_ratio = state.delta_log_posterior(j, delta);
            let accept_prob = if log_ratio.is_nan() {
                0.0
            } else {
                log_ratio.min(0.0).exp()
            };
            let accepted = rng.gen::<f64>() < accept_prob;
            if accepted {
                state.commit(j, delta);
                accepted_in_sweep += 1;
            }
            stats.record(is_warmup, accept_prob, accepted);
        }

        if is_warmup && dim > 0 {
            let acc = accepted_in_sweep as f64 / dim as f64;
            let t = (sweep + 1) as f64;
            log_sigma += (acc - config.target_accept) / t.sqrt();
            if sweep + 1 == config.num_warmup {
                debug!("MWG: warm-up done, sampsigma frozen at {:.4e}", log_sigma.exp());
            }
        }

        if !is_warmup {
            chain.push(state.x());
        }
        observer.on_iteration(sweep, total_sweeps);
    }

    let sampsigma = log_sigma.exp();
    info!(
        "MWG: done, sampling acceptance {:.3}, sampsigma {:.4e}",
        stats.sampling_acceptance_rate(),
        sampsigma
    );
    Ok(MwgOutput {
        chain,
        sampsigma,
        stats,
    })
}
