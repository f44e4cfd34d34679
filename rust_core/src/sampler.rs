use crate::chain::Chain;
use crate::diagnostics::{RunDiagnostics, SamplerStats};
use crate::error::Result;
use crate::hmc::{self, HmcConfig, HmcVariant};
use crate::map::{self, MapConfig, MapEstimate};
use crate::mwg::{self, MwgConfig};
use crate::posterior::{LogDensity, PosteriorContext};
use crate::progress::ProgressObserver;
use log::info;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Which estimator a reconstruction runs, with its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "config", rename_all = "snake_case")]
pub enum Estimator {
    Map(MapConfig),
    Hmc(HmcConfig),
    Ehmc(HmcConfig),
    Mwg(MwgConfig),
}

impl Estimator {
    pub fn name(&self) -> &'static str {
        match self {
            Estimator::Map(_) => "MAP",
            Estimator::Hmc(_) => "HMC",
            Estimator::Ehmc(_) => "eHMC",
            Estimator::Mwg(_) => "MWG",
        }
    }

    /// Starting point used when the caller supplies none: `1 + s·N(0, 1)` for
    /// MAP, a constant `0.2` image for the samplers.
    pub fn default_start(&self, dim: usize, rng: &mut ChaCha8Rng) -> Vec<f64> {
        match self {
            Estimator::Map(config) => map::default_start(dim, config.init_perturbation, rng),
            _ => hmc::default_start(dim),
        }
    }
}

/// Result of one reconstruction run.
#[derive(Debug, Clone)]
pub struct Estimate {
    pub method: &'static str,
    /// MAP point or posterior mean, flattened row-major.
    pub x: Vec<f64>,
    pub elapsed: Duration,
    pub diagnostics: RunDiagnostics,
    /// Retained sampling-phase draws, when the sampler was asked to keep them.
    pub chain: Option<Chain>,
    pub map: Option<MapEstimate>,
    /// U-turn lengths learned by eHMC.
    pub trajectory_lengths: Vec<usize>,
}

/// Run exactly one estimator against `ctx`.
///
/// `init` overrides the estimator's default starting point. The context is
/// only borrowed; swapping the prior between calls is the caller's job.
pub fn reconstruct(
    ctx: &PosteriorContext,
    estimator: &Estimator,
    init: Option<&[f64]>,
    rng: &mut ChaCha8Rng,
    observer: &dyn ProgressObserver,
) -> Result<Estimate> {
    let dim = ctx.dim();
    let start = match init {
        Some(x) => x.to_vec(),
        None => estimator.default_start(dim, rng),
    };
    let prior_name = ctx.prior().map_or("flat", |p| p.family().name());
    info!(
        "{} reconstruction: {}x{} grid, {} prior, {} measurements",
        estimator.name(),
        ctx.grid_size(),
        ctx.grid_size(),
        prior_name,
        ctx.data().len()
    );

    let timer = Instant::now();
    let (x, stats, chain, map_estimate, trajectory_lengths) = match estimator {
        Estimator::Map(config) => {
            let est = map::estimate(ctx, &start, config)?;
            (est.x.clone(), SamplerStats::default(), None, Some(est), Vec::new())
        }
        Estimator::Hmc(config) | Estimator::Ehmc(config) => {
            ctx.check_differentiable()?;
            let variant = match estimator {
                Estimator::Ehmc(_) => HmcVariant::Empirical,
                _ => HmcVariant::Standard,
            };
            let out = hmc::sample(ctx, &start, config, variant, rng, observer)?;
            let x = out.chain.mean().to_vec();
            (x, out.stats, Some(out.chain), None, out.trajectory_lengths)
        }
        Estimator::Mwg(config) => {
            let out = mwg::sample(ctx, &start, config, rng, observer)?;
            let x = out.chain.mean().to_vec();
            (x, out.stats, Some(out.chain), None, Vec::new())
        }
    };
    let elapsed = timer.elapsed();

    let diagnostics = RunDiagnostics::from_run(estimator.name(), &stats, chain.as_ref());
    info!(
        "{} reconstruction finished in {:.2}s",
        estimator.name(),
        elapsed.as_secs_f64()
    );

    Ok(Estimate {
        method: estimator.name(),
        x,
        elapsed,
        diagnostics,
        chain: chain.filter(|c| c.keeps_draws()),
        map: map_estimate,
        trajectory_lengths,
    })
}
