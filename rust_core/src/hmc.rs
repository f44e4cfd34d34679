//! Hamiltonian Monte Carlo with dual-averaging step-size adaptation.
//!
//! Two flavours share one loop:
//!   - standard HMC with a fixed or jittered trajectory length
//!   - empirical HMC (eHMC), which records how many leapfrog steps the
//!     trajectory takes to U-turn during the second half of warm-up and draws
//!     sampling-phase lengths from those records

use crate::chain::Chain;
use crate::diagnostics::SamplerStats;
use crate::error::{ConfigError, Result};
use crate::posterior::LogDensity;
use crate::progress::ProgressObserver;
use log::{debug, info, warn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

const MAX_DELTA_H: f64 = 1000.0;

/// Every coordinate of the default starting point.
pub const DEFAULT_START: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryLength {
    Fixed(usize),
    /// Drawn uniformly from `1..=2L` every iteration.
    Jittered(usize),
}

impl TrajectoryLength {
    fn nominal(&self) -> usize {
        match *self {
            TrajectoryLength::Fixed(l) | TrajectoryLength::Jittered(l) => l,
        }
    }

    fn draw(&self, rng: &mut ChaCha8Rng) -> usize {
        match *self {
            TrajectoryLength::Fixed(l) => l,
            TrajectoryLength::Jittered(l) => rng.gen_range(1..=2 * l),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HmcVariant {
    Standard,
    Empirical,
}

/// Configuration for the HMC sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HmcConfig {
    pub num_samples: usize,
    pub num_warmup: usize,
    /// `None` runs the doubling/halving heuristic from the starting point.
    pub step_size: Option<f64>,
    pub trajectory: TrajectoryLength,
    pub target_accept: f64,
    pub gamma: f64,
    pub t0: f64,
    pub kappa: f64,
    pub thinning: usize,
    pub keep_chain: bool,
    /// Cap on the U-turn lengths recorded by the empirical variant.
    pub max_trajectory_steps: usize,
}

impl Default for HmcConfig {
    fn default() -> Self {
        Self {
            num_samples: 100,
            num_warmup: 20,
            step_size: None,
            trajectory: TrajectoryLength::Jittered(20),
            target_accept: 0.65,
            gamma: 0.05,
            t0: 10.0,
            kappa: 0.75,
            thinning: 1,
            keep_chain: false,
            max_trajectory_steps: 100,
        }
    }
}

impl HmcConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let bad = |name, value: f64, reason| {
            Err(ConfigError::InvalidHyperparameter { name, value, reason })
        };
        if self.num_samples == 0 {
            return bad("num_samples", 0.0, "needs at least one sampling-phase draw");
        }
        if self.thinning == 0 {
            return bad("thinning", 0.0, "must be at least 1");
        }
        if !(self.target_accept > 0.0 && self.target_accept < 1.0) {
            return bad("target_accept", self.target_accept, "must lie in (0, 1)");
        }
        if let Some(eps) = self.step_size {
            if !(eps > 0.0 && eps.is_finite()) {
                return bad("step_size", eps, "must be finite and positive");
            }
        }
        if self.trajectory.nominal() == 0 {
            return bad("trajectory", 0.0, "needs at least one leapfrog step");
        }
        if self.max_trajectory_steps == 0 {
            return bad("max_trajectory_steps", 0.0, "must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HmcOutput {
    pub chain: Chain,
    /// Step size used during the sampling phase.
    pub step_size: f64,
    /// U-turn lengths learned by the empirical variant; empty otherwise.
    pub trajectory_lengths: Vec<usize>,
    pub stats: SamplerStats,
}

/// A point on the Hamiltonian trajectory: (position, momentum, gradient, log-probability).
#[derive(Clone)]
struct PhasePoint {
    q: Vec<f64>,
    p: Vec<f64>,
    grad: Vec<f64>,
    logp: f64,
}

impl PhasePoint {
    fn energy(&self) -> f64 {
        let ke: f64 = self.p.iter().map(|&pi| 0.5 * pi * pi).sum();
        -self.logp + ke
    }
}

/// Unit-mass leapfrog step.
fn leapfrog<T: LogDensity + ?Sized>(target: &T, point: &PhasePoint, eps: f64) -> PhasePoint {
    let p_half: Vec<f64> = point
        .p
        .iter()
        .zip(&point.grad)
        .map(|(p, g)| p + 0.5 * eps * g)
        .collect();
    let q: Vec<f64> = point.q.iter().zip(&p_half).map(|(q, p)| q + eps * p).collect();
    let (logp, grad) = target.log_density_and_gradient(&q);
    let p = p_half.iter().zip(&grad).map(|(p, g)| p + 0.5 * eps * g).collect();
    PhasePoint { q, p, grad, logp }
}

/// Either end of the trajectory moving back toward the other.
fn check_uturn(left: &PhasePoint, right: &PhasePoint) -> bool {
    let mut dot_left = 0.0f64;
    let mut dot_right = 0.0f64;
    for i in 0..left.q.len() {
        let dq = right.q[i] - left.q[i];
        dot_left += dq * left.p[i];
        dot_right += dq * right.p[i];
    }
    dot_left < 0.0 || dot_right < 0.0
}

fn sample_momentum(dim: usize, rng: &mut ChaCha8Rng) -> Vec<f64> {
    (0..dim).map(|_| StandardNormal.sample(rng)).collect()
}

/// Double or halve ε from 1 until a single leapfrog step crosses an
/// acceptance ratio of one half.
fn find_initial_step_size<T: LogDensity + ?Sized>(
    target: &T,
    start: &PhasePoint,
    rng: &mut ChaCha8Rng,
    stats: &mut SamplerStats,
) -> f64 {
    let initial_point = PhasePoint {
        p: sample_momentum(start.q.len(), rng),
        ..start.clone()
    };
    let h0 = initial_point.energy();
    let threshold = (0.5_f64).ln();

    let mut eps = 1.0;
    let test = leapfrog(target, &initial_point, eps);
    stats.gradient_evaluations += 1;
    let direction = if h0 - test.energy() > threshold { 1.0 } else { -1.0 };

    for _ in 0..50 {
        let t = leapfrog(target, &initial_point, eps);
        stats.gradient_evaluations += 1;
        let lr = h0 - t.energy();
        if !lr.is_finite() {
            eps *= 0.5;
            continue;
        }
        if direction > 0.0 && lr < threshold {
            break;
        }
        if direction < 0.0 && lr > threshold {
            break;
        }
        eps *= 2.0_f64.powf(direction);
    }

    eps.clamp(1e-10, 1e3)
}

/// Outcome of one simulated trajectory.
struct Trajectory {
    /// `None` when the integrator diverged before reaching the proposal.
    proposal: Option<PhasePoint>,
    /// Steps until the first U-turn, when requested and reached cleanly.
    uturn: Option<usize>,
    gradient_evaluations: usize,
}

/// Run `steps` leapfrog steps from `start`. With `uturn_cap`, keep integrating
/// past the proposal until the trajectory turns back on itself or the cap is
/// hit.
fn simulate<T: LogDensity + ?Sized>(
    target: &T,
    start: &PhasePoint,
    eps: f64,
    steps: usize,
    uturn_cap: Option<usize>,
) -> Trajectory {
    let h0 = start.energy();
    let horizon = uturn_cap.map_or(steps, |cap| cap.max(steps));
    let mut point = start.clone();
    let mut proposal = None;
    let mut uturn = None;
    let mut evals = 0;

    for step in 1..=horizon {
        point = leapfrog(target, &point, eps);
        evals += 1;
        let delta_h = point.energy() - h0;
        if !delta_h.is_finite() || delta_h > MAX_DELTA_H {
            break;
        }
        if step == steps {
            proposal = Some(point.clone());
        }
        if let Some(cap) = uturn_cap {
            if uturn.is_none() && (step >= cap || check_uturn(start, &point)) {
                uturn = Some(step.min(cap));
            }
        }
        if step >= steps && (uturn_cap.is_none() || uturn.is_some()) {
            break;
        }
    }

    Trajectory {
        proposal,
        uturn,
        gradient_evaluations: evals,
    }
}

/// Run a single HMC chain from `initial`.
///
/// The target is taken by shared reference; all randomness comes from `rng`.
pub fn sample<T: LogDensity + ?Sized>(
    target: &T,
    initial: &[f64],
    config: &HmcConfig,
    variant: HmcVariant,
    rng: &mut ChaCha8Rng,
    observer: &dyn ProgressObserver,
) -> Result<HmcOutput> {
    config.validate()?;
    let dim = target.dim();
    if initial.len() != dim {
        return Err(ConfigError::DimensionMismatch {
            what: "initial point",
            expected: dim,
            actual: initial.len(),
        }
        .into());
    }

    let mut stats = SamplerStats::default();
    let (logp0, grad0) = target.log_density_and_gradient(initial);
    stats.gradient_evaluations += 1;
    if !logp0.is_finite() {
        return Err(ConfigError::NonFiniteStart.into());
    }
    let mut current = PhasePoint {
        q: initial.to_vec(),
        p: vec![0.0; dim],
        grad: grad0,
        logp: logp0,
    };

    let mut step_size = match config.step_size {
        Some(eps) => eps,
        None => find_initial_step_size(target, &current, rng, &mut stats),
    };
    info!(
        "HMC ({:?}): dim={dim}, warmup={}, samples={}, initial step size {:.4e}",
        variant, config.num_warmup, config.num_samples, step_size
    );

    // Dual-averaging state
    let mu = (10.0 * step_size).ln();
    let mut log_eps_bar = 0.0f64;
    let mut h_bar = 0.0f64;

    let learn_from = config.num_warmup / 2;
    let mut learned: Vec<usize> = Vec::new();
    let mut chain = Chain::new(dim, config.thinning, config.keep_chain);
    let total_iters = config.num_warmup + config.num_samples;

    for iter in 0..total_iters {
        let is_warmup = iter < config.num_warmup;
        let learning = variant == HmcVariant::Empirical && is_warmup && iter >= learn_from;

        let steps = if variant == HmcVariant::Empirical && !is_warmup && !learned.is_empty() {
            learned[rng.gen_range(0..learned.len())]
        } else {
            config.trajectory.draw(rng)
        };

        current.p = sample_momentum(dim, rng);
        let h_current = current.energy();
        let trajectory = simulate(
            target,
            &current,
            step_size,
            steps,
            learning.then_some(config.max_trajectory_steps),
        );
        stats.gradient_evaluations += trajectory.gradient_evaluations;
        if let Some(len) = trajectory.uturn {
            learned.push(len);
        }

        let (accept_prob, accepted) = match trajectory.proposal {
            Some(proposal) => {
                let log_accept_ratio = h_current - proposal.energy();
                let accept_prob = log_accept_ratio.min(0.0).exp();
                let accepted = rng.gen::<f64>().ln() < log_accept_ratio;
                if accepted {
                    current = proposal;
                }
                (accept_prob, accepted)
            }
            None => {
                stats.divergences += 1;
                observer.on_divergence();
                debug!("HMC: divergent trajectory at iteration {iter}, step size {step_size:.4e}");
                (0.0, false)
            }
        };
        stats.record(is_warmup, accept_prob, accepted);

        // Dual averaging adaptation during warmup
        if is_warmup {
            let m = (iter + 1) as f64;
            let w = 1.0 / (m + config.t0);
            h_bar = (1.0 - w) * h_bar + w * (config.target_accept - accept_prob);
            let log_eps = mu - (m.sqrt() / config.gamma) * h_bar;
            step_size = log_eps.exp();
            let m_pow = m.powf(-config.kappa);
            log_eps_bar = m_pow * log_eps + (1.0 - m_pow) * log_eps_bar;
        }

        // After warmup, fix step size
        if config.num_warmup > 0 && iter + 1 == config.num_warmup {
            step_size = log_eps_bar.exp();
            debug!(
                "HMC: warm-up done, step size frozen at {step_size:.4e}, {} trajectory lengths learned",
                learned.len()
            );
        }

        if !is_warmup {
            chain.push(&current.q);
        }
        observer.on_iteration(iter, total_iters);
    }

    if variant == HmcVariant::Empirical && learned.is_empty() {
        warn!("eHMC: no trajectory lengths were learned, sampled with the configured length");
    }
    if stats.divergences > 0 {
        warn!("HMC: {} divergent transitions", stats.divergences);
    }
    stats.final_step_size = Some(step_size);
    info!(
        "HMC: done, sampling acceptance {:.3}, step size {:.4e}, {} gradient evaluations",
        stats.sampling_acceptance_rate(),
        step_size,
        stats.gradient_evaluations
    );

    Ok(HmcOutput {
        chain,
        step_size,
        trajectory_lengths: learned,
        stats,
    })
}

/// `0.2` in every coordinate.
pub fn default_start(dim: usize) -> Vec<f64> {
    vec![DEFAULT_START; dim]
}
