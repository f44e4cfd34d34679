//! Maximum-a-posteriori estimation by limited-memory BFGS.
//!
//! The objective is `-logπ(x)`. Steps are accepted with an Armijo backtracking
//! line search; an optional elementwise lower bound is enforced by projecting
//! each trial point and freezing the coordinates pinned at the bound.

use crate::error::{ConfigError, Result};
use crate::posterior::LogDensity;
use crate::prior::PriorFamily;
use log::{debug, info, warn};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const ARMIJO_C1: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 40;

/// Settings for the L-BFGS minimiser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    pub max_iterations: usize,
    /// Number of curvature pairs kept.
    pub history: usize,
    /// Stop once the largest projected gradient component falls below this.
    pub gradient_tolerance: f64,
    /// Stop once the relative objective decrease falls below this.
    pub objective_tolerance: f64,
    pub lower_bound: Option<f64>,
    /// Standard deviation of the perturbation around 1 used by [`default_start`].
    pub init_perturbation: f64,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            history: 10,
            gradient_tolerance: 1e-5,
            objective_tolerance: 2.220446049250313e-9,
            lower_bound: None,
            init_perturbation: 0.05,
        }
    }
}

impl MapConfig {
    /// Iteration budgets tuned per prior family.
    pub fn for_prior(family: PriorFamily) -> Self {
        let max_iterations = match family {
            PriorFamily::Tikhonov => 20,
            PriorFamily::TotalVariation | PriorFamily::Besov => 230,
            PriorFamily::Cauchy => 150,
        };
        Self {
            max_iterations,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    GradientTolerance,
    ObjectiveTolerance,
    MaxIterations,
    LineSearchFailed,
    /// The starting point already has a non-finite objective.
    NonFiniteStart,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEstimate {
    pub x: Vec<f64>,
    pub iterations: usize,
    /// Final value of `-logπ`.
    pub objective: f64,
    pub gradient_norm: f64,
    pub termination: TerminationReason,
}

impl MapEstimate {
    pub fn converged(&self) -> bool {
        matches!(
            self.termination,
            TerminationReason::GradientTolerance | TerminationReason::ObjectiveTolerance
        )
    }
}

/// `1 + s·N(0, 1)` per element.
pub fn default_start(dim: usize, perturbation: f64, rng: &mut ChaCha8Rng) -> Vec<f64> {
    (0..dim)
        .map(|_| {
            let z: f64 = StandardNormal.sample(rng);
            1.0 + perturbation * z
        })
        .collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn negated<T: LogDensity + ?Sized>(target: &T, x: &[f64]) -> (f64, Vec<f64>) {
    let (logp, mut grad) = target.log_density_and_gradient(x);
    grad.iter_mut().for_each(|g| *g = -*g);
    (-logp, grad)
}

/// Gradient with the components that would push through the bound zeroed.
fn projected_gradient(x: &[f64], g: &[f64], lower: Option<f64>) -> Vec<f64> {
    match lower {
        None => g.to_vec(),
        Some(lb) => x
            .iter()
            .zip(g)
            .map(|(&xi, &gi)| if xi <= lb && gi > 0.0 { 0.0 } else { gi })
            .collect(),
    }
}

struct CurvaturePair {
    s: Vec<f64>,
    y: Vec<f64>,
    rho: f64,
}

/// Two-loop recursion: returns `-H·g`.
fn lbfgs_direction(g: &[f64], history: &VecDeque<CurvaturePair>) -> Vec<f64> {
    let mut q = g.to_vec();
    let mut alphas = Vec::with_capacity(history.len());
    for pair in history.iter().rev() {
        let a = pair.rho * dot(&pair.s, &q);
        for (qi, yi) in q.iter_mut().zip(&pair.y) {
            *qi -= a * yi;
        }
        alphas.push(a);
    }
    if let Some(last) = history.back() {
        let scale = dot(&last.s, &last.y) / dot(&last.y, &last.y);
        q.iter_mut().for_each(|qi| *qi *= scale);
    }
    for (pair, a) in history.iter().zip(alphas.into_iter().rev()) {
        let b = pair.rho * dot(&pair.y, &q);
        for (qi, si) in q.iter_mut().zip(&pair.s) {
            *qi += (a - b) * si;
        }
    }
    q.iter_mut().for_each(|qi| *qi = -*qi);
    q
}

/// Minimise `-logπ` from `initial`.
///
/// Failing to converge is reported through [`MapEstimate::termination`], never
/// as an error; the best point reached is returned.
pub fn estimate<T: LogDensity + ?Sized>(
    target: &T,
    initial: &[f64],
    config: &MapConfig,
) -> Result<MapEstimate> {
    let dim = target.dim();
    if initial.len() != dim {
        return Err(ConfigError::DimensionMismatch {
            what: "initial point",
            expected: dim,
            actual: initial.len(),
        }
        .into());
    }
    let lower = config.lower_bound;
    let project = |v: &mut [f64]| {
        if let Some(lb) = lower {
            v.iter_mut().for_each(|vi| *vi = vi.max(lb));
        }
    };

    let mut x = initial.to_vec();
    project(&mut x);
    let (mut f, mut g) = negated(target, &x);
    info!("MAP: dim={dim}, history={}, max_iterations={}", config.history, config.max_iterations);

    if !f.is_finite() {
        warn!("MAP: objective is not finite at the starting point");
        return Ok(MapEstimate {
            gradient_norm: f64::NAN,
            x,
            iterations: 0,
            objective: f,
            termination: TerminationReason::NonFiniteStart,
        });
    }

    let mut history: VecDeque<CurvaturePair> = VecDeque::with_capacity(config.history);
    let mut iterations = 0;
    let mut termination = TerminationReason::MaxIterations;

    loop {
        let pg = projected_gradient(&x, &g, lower);
        let gnorm = pg.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        if gnorm <= config.gradient_tolerance {
            termination = TerminationReason::GradientTolerance;
            break;
        }
        if iterations >= config.max_iterations {
            break;
        }

        let mut d = lbfgs_direction(&pg, &history);
        if lower.is_some() {
            for (di, gi) in d.iter_mut().zip(&pg) {
                if *gi == 0.0 {
                    *di = 0.0;
                }
            }
        }
        if dot(&d, &pg) >= 0.0 {
            debug!("MAP: iteration {iterations}: not a descent direction, resetting history");
            history.clear();
            d = pg.iter().map(|v| -v).collect();
        }

        let dnorm = dot(&d, &d).sqrt();
        let mut t = if history.is_empty() {
            (1.0 / dnorm).min(1.0)
        } else {
            1.0
        };

        let mut accepted = None;
        for _ in 0..MAX_BACKTRACKS {
            let mut trial: Vec<f64> = x.iter().zip(&d).map(|(xi, di)| xi + t * di).collect();
            project(&mut trial);
            let step: Vec<f64> = trial.iter().zip(&x).map(|(a, b)| a - b).collect();
            let (f_trial, g_trial) = negated(target, &trial);
            if f_trial.is_finite() && f_trial <= f + ARMIJO_C1 * dot(&g, &step) {
                accepted = Some((trial, step, f_trial, g_trial));
                break;
            }
            t *= 0.5;
        }

        let Some((x_new, s, f_new, g_new)) = accepted else {
            termination = TerminationReason::LineSearchFailed;
            break;
        };
        iterations += 1;

        let y: Vec<f64> = g_new.iter().zip(&g).map(|(a, b)| a - b).collect();
        let sy = dot(&s, &y);
        if sy > f64::EPSILON * dot(&y, &y) {
            if history.len() == config.history.max(1) {
                history.pop_front();
            }
            history.push_back(CurvaturePair { s, y, rho: 1.0 / sy });
        }

        let decrease = f - f_new;
        let scale = f.abs().max(f_new.abs()).max(1.0);
        x = x_new;
        f = f_new;
        g = g_new;
        if decrease <= config.objective_tolerance * scale {
            termination = TerminationReason::ObjectiveTolerance;
            break;
        }
    }

    let gradient_norm = projected_gradient(&x, &g, lower)
        .iter()
        .fold(0.0f64, |m, v| m.max(v.abs()));
    let result = MapEstimate {
        x,
        iterations,
        objective: f,
        gradient_norm,
        termination,
    };
    if result.converged() {
        info!(
            "MAP: {:?} after {} iterations, objective {:.6e}",
            result.termination, result.iterations, result.objective
        );
    } else {
        warn!(
            "MAP: stopped without converging ({:?}) after {} iterations, |g|={:.3e}",
            result.termination, result.iterations, result.gradient_norm
        );
    }
    Ok(result)
}
