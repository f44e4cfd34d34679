//! Regularization operators and prior families.
//!
//! Every builder is a pure function of its arguments; operators are rebuilt
//! per call rather than cached, since one process may compare several orders
//! or wavelets on the same grid.

use crate::error::{ConfigError, Result, TomoError};
use crate::sparse::SparseOperator;
use crate::wavelet::FilterPair;
use serde::{Deserialize, Serialize};

/// One or two sparse blocks whose rows are penalised together.
#[derive(Debug, Clone, PartialEq)]
pub struct RegularizationOperator {
    grid_size: usize,
    blocks: Vec<SparseOperator>,
    stacked: SparseOperator,
}

impl RegularizationOperator {
    pub fn new(grid_size: usize, blocks: Vec<SparseOperator>) -> Result<Self> {
        let dim = grid_size * grid_size;
        for block in &blocks {
            if block.ncols() != dim {
                return Err(ConfigError::DimensionMismatch {
                    what: "regularization operator columns",
                    expected: dim,
                    actual: block.ncols(),
                }
                .into());
            }
        }
        let stacked = match blocks.len() {
            0 => SparseOperator::zeros(0, dim)?,
            1 => blocks[0].clone(),
            _ => SparseOperator::vstack(&blocks.iter().collect::<Vec<_>>())?,
        };
        Ok(Self {
            grid_size,
            blocks,
            stacked,
        })
    }

    pub fn grid_size(&self) -> usize {
        self.grid_size
    }

    pub fn blocks(&self) -> &[SparseOperator] {
        &self.blocks
    }

    /// Horizontal block (`I ⊗ D`) of a two-block operator.
    pub fn lx(&self) -> Option<&SparseOperator> {
        self.blocks.first()
    }

    /// Vertical block (`D ⊗ I`) of a two-block operator.
    pub fn ly(&self) -> Option<&SparseOperator> {
        self.blocks.get(1)
    }

    /// All blocks stacked into a single `L`.
    pub fn stacked(&self) -> &SparseOperator {
        &self.stacked
    }
}

/// 1D circular difference operator: order 1 is `x[i+1] - x[i]`, order 2 is
/// `2x[i] - x[i-1] - x[i+1]` (indices modulo `n`).
pub fn circular_difference(n: usize, order: usize) -> Result<SparseOperator> {
    if n == 0 {
        return Err(ConfigError::EmptyGrid.into());
    }
    let entries: Vec<(usize, usize, f64)> = match order {
        1 => (0..n)
            .flat_map(|i| [(i, i, -1.0), (i, (i + 1) % n, 1.0)])
            .collect(),
        2 => (0..n)
            .flat_map(|i| {
                [
                    (i, i, 2.0),
                    (i, (i + n - 1) % n, -1.0),
                    (i, (i + 1) % n, -1.0),
                ]
            })
            .collect(),
        other => return Err(ConfigError::UnsupportedOrder(other).into()),
    };
    SparseOperator::from_triplets(n, n, entries)
}

/// Axis operator expanded to the flattened grid: `[I ⊗ D ; D ⊗ I]`.
fn axis_pair(n: usize, order: usize) -> Result<RegularizationOperator> {
    let d = circular_difference(n, order)?;
    let eye = SparseOperator::identity(n)?;
    let lx = SparseOperator::kron(&eye, &d)?;
    let ly = SparseOperator::kron(&d, &eye)?;
    RegularizationOperator::new(n, vec![lx, ly])
}

pub fn tikhonov(n: usize, order: usize) -> Result<RegularizationOperator> {
    axis_pair(n, order)
}

pub fn total_variation(n: usize) -> Result<RegularizationOperator> {
    axis_pair(n, 1)
}

pub fn cauchy(n: usize) -> Result<RegularizationOperator> {
    axis_pair(n, 1)
}

/// `floor(log2 n) - 1`, never below zero.
pub fn default_besov_levels(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    (n.ilog2() as usize).saturating_sub(1)
}

/// Periodic 1D analysis matrix for a signal of even length `s`: the first
/// `s/2` rows are low-pass coefficients, the rest high-pass.
fn analysis_matrix(s: usize, filters: &FilterPair) -> Result<SparseOperator> {
    let half = s / 2;
    let mut entries = Vec::with_capacity(s * filters.low.len());
    for k in 0..half {
        for (m, (&lo, &hi)) in filters.low.iter().zip(&filters.high).enumerate() {
            let col = (2 * k + m) % s;
            entries.push((k, col, lo));
            entries.push((half + k, col, hi));
        }
    }
    SparseOperator::from_triplets(s, s, entries)
}

/// One decomposition stage on the flattened `n`×`n` grid: the top-left
/// `s`×`s` block is transformed separably, every other pixel passes through.
fn decomposition_stage(n: usize, s: usize, filters: &FilterPair) -> Result<SparseOperator> {
    let w = analysis_matrix(s, filters)?;
    let mut entries = Vec::new();
    for i in 0..n {
        for j in 0..n {
            let col = i * n + j;
            if i >= s || j >= s {
                entries.push((col, col, 1.0));
                continue;
            }
            let (rows_i, vals_i) = w.column(i);
            let (rows_j, vals_j) = w.column(j);
            for (&ri, &vi) in rows_i.iter().zip(vals_i) {
                for (&rj, &vj) in rows_j.iter().zip(vals_j) {
                    entries.push((ri * n + rj, col, vi * vj));
                }
            }
        }
    }
    SparseOperator::from_triplets(n * n, n * n, entries)
}

/// Multiresolution wavelet analysis operator over all `n²` coefficients.
/// `levels = None` uses `default_besov_levels`. Decomposition stops early once
/// the remaining block is odd-sized or smaller than two pixels.
pub fn besov(n: usize, filters: &FilterPair, levels: Option<usize>) -> Result<RegularizationOperator> {
    if n == 0 {
        return Err(ConfigError::EmptyGrid.into());
    }
    if filters.low.is_empty() || filters.low.len() != filters.high.len() {
        return Err(TomoError::Sparse(
            "wavelet filters must be non-empty and of equal length".to_string(),
        ));
    }
    let levels = levels.unwrap_or_else(|| default_besov_levels(n));
    let mut total = SparseOperator::identity(n * n)?;
    let mut s = n;
    for _ in 0..levels {
        if s < 2 || s % 2 != 0 {
            break;
        }
        let stage = decomposition_stage(n, s, filters)?;
        total = stage.compose(&total)?;
        s /= 2;
    }
    RegularizationOperator::new(n, vec![total])
}

// ── Prior families ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorFamily {
    Tikhonov,
    TotalVariation,
    Cauchy,
    Besov,
}

impl PriorFamily {
    pub fn name(&self) -> &'static str {
        match self {
            PriorFamily::Tikhonov => "tikhonov",
            PriorFamily::TotalVariation => "tv",
            PriorFamily::Cauchy => "cauchy",
            PriorFamily::Besov => "besov",
        }
    }
}

/// A prior family with its regularization operator and hyperparameters.
///
/// The log prior is `-Σᵢ φ((Lx)ᵢ)` over all rows of the stacked operator,
/// with the per-row penalty `φ` given by `row_penalty`.
#[derive(Debug, Clone, PartialEq)]
pub enum Prior {
    /// `φ(u) = α u²`.
    Tikhonov {
        operator: RegularizationOperator,
        alpha: f64,
    },
    /// `φ(u) = α √(u² + β)`.
    TotalVariation {
        operator: RegularizationOperator,
        alpha: f64,
        beta: f64,
    },
    /// `φ(u) = ln(α + u²)`.
    Cauchy {
        operator: RegularizationOperator,
        alpha: f64,
    },
    /// `φ(u) = α √(u² + β)` on wavelet coefficients.
    Besov {
        operator: RegularizationOperator,
        alpha: f64,
        beta: f64,
    },
}

impl Prior {
    pub fn tikhonov(n: usize, order: usize, alpha: f64) -> Result<Self> {
        check_non_negative("alpha", alpha)?;
        Ok(Prior::Tikhonov {
            operator: tikhonov(n, order)?,
            alpha,
        })
    }

    pub fn total_variation(n: usize, alpha: f64, beta: f64) -> Result<Self> {
        check_non_negative("alpha", alpha)?;
        check_non_negative("beta", beta)?;
        Ok(Prior::TotalVariation {
            operator: total_variation(n)?,
            alpha,
            beta,
        })
    }

    /// The log density is unbounded below as `alpha → 0`, so `alpha` must be
    /// strictly positive.
    pub fn cauchy(n: usize, alpha: f64) -> Result<Self> {
        if !(alpha > 0.0 && alpha.is_finite()) {
            return Err(ConfigError::InvalidHyperparameter {
                name: "alpha",
                value: alpha,
                reason: "Cauchy prior requires alpha > 0",
            }
            .into());
        }
        Ok(Prior::Cauchy {
            operator: cauchy(n)?,
            alpha,
        })
    }

    pub fn besov(
        n: usize,
        filters: &FilterPair,
        levels: Option<usize>,
        alpha: f64,
        beta: f64,
    ) -> Result<Self> {
        check_non_negative("alpha", alpha)?;
        check_non_negative("beta", beta)?;
        Ok(Prior::Besov {
            operator: besov(n, filters, levels)?,
            alpha,
            beta,
        })
    }

    pub fn family(&self) -> PriorFamily {
        match self {
            Prior::Tikhonov { .. } => PriorFamily::Tikhonov,
            Prior::TotalVariation { .. } => PriorFamily::TotalVariation,
            Prior::Cauchy { .. } => PriorFamily::Cauchy,
            Prior::Besov { .. } => PriorFamily::Besov,
        }
    }

    pub fn operator(&self) -> &RegularizationOperator {
        match self {
            Prior::Tikhonov { operator, .. }
            | Prior::TotalVariation { operator, .. }
            | Prior::Cauchy { operator, .. }
            | Prior::Besov { operator, .. } => operator,
        }
    }

    pub fn alpha(&self) -> f64 {
        match *self {
            Prior::Tikhonov { alpha, .. }
            | Prior::TotalVariation { alpha, .. }
            | Prior::Cauchy { alpha, .. }
            | Prior::Besov { alpha, .. } => alpha,
        }
    }

    /// Smoothing constant; zero for families without one.
    pub fn beta(&self) -> f64 {
        match *self {
            Prior::TotalVariation { beta, .. } | Prior::Besov { beta, .. } => beta,
            Prior::Tikhonov { .. } | Prior::Cauchy { .. } => 0.0,
        }
    }

    /// Whether the log density is differentiable everywhere.
    pub fn is_smooth(&self) -> bool {
        match self {
            Prior::TotalVariation { beta, .. } | Prior::Besov { beta, .. } => *beta > 0.0,
            Prior::Tikhonov { .. } | Prior::Cauchy { .. } => true,
        }
    }

    #[inline]
    pub fn row_penalty(&self, u: f64) -> f64 {
        match *self {
            Prior::Tikhonov { alpha, .. } => alpha * u * u,
            Prior::TotalVariation { alpha, beta, .. } | Prior::Besov { alpha, beta, .. } => {
                alpha * (u * u + beta).sqrt()
            }
            Prior::Cauchy { alpha, .. } => (alpha + u * u).ln(),
        }
    }

    /// `φ'(u)`. At `u = 0` with `β = 0` the pseudo-Huber term takes the zero subgradient.
    #[inline]
    pub fn row_penalty_derivative(&self, u: f64) -> f64 {
        match *self {
            Prior::Tikhonov { alpha, .. } => 2.0 * alpha * u,
            Prior::TotalVariation { alpha, beta, .. } | Prior::Besov { alpha, beta, .. } => {
                let denom = (u * u + beta).sqrt();
                if denom > 0.0 {
                    alpha * u / denom
                } else {
                    0.0
                }
            }
            Prior::Cauchy { alpha, .. } => 2.0 * u / (alpha + u * u),
        }
    }
}

fn check_non_negative(name: &'static str, value: f64) -> Result<()> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::InvalidHyperparameter {
            name,
            value,
            reason: "must be finite and non-negative",
        }
        .into())
    }
}
