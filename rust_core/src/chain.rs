use serde::{Deserialize, Serialize};

/// Sampling-phase output of one MCMC run.
///
/// Every pushed draw updates the running mean and variance (Welford). Only
/// every `thinning`-th draw is retained, and only when the caller asked for
/// the full chain; otherwise memory stays at two vectors of length `dim`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    dim: usize,
    thinning: usize,
    keep_draws: bool,
    draws: Vec<Vec<f64>>,
    mean: Vec<f64>,
    m2: Vec<f64>,
    count: usize,
}

impl Chain {
    pub fn new(dim: usize, thinning: usize, keep_draws: bool) -> Self {
        Self {
            dim,
            thinning: thinning.max(1),
            keep_draws,
            draws: Vec::new(),
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
            count: 0,
        }
    }

    pub fn push(&mut self, x: &[f64]) {
        debug_assert_eq!(x.len(), self.dim);
        self.count += 1;
        let n = self.count as f64;
        for ((m, s), &xi) in self.mean.iter_mut().zip(self.m2.iter_mut()).zip(x) {
            let delta = xi - *m;
            *m += delta / n;
            *s += delta * (xi - *m);
        }
        if self.keep_draws && self.count % self.thinning == 0 {
            self.draws.push(x.to_vec());
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn thinning(&self) -> usize {
        self.thinning
    }

    /// Number of draws folded into the running statistics.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Retained (thinned) draws; empty in mean-only mode.
    pub fn draws(&self) -> &[Vec<f64>] {
        &self.draws
    }

    pub fn keeps_draws(&self) -> bool {
        self.keep_draws
    }

    /// Posterior mean over all sampling-phase draws.
    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    /// Per-coordinate sample variance; zeros until two draws are seen.
    pub fn variance(&self) -> Vec<f64> {
        if self.count < 2 {
            return vec![0.0; self.dim];
        }
        let denom = (self.count - 1) as f64;
        self.m2.iter().map(|s| s / denom).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_mean_and_variance() {
        let mut chain = Chain::new(2, 1, false);
        for x in [[1.0, 10.0], [2.0, 20.0], [3.0, 30.0], [6.0, 0.0]] {
            chain.push(&x);
        }
        assert_eq!(chain.count(), 4);
        assert!((chain.mean()[0] - 3.0).abs() < 1e-12);
        assert!((chain.mean()[1] - 15.0).abs() < 1e-12);
        let var = chain.variance();
        assert!((var[0] - 14.0 / 3.0).abs() < 1e-12);
        assert!(chain.draws().is_empty());
    }

    #[test]
    fn test_thinning_keeps_every_kth_draw() {
        let mut chain = Chain::new(1, 3, true);
        for i in 1..=10 {
            chain.push(&[i as f64]);
        }
        let kept: Vec<f64> = chain.draws().iter().map(|d| d[0]).collect();
        assert_eq!(kept, vec![3.0, 6.0, 9.0]);
        // The mean still covers every draw.
        assert!((chain.mean()[0] - 5.5).abs() < 1e-12);
    }
}
