/// Sampler run diagnostics: acceptance bookkeeping and effective sample size.
///
/// ESS follows the split-chain, rank-normalised bulk estimator of
///   Vehtari et al. (2021) "Rank-normalization, folding, and localization:
///   An improved R-hat for assessing convergence of MCMC"
/// applied to the single chain each run produces.
use crate::chain::Chain;
use serde::{Deserialize, Serialize};

/// Counters a sampler updates as it runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplerStats {
    pub warmup_proposals: usize,
    pub warmup_accepted: usize,
    pub sampling_proposals: usize,
    pub sampling_accepted: usize,
    /// Sum of Metropolis acceptance probabilities over the sampling phase.
    pub accept_prob_sum: f64,
    pub divergences: usize,
    pub gradient_evaluations: usize,
    pub final_step_size: Option<f64>,
}

impl SamplerStats {
    pub fn record(&mut self, warmup: bool, accept_prob: f64, accepted: bool) {
        if warmup {
            self.warmup_proposals += 1;
            self.warmup_accepted += accepted as usize;
        } else {
            self.sampling_proposals += 1;
            self.sampling_accepted += accepted as usize;
            self.accept_prob_sum += accept_prob;
        }
    }

    pub fn warmup_acceptance_rate(&self) -> f64 {
        ratio(self.warmup_accepted, self.warmup_proposals)
    }

    pub fn sampling_acceptance_rate(&self) -> f64 {
        ratio(self.sampling_accepted, self.sampling_proposals)
    }

    pub fn mean_accept_prob(&self) -> f64 {
        if self.sampling_proposals == 0 {
            f64::NAN
        } else {
            self.accept_prob_sum / self.sampling_proposals as f64
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        f64::NAN
    } else {
        num as f64 / den as f64
    }
}

/// Summary attached to every reconstruction record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    pub method: String,
    pub stats: SamplerStats,
    pub draws: usize,
    pub ess_min: Option<f64>,
    pub ess_median: Option<f64>,
}

impl RunDiagnostics {
    /// ESS is only available when the chain kept at least four draws.
    pub fn from_run(method: impl Into<String>, stats: &SamplerStats, chain: Option<&Chain>) -> Self {
        let draws = chain.map_or(0, |c| c.count());
        let (ess_min, ess_median) = match chain {
            Some(c) if c.draws().len() >= 4 => {
                let mut ess: Vec<f64> = (0..c.dim())
                    .map(|j| {
                        let trace: Vec<f64> = c.draws().iter().map(|d| d[j]).collect();
                        ess_bulk(&trace)
                    })
                    .filter(|v| v.is_finite())
                    .collect();
                if ess.is_empty() {
                    (None, None)
                } else {
                    ess.sort_unstable_by(f64::total_cmp);
                    (Some(ess[0]), Some(ess[ess.len() / 2]))
                }
            }
            _ => (None, None),
        };
        Self {
            method: method.into(),
            stats: stats.clone(),
            draws,
            ess_min,
            ess_median,
        }
    }

    /// Render the diagnostics as a formatted table string.
    pub fn to_table(&self) -> String {
        let s = &self.stats;
        let fmt_opt = |v: Option<f64>, prec: usize| match v {
            Some(x) if x.is_finite() => format!("{:.*}", prec, x),
            _ => "-".to_string(),
        };
        let fmt_rate = |v: f64| {
            if v.is_finite() {
                format!("{:.3}", v)
            } else {
                "-".to_string()
            }
        };

        let mut lines = Vec::new();
        lines.push(format!("{} │ {} sampling draws", self.method, self.draws));
        lines.push("─".repeat(44));
        lines.push(format!("{:<28} {:>15}", "warm-up acceptance", fmt_rate(s.warmup_acceptance_rate())));
        lines.push(format!(
            "{:<28} {:>15}",
            "sampling acceptance",
            fmt_rate(s.sampling_acceptance_rate())
        ));
        lines.push(format!("{:<28} {:>15}", "mean accept prob", fmt_rate(s.mean_accept_prob())));
        lines.push(format!("{:<28} {:>15}", "divergences", s.divergences));
        lines.push(format!("{:<28} {:>15}", "final step size", fmt_opt(s.final_step_size, 5)));
        lines.push(format!("{:<28} {:>15}", "gradient evaluations", s.gradient_evaluations));
        lines.push(format!("{:<28} {:>15}", "ess_bulk (min)", fmt_opt(self.ess_min, 0)));
        lines.push(format!("{:<28} {:>15}", "ess_bulk (median)", fmt_opt(self.ess_median, 0)));
        lines.push("─".repeat(44));

        if s.divergences > 0 {
            lines.push(format!(
                "⚠  {} divergent transitions; results may be unreliable.",
                s.divergences
            ));
        }
        if self.ess_min.is_some_and(|e| e < 100.0) {
            lines.push("⚠  Some ESS values < 100; consider more draws or tuning.".to_string());
        }
        lines.join("\n")
    }
}

/// Bulk ESS of one trace, rank-normalised and split in two halves.
pub fn ess_bulk(trace: &[f64]) -> f64 {
    if trace.len() < 4 {
        return f64::NAN;
    }
    ess_split(&rank_normalize(trace))
}

/// Replace values with their normal scores `Φ⁻¹((rank - 3/8) / (N + 1/4))`.
fn rank_normalize(trace: &[f64]) -> Vec<f64> {
    let total = trace.len();
    let mut order: Vec<usize> = (0..total).collect();
    order.sort_unstable_by(|&a, &b| trace[a].total_cmp(&trace[b]));

    let mut result = vec![0.0; total];
    let n_f = total as f64;
    let mut i = 0;
    while i < total {
        let mut j = i;
        while j < total && trace[order[j]] == trace[order[i]] {
            j += 1;
        }
        // Ties share the average rank.
        let avg_rank = (i + j + 1) as f64 / 2.0;
        let score = inv_normal_cdf((avg_rank - 0.375) / (n_f + 0.25));
        for &idx in &order[i..j] {
            result[idx] = score;
        }
        i = j;
    }
    result
}

/// ESS from the two halves of a trace using Geyer's initial positive sequence.
fn ess_split(trace: &[f64]) -> f64 {
    let half = trace.len() / 2;
    let split = [&trace[..half], &trace[trace.len() - half..]];
    let m_f = 2.0;
    let n_f = half as f64;

    let means: Vec<f64> = split.iter().map(|c| mean(c)).collect();
    let w = split
        .iter()
        .zip(&means)
        .map(|(c, &cm)| c.iter().map(|&x| (x - cm).powi(2)).sum::<f64>() / (n_f - 1.0))
        .sum::<f64>()
        / m_f;
    if w < 1e-30 {
        return f64::NAN;
    }

    let rho = |lag: usize| -> f64 {
        let mut gamma = 0.0;
        for (c, &cm) in split.iter().zip(&means) {
            for t in 0..half - lag {
                gamma += (c[t] - cm) * (c[t + lag] - cm);
            }
        }
        gamma /= m_f * (n_f - 1.0);
        1.0 - (w - gamma) / w
    };

    // Lags are evaluated lazily; the sum stops at the first negative pair.
    let mut tau = -1.0f64;
    let mut t = 1;
    while t + 1 < half {
        let pair_sum = rho(t) + rho(t + 1);
        if pair_sum < 0.0 {
            break;
        }
        tau += pair_sum;
        t += 2;
    }
    tau = tau.max(1.0 / (m_f * n_f));
    m_f * n_f / (1.0 + 2.0 * tau)
}

fn mean(data: &[f64]) -> f64 {
    data.iter().sum::<f64>() / data.len() as f64
}

/// Approximate inverse normal CDF (Abramowitz-Stegun 26.2.23).
fn inv_normal_cdf(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    let t = if p < 0.5 {
        (-2.0 * p.ln()).sqrt()
    } else {
        (-2.0 * (1.0 - p).ln()).sqrt()
    };

    let c0 = 2.515517;
    let c1 = 0.802853;
    let c2 = 0.010328;
    let d1 = 1.432788;
    let d2 = 0.189269;
    let d3 = 0.001308;

    let val = t - (c0 + c1 * t + c2 * t * t) / (1.0 + d1 * t + d2 * t * t + d3 * t * t * t);

    if p < 0.5 {
        -val
    } else {
        val
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, StandardNormal};

    fn ar1(phi: f64, n: usize, seed: u64) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut x = 0.0;
        (0..n)
            .map(|_| {
                let z: f64 = StandardNormal.sample(&mut rng);
                x = phi * x + z;
                x
            })
            .collect()
    }

    #[test]
    fn test_ess_independent_draws() {
        let ess = ess_bulk(&ar1(0.0, 2000, 1));
        assert!(ess > 1400.0 && ess < 2800.0, "got {ess}");
    }

    #[test]
    fn test_ess_drops_with_autocorrelation() {
        // For AR(1), ESS/N ≈ (1 - φ) / (1 + φ) = 0.053 at φ = 0.9.
        let ess = ess_bulk(&ar1(0.9, 4000, 2));
        assert!(ess < 600.0, "got {ess}");
        assert!(ess > 50.0, "got {ess}");
    }

    #[test]
    fn test_constant_trace_has_no_ess() {
        assert!(ess_bulk(&[1.0; 100]).is_nan());
        assert!(ess_bulk(&[1.0, 2.0]).is_nan());
    }

    #[test]
    fn test_stats_rates() {
        let mut stats = SamplerStats::default();
        stats.record(true, 0.2, false);
        stats.record(true, 0.9, true);
        stats.record(false, 1.0, true);
        stats.record(false, 0.5, false);
        assert_eq!(stats.warmup_acceptance_rate(), 0.5);
        assert_eq!(stats.sampling_acceptance_rate(), 0.5);
        assert!((stats.mean_accept_prob() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_run_diagnostics_table() {
        let mut chain = Chain::new(2, 1, true);
        for (a, b) in ar1(0.1, 200, 3).into_iter().zip(ar1(0.1, 200, 4)) {
            chain.push(&[a, b]);
        }
        let stats = SamplerStats {
            divergences: 2,
            final_step_size: Some(0.12),
            ..SamplerStats::default()
        };
        let diag = RunDiagnostics::from_run("HMC", &stats, Some(&chain));
        assert_eq!(diag.draws, 200);
        let (lo, mid) = (diag.ess_min.unwrap(), diag.ess_median.unwrap());
        assert!(lo <= mid);
        let table = diag.to_table();
        assert!(table.contains("divergences"));
        assert!(table.contains("2 divergent transitions"));

        let no_chain = RunDiagnostics::from_run("MAP", &SamplerStats::default(), None);
        assert!(no_chain.ess_min.is_none());
    }
}
