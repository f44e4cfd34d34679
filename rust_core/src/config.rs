use crate::error::{self, ConfigError};
use crate::geometry::AngleSpec;
use crate::prior::{Prior, PriorFamily};
use crate::wavelet::{BuiltinWavelets, WaveletFilters};
use serde::{Deserialize, Serialize};

/// Grid sizes above this are refused before any operator is built.
pub const DEFAULT_MAX_GRID_SIZE: usize = 512;

/// Default likelihood variance σ².
pub const DEFAULT_LIKELIHOOD_VARIANCE: f64 = 0.5;

/// Smoothing constant of the pseudo-Huber penalty.
pub const DEFAULT_SMOOTHING: f64 = 0.01;

/// Circular Laplacian.
pub const DEFAULT_TIKHONOV_ORDER: usize = 2;

pub const DEFAULT_WAVELET: &str = "haar";

/// Description of one reconstruction problem: acquisition, noise and the
/// likelihood/prior constants shared by every estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProblemConfig {
    pub grid_size: usize,
    pub angles: AngleSpec,
    /// Noise standard deviation as a fraction of the largest noiseless projection.
    pub noise_fraction: f64,
    pub likelihood_variance: f64,
    pub smoothing: f64,
    /// Difference order of the Tikhonov operator, 1 or 2.
    pub tikhonov_order: usize,
    /// Wavelet of the Besov prior, e.g. `"db2"`.
    pub wavelet: String,
    pub max_grid_size: usize,
    pub seed: u64,
}

impl Default for ProblemConfig {
    fn default() -> Self {
        Self {
            grid_size: 64,
            angles: AngleSpec::UniformCount(50),
            noise_fraction: 0.02,
            likelihood_variance: DEFAULT_LIKELIHOOD_VARIANCE,
            smoothing: DEFAULT_SMOOTHING,
            tikhonov_order: DEFAULT_TIKHONOV_ORDER,
            wavelet: DEFAULT_WAVELET.to_string(),
            max_grid_size: DEFAULT_MAX_GRID_SIZE,
            seed: 42,
        }
    }
}

impl ProblemConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_grid_size(self.grid_size, self.max_grid_size)?;
        self.angles.angles()?;
        if !(self.noise_fraction >= 0.0 && self.noise_fraction.is_finite()) {
            return Err(ConfigError::InvalidHyperparameter {
                name: "noise_fraction",
                value: self.noise_fraction,
                reason: "must be finite and non-negative",
            });
        }
        if !(self.likelihood_variance > 0.0 && self.likelihood_variance.is_finite()) {
            return Err(ConfigError::InvalidHyperparameter {
                name: "likelihood_variance",
                value: self.likelihood_variance,
                reason: "must be finite and positive",
            });
        }
        if !(self.smoothing >= 0.0 && self.smoothing.is_finite()) {
            return Err(ConfigError::InvalidHyperparameter {
                name: "smoothing",
                value: self.smoothing,
                reason: "must be finite and non-negative",
            });
        }
        if !matches!(self.tikhonov_order, 1 | 2) {
            return Err(ConfigError::UnsupportedOrder(self.tikhonov_order));
        }
        BuiltinWavelets.filters(&self.wavelet)?;
        Ok(())
    }

    /// Prior of `family` on this problem's grid, using `tikhonov_order` and
    /// `wavelet`. The pseudo-Huber families use `smoothing` as β.
    pub fn prior(&self, family: PriorFamily, alpha: f64) -> error::Result<Prior> {
        let n = self.grid_size;
        match family {
            PriorFamily::Tikhonov => Prior::tikhonov(n, self.tikhonov_order, alpha),
            PriorFamily::TotalVariation => Prior::total_variation(n, alpha, self.smoothing),
            PriorFamily::Cauchy => Prior::cauchy(n, alpha),
            PriorFamily::Besov => {
                let filters = BuiltinWavelets.filters(&self.wavelet)?;
                Prior::besov(n, &filters, None, alpha, self.smoothing)
            }
        }
    }
}

pub fn check_grid_size(size: usize, max: usize) -> Result<(), ConfigError> {
    if size == 0 {
        return Err(ConfigError::EmptyGrid);
    }
    if size > max {
        return Err(ConfigError::GridTooLarge { size, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        ProblemConfig::default().validate().unwrap();
    }

    #[test]
    fn test_oversized_grid_rejected() {
        let config = ProblemConfig {
            grid_size: 1024,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::GridTooLarge {
                size: 1024,
                max: DEFAULT_MAX_GRID_SIZE
            })
        );
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: ProblemConfig = serde_json::from_str(
            r#"{"grid_size": 32, "angles": {"range": {"start": 0.0, "end": 90.0, "count": 10}}}"#,
        )
        .unwrap();
        assert_eq!(config.grid_size, 32);
        assert_eq!(
            config.angles,
            AngleSpec::Range {
                start: 0.0,
                end: 90.0,
                count: 10
            }
        );
        assert_eq!(config.likelihood_variance, DEFAULT_LIKELIHOOD_VARIANCE);
    }

    #[test]
    fn test_prior_uses_smoothing() {
        let config = ProblemConfig {
            grid_size: 8,
            smoothing: 0.2,
            ..Default::default()
        };
        let tv = config.prior(PriorFamily::TotalVariation, 3.0).unwrap();
        assert_eq!(tv.beta(), 0.2);
        assert_eq!(tv.alpha(), 3.0);
        let besov = config.prior(PriorFamily::Besov, 1.0).unwrap();
        assert_eq!(besov.operator().grid_size(), 8);
        assert!(config.prior(PriorFamily::Cauchy, 0.0).is_err());
    }

    #[test]
    fn test_prior_uses_order_and_wavelet() {
        let config = ProblemConfig {
            grid_size: 8,
            ..Default::default()
        };
        assert_eq!(
            config.prior(PriorFamily::Tikhonov, 1.0).unwrap(),
            Prior::tikhonov(8, 2, 1.0).unwrap()
        );

        let config: ProblemConfig =
            serde_json::from_str(r#"{"grid_size": 8, "tikhonov_order": 1, "wavelet": "db2"}"#)
                .unwrap();
        config.validate().unwrap();
        assert_eq!(
            config.prior(PriorFamily::Tikhonov, 1.0).unwrap(),
            Prior::tikhonov(8, 1, 1.0).unwrap()
        );
        let db2 = BuiltinWavelets.filters("db2").unwrap();
        assert_eq!(
            config.prior(PriorFamily::Besov, 1.0).unwrap(),
            Prior::besov(8, &db2, None, 1.0, DEFAULT_SMOOTHING).unwrap()
        );
        let haar = BuiltinWavelets.filters("haar").unwrap();
        assert_ne!(
            config.prior(PriorFamily::Besov, 1.0).unwrap(),
            Prior::besov(8, &haar, None, 1.0, DEFAULT_SMOOTHING).unwrap()
        );
    }

    #[test]
    fn test_bad_order_and_wavelet_rejected() {
        let order = ProblemConfig {
            tikhonov_order: 3,
            ..Default::default()
        };
        assert_eq!(order.validate(), Err(ConfigError::UnsupportedOrder(3)));
        let wavelet = ProblemConfig {
            wavelet: "sym5".to_string(),
            ..Default::default()
        };
        assert_eq!(
            wavelet.validate(),
            Err(ConfigError::UnknownWavelet("sym5".to_string()))
        );
    }

    #[test]
    fn test_negative_noise_rejected() {
        let config = ProblemConfig {
            noise_fraction: -0.1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
