//! Wavelet decomposition filters.
//!
//! Low-pass coefficients follow the PyWavelets `dec_lo` convention; the
//! high-pass filter is its quadrature mirror.

use crate::error::ConfigError;

const HAAR: [f64; 2] = [0.7071067811865476, 0.7071067811865476];

const DB2: [f64; 4] = [
    -0.12940952255126037,
    0.2241438680420134,
    0.8365163037378079,
    0.48296291314453416,
];

const DB3: [f64; 6] = [
    0.03522629188570953,
    -0.08544127388202666,
    -0.13501102001025458,
    0.45987750211849154,
    0.8068915093110925,
    0.33267055295008263,
];

const DB4: [f64; 8] = [
    -0.010597401785069032,
    0.0328830116668852,
    0.030841381835560764,
    -0.18703481171909309,
    -0.027983769416859854,
    0.6308807679298589,
    0.7148465705529157,
    0.2303778133088965,
];

/// Matched low-pass / high-pass analysis filters.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterPair {
    pub low: Vec<f64>,
    pub high: Vec<f64>,
}

impl FilterPair {
    /// Build the pair from a low-pass filter: `high[k] = (-1)^(k+1) low[N-1-k]`.
    pub fn from_low_pass(low: &[f64]) -> Self {
        let n = low.len();
        let high = (0..n)
            .map(|k| {
                let sign = if k % 2 == 0 { -1.0 } else { 1.0 };
                sign * low[n - 1 - k]
            })
            .collect();
        Self {
            low: low.to_vec(),
            high,
        }
    }
}

/// Lookup of decomposition filters by wavelet name.
pub trait WaveletFilters {
    fn filters(&self, name: &str) -> Result<FilterPair, ConfigError>;
}

/// Orthogonal Daubechies family up to four vanishing moments.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinWavelets;

impl WaveletFilters for BuiltinWavelets {
    fn filters(&self, name: &str) -> Result<FilterPair, ConfigError> {
        let low: &[f64] = match name.to_ascii_lowercase().as_str() {
            "haar" | "db1" => &HAAR,
            "db2" => &DB2,
            "db3" => &DB3,
            "db4" => &DB4,
            _ => return Err(ConfigError::UnknownWavelet(name.to_string())),
        };
        Ok(FilterPair::from_low_pass(low))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haar_pair() {
        let pair = BuiltinWavelets.filters("haar").unwrap();
        assert_eq!(pair.high, vec![-HAAR[0], HAAR[0]]);
    }

    #[test]
    fn test_filters_are_orthonormal() {
        for name in ["haar", "db2", "db3", "db4"] {
            let FilterPair { low, high } = BuiltinWavelets.filters(name).unwrap();
            let n = low.len();
            assert!((low.iter().sum::<f64>() - 2f64.sqrt()).abs() < 1e-10, "{name}");
            assert!(high.iter().sum::<f64>().abs() < 1e-10, "{name}");
            // Orthogonal to their own even shifts and to each other.
            for shift in (0..n).step_by(2) {
                let auto: f64 = (0..n - shift).map(|k| low[k] * low[k + shift]).sum();
                let cross: f64 = (0..n - shift).map(|k| low[k] * high[k + shift]).sum();
                let expected = if shift == 0 { 1.0 } else { 0.0 };
                assert!((auto - expected).abs() < 1e-10, "{name} shift {shift}");
                assert!(cross.abs() < 1e-10, "{name} shift {shift}");
            }
        }
    }

    #[test]
    fn test_unknown_wavelet() {
        assert_eq!(
            BuiltinWavelets.filters("sym9"),
            Err(ConfigError::UnknownWavelet("sym9".to_string()))
        );
    }
}
