//! Square reconstruction rasters.
//!
//! Loading and rescaling image files is left to callers; this module only
//! enforces the shape contract the engine relies on and renders analytic
//! phantoms at arbitrary resolution.

use crate::error::ConfigError;
use ndarray::Array2;

/// An `n`×`n` floating-point image. Row `i`, column `j` maps to the flat index
/// `i * n + j`.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pixels: Array2<f64>,
}

impl Raster {
    pub fn new(pixels: Array2<f64>) -> Result<Self, ConfigError> {
        let (rows, cols) = pixels.dim();
        if rows != cols {
            return Err(ConfigError::NonSquareImage { rows, cols });
        }
        if rows == 0 {
            return Err(ConfigError::EmptyGrid);
        }
        Ok(Self { pixels })
    }

    pub fn from_flat(n: usize, values: Vec<f64>) -> Result<Self, ConfigError> {
        if values.len() != n * n {
            return Err(ConfigError::DimensionMismatch {
                what: "flattened image",
                expected: n * n,
                actual: values.len(),
            });
        }
        let pixels = Array2::from_shape_vec((n, n), values).map_err(|_| {
            ConfigError::DimensionMismatch {
                what: "flattened image",
                expected: n * n,
                actual: 0,
            }
        })?;
        Self::new(pixels)
    }

    /// Render an axis-aligned square covering `[lo, hi]²` of the unit square
    /// with intensity `value`. Boundary pixels get their covered area fraction,
    /// so the same phantom is consistent across resolutions.
    pub fn square_phantom(n: usize, lo: f64, hi: f64, value: f64) -> Result<Self, ConfigError> {
        if n == 0 {
            return Err(ConfigError::EmptyGrid);
        }
        let h = 1.0 / n as f64;
        let coverage = |k: usize| {
            let a = k as f64 * h;
            let b = a + h;
            ((b.min(hi) - a.max(lo)).max(0.0)) / h
        };
        let pixels = Array2::from_shape_fn((n, n), |(i, j)| value * coverage(i) * coverage(j));
        Ok(Self { pixels })
    }

    pub fn size(&self) -> usize {
        self.pixels.nrows()
    }

    pub fn pixels(&self) -> &Array2<f64> {
        &self.pixels
    }

    /// Row-major flattening.
    pub fn flatten(&self) -> Vec<f64> {
        self.pixels.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_non_square_rejected() {
        let err = Raster::new(Array2::zeros((3, 4))).unwrap_err();
        assert_eq!(err, ConfigError::NonSquareImage { rows: 3, cols: 4 });
    }

    #[test]
    fn test_flatten_is_row_major() {
        let r = Raster::new(array![[1.0, 2.0], [3.0, 4.0]]).unwrap();
        assert_eq!(r.flatten(), vec![1.0, 2.0, 3.0, 4.0]);
        let back = Raster::from_flat(2, r.flatten()).unwrap();
        assert_eq!(back, r);
        assert!(Raster::from_flat(3, vec![0.0; 4]).is_err());
    }

    #[test]
    fn test_phantom_mass_is_resolution_independent() {
        let coarse = Raster::square_phantom(16, 0.3, 0.7, 1.0).unwrap();
        let fine = Raster::square_phantom(64, 0.3, 0.7, 1.0).unwrap();
        let mass = |r: &Raster| r.pixels().sum() / (r.size() * r.size()) as f64;
        assert!((mass(&coarse) - 0.16).abs() < 1e-12);
        assert!((mass(&fine) - 0.16).abs() < 1e-12);
    }
}
