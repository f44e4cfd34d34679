//! Parallel-beam acquisition geometry.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Upper end, in degrees, of the angles generated by `AngleSpec::UniformCount`.
const UNIFORM_LAST_DEGREES: f64 = 179.0;

/// How projection angles are requested, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AngleSpec {
    /// `n` angles evenly spaced from 0° to 179° inclusive.
    UniformCount(usize),
    /// `count` angles evenly spaced from `start` to `end` inclusive.
    Range { start: f64, end: f64, count: usize },
}

impl AngleSpec {
    /// Parse the command-line form: one value is a count, three values are a
    /// `(start, end, count)` triple.
    pub fn from_values(values: &[f64]) -> Result<Self, ConfigError> {
        match *values {
            [count] => Ok(AngleSpec::UniformCount(parse_count(count)?)),
            [start, end, count] => Ok(AngleSpec::Range {
                start,
                end,
                count: parse_count(count)?,
            }),
            _ => Err(ConfigError::MalformedAngleSpec(values.len())),
        }
    }

    pub fn count(&self) -> usize {
        match *self {
            AngleSpec::UniformCount(n) => n,
            AngleSpec::Range { count, .. } => count,
        }
    }

    /// Expand into concrete angles. A zero count is rejected.
    pub fn angles(&self) -> Result<AngleSet, ConfigError> {
        let (start, end, count) = match *self {
            AngleSpec::UniformCount(n) => (0.0, UNIFORM_LAST_DEGREES, n),
            AngleSpec::Range { start, end, count } => (start, end, count),
        };
        if count == 0 {
            return Err(ConfigError::InvalidAngleCount(0.0));
        }
        if !start.is_finite() || !end.is_finite() {
            return Err(ConfigError::InvalidAngleCount(count as f64));
        }
        let degrees: Vec<f64> = if count == 1 {
            vec![start]
        } else {
            let step = (end - start) / (count - 1) as f64;
            (0..count).map(|k| start + step * k as f64).collect()
        };
        Ok(AngleSet {
            radians: degrees.iter().map(|d| d.to_radians()).collect(),
        })
    }

    /// Short stable label, used in cache keys and result records.
    pub fn label(&self) -> String {
        match *self {
            AngleSpec::UniformCount(n) => format!("{n}"),
            AngleSpec::Range { start, end, count } => format!("{start}-{end}-{count}"),
        }
    }
}

fn parse_count(value: f64) -> Result<usize, ConfigError> {
    if value.is_finite() && value >= 1.0 && value.fract() == 0.0 {
        Ok(value as usize)
    } else {
        Err(ConfigError::InvalidAngleCount(value))
    }
}

/// Ordered projection angles in radians.
#[derive(Debug, Clone, PartialEq)]
pub struct AngleSet {
    radians: Vec<f64>,
}

impl AngleSet {
    pub fn from_radians(radians: Vec<f64>) -> Self {
        Self { radians }
    }

    pub fn radians(&self) -> &[f64] {
        &self.radians
    }

    pub fn len(&self) -> usize {
        self.radians.len()
    }

    pub fn is_empty(&self) -> bool {
        self.radians.is_empty()
    }
}

/// Number of detector bins for an `n`×`n` grid: the image diagonal in pixels.
pub fn detector_bins(n: usize) -> usize {
    (2f64.sqrt() * n as f64).ceil() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_values() {
        assert_eq!(
            AngleSpec::from_values(&[20.0]).unwrap(),
            AngleSpec::UniformCount(20)
        );
        assert_eq!(
            AngleSpec::from_values(&[0.0, 90.0, 4.0]).unwrap(),
            AngleSpec::Range {
                start: 0.0,
                end: 90.0,
                count: 4
            }
        );
        assert_eq!(
            AngleSpec::from_values(&[1.0, 2.0]),
            Err(ConfigError::MalformedAngleSpec(2))
        );
        assert_eq!(
            AngleSpec::from_values(&[]),
            Err(ConfigError::MalformedAngleSpec(0))
        );
        assert!(AngleSpec::from_values(&[2.5]).is_err());
        assert!(AngleSpec::from_values(&[0.0, 10.0, 0.0]).is_err());
    }

    #[test]
    fn test_uniform_count_spans_0_to_179() {
        let set = AngleSpec::UniformCount(180).angles().unwrap();
        assert_eq!(set.len(), 180);
        assert_eq!(set.radians()[0], 0.0);
        assert!((set.radians()[179] - 179.0f64.to_radians()).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_range_repeats_angle() {
        let set = AngleSpec::Range {
            start: 30.0,
            end: 30.0,
            count: 3,
        }
        .angles()
        .unwrap();
        assert_eq!(set.len(), 3);
        assert!(set.radians().iter().all(|&a| a == set.radians()[0]));
    }

    #[test]
    fn test_single_angle_range() {
        let set = AngleSpec::Range {
            start: 45.0,
            end: 90.0,
            count: 1,
        }
        .angles()
        .unwrap();
        assert_eq!(set.radians(), &[45.0f64.to_radians()]);
    }

    #[test]
    fn test_detector_bins() {
        assert_eq!(detector_bins(1), 2);
        assert_eq!(detector_bins(16), 23);
        assert_eq!(detector_bins(64), 91);
    }
}
