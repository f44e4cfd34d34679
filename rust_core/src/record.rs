//! Reconstruction records and the sinks that persist them.

use crate::chain::Chain;
use crate::diagnostics::RunDiagnostics;
use crate::error::{ConfigError, Result};
use crate::geometry::AngleSpec;
use crate::image::Raster;
use crate::posterior::PosteriorContext;
use crate::prior::PriorFamily;
use crate::sampler::Estimate;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// `‖x - t‖ / ‖t‖`, or `None` for an all-zero target.
pub fn relative_l2_error(truth: &[f64], estimate: &[f64]) -> Option<f64> {
    let norm: f64 = truth.iter().map(|t| t * t).sum();
    if norm == 0.0 {
        return None;
    }
    let diff: f64 = truth.iter().zip(estimate).map(|(t, e)| (t - e).powi(2)).sum();
    Some((diff / norm).sqrt()).filter(|r| r.is_finite())
}

pub fn rmse(truth: &[f64], estimate: &[f64]) -> f64 {
    let diff: f64 = truth.iter().zip(estimate).map(|(t, e)| (t - e).powi(2)).sum();
    (diff / truth.len() as f64).sqrt()
}

/// Peak signal-to-noise ratio in dB, with the peak taken from the target.
pub fn psnr(truth: &[f64], estimate: &[f64]) -> f64 {
    let peak = truth.iter().fold(0.0f64, |m, t| m.max(t.abs()));
    let err = rmse(truth, estimate);
    if err == 0.0 {
        f64::INFINITY
    } else {
        20.0 * (peak / err).log10()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// `None` for an all-zero target.
    pub relative_l2_error: Option<f64>,
    pub rmse: f64,
    /// `None` for an exact reconstruction.
    pub psnr: Option<f64>,
}

impl Metrics {
    pub fn compare(truth: &[f64], estimate: &[f64]) -> Self {
        Self {
            relative_l2_error: relative_l2_error(truth, estimate),
            rmse: rmse(truth, estimate),
            psnr: Some(psnr(truth, estimate)).filter(|p| p.is_finite()),
        }
    }
}

/// Everything needed to reproduce and judge one reconstruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionRecord {
    pub target: Vec<Vec<f64>>,
    pub reconstruction: Vec<Vec<f64>>,
    pub method: String,
    pub prior: Option<PriorFamily>,
    pub alpha: Option<f64>,
    pub beta: Option<f64>,
    pub likelihood_variance: f64,
    pub noise_fraction: f64,
    pub angles: AngleSpec,
    pub elapsed_seconds: f64,
    pub metrics: Metrics,
    pub diagnostics: RunDiagnostics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<Chain>,
}

fn nested(raster: &Raster) -> Vec<Vec<f64>> {
    raster.pixels().rows().into_iter().map(|row| row.to_vec()).collect()
}

impl ReconstructionRecord {
    pub fn new(
        target: &Raster,
        estimate: &Estimate,
        ctx: &PosteriorContext,
        noise_fraction: f64,
        angles: AngleSpec,
    ) -> Result<Self> {
        let n = ctx.grid_size();
        if target.size() != n {
            return Err(ConfigError::DimensionMismatch {
                what: "target grid size",
                expected: n,
                actual: target.size(),
            }
            .into());
        }
        let reconstruction = Raster::from_flat(n, estimate.x.clone())?;
        let metrics = Metrics::compare(&target.flatten(), &estimate.x);
        let prior = ctx.prior();
        Ok(Self {
            target: nested(target),
            reconstruction: nested(&reconstruction),
            method: estimate.method.to_string(),
            prior: prior.map(|p| p.family()),
            alpha: prior.map(|p| p.alpha()),
            beta: prior.and_then(|p| match p.family() {
                PriorFamily::TotalVariation | PriorFamily::Besov => Some(p.beta()),
                _ => None,
            }),
            likelihood_variance: ctx.likelihood_variance(),
            noise_fraction,
            angles,
            elapsed_seconds: estimate.elapsed.as_secs_f64(),
            metrics,
            diagnostics: estimate.diagnostics.clone(),
            chain: estimate.chain.clone(),
        })
    }

    /// File stem such as `hmc-tv-32`.
    pub fn stem(&self) -> String {
        let prior = self.prior.map_or("flat", |p| p.name());
        format!(
            "{}-{}-{}",
            self.method.to_ascii_lowercase(),
            prior,
            self.reconstruction.len()
        )
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

/// Destination for finished reconstruction records.
pub trait ResultSink {
    fn store(&mut self, record: &ReconstructionRecord) -> Result<()>;
}

/// Writes each record as pretty-printed JSON into a directory.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
    written: Vec<PathBuf>,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            written: Vec::new(),
        }
    }

    /// Paths written so far, in order.
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    fn next_path(&self, stem: &str) -> PathBuf {
        let mut path = self.dir.join(format!("{stem}.json"));
        let mut k = 1;
        while path.exists() {
            path = self.dir.join(format!("{stem}-{k}.json"));
            k += 1;
        }
        path
    }
}

impl ResultSink for JsonFileSink {
    fn store(&mut self, record: &ReconstructionRecord) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.next_path(&record.stem());
        let writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(writer, record)?;
        info!("wrote reconstruction record to {}", path.display());
        self.written.push(path);
        Ok(())
    }
}
