pub mod chain;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod forward;
pub mod geometry;
pub mod hmc;
pub mod image;
pub mod map;
pub mod mwg;
pub mod posterior;
pub mod prior;
pub mod progress;
pub mod record;
pub mod sampler;
pub mod sparse;
pub mod wavelet;

pub use error::{ConfigError, Result, TomoError};
pub use posterior::{LogDensity, PosteriorContext};
pub use sampler::{reconstruct, Estimate, Estimator};

// Future: filtered back-projection as a cheap warm start for MAP and the
// samplers, replacing the constant starting image.
