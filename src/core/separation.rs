//! Blind source separation of sealed windows.

use crate::config::{AcquisitionConfig, SeparationConfig};
use crate::core::windowing::Window;
use linfa::prelude::*;
use linfa_ica::fast_ica::FastIca;
use ndarray::{Array2, Axis};
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;
use tracing::debug;

/// Reasons a window cannot be decomposed. All of them skip the window.
#[derive(Debug, Error)]
pub enum SeparationError {
    #[error("window has {actual} samples, at least {required} are needed")]
    TooFewSamples { actual: usize, required: usize },
    #[error("channel {0} is constant")]
    ConstantChannel(usize),
    #[error("channels {0} and {1} are linearly dependent")]
    DependentChannels(usize, usize),
    #[error("decomposition failed: {0}")]
    Decomposition(String),
    #[error("decomposition produced non-finite values")]
    NonFinite,
}

/// A window together with its independent components.
#[derive(Debug, Clone)]
pub struct ProcessedWindow {
    pub window: Window,
    /// One vector per channel, each the same length as the window
    pub components: Vec<Vec<f64>>,
}

impl ProcessedWindow {
    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Component value for one sample and channel.
    pub fn component(&self, sample: usize, channel: usize) -> Option<f64> {
        self.components.get(channel)?.get(sample).copied()
    }
}

/// Decomposes a window into independent components.
pub trait SourceSeparator: Send + Sync {
    fn separate(&self, window: Window) -> Result<ProcessedWindow, SeparationError>;
}

/// Channels whose absolute correlation reaches this are treated as one source.
const DEPENDENT_CORRELATION: f64 = 1.0 - 1e-9;

/// FastICA with one component per input channel, mean-centered.
#[derive(Debug, Clone)]
pub struct FastIcaSeparator {
    max_iterations: usize,
    tolerance: f64,
    min_samples: usize,
}

impl FastIcaSeparator {
    pub fn new(max_iterations: usize, tolerance: f64, min_samples: usize) -> Self {
        Self {
            max_iterations,
            tolerance,
            min_samples: min_samples.max(2),
        }
    }

    pub fn from_config(separation: &SeparationConfig, acquisition: &AcquisitionConfig) -> Self {
        Self::new(
            separation.max_iterations,
            separation.tolerance,
            acquisition.min_samples,
        )
    }

    fn check(&self, matrix: &Array2<f64>) -> Result<(), SeparationError> {
        let rows = matrix.nrows();
        if rows < self.min_samples {
            return Err(SeparationError::TooFewSamples {
                actual: rows,
                required: self.min_samples,
            });
        }
        for (idx, column) in matrix.axis_iter(Axis(1)).enumerate() {
            if column.var(0.0) <= f64::EPSILON {
                return Err(SeparationError::ConstantChannel(idx));
            }
        }

        // whitening divides by every eigenvalue of the covariance
        let Some(mean) = matrix.mean_axis(Axis(0)) else {
            return Err(SeparationError::TooFewSamples {
                actual: rows,
                required: self.min_samples,
            });
        };
        let centered = matrix - &mean;
        let covariance = centered.t().dot(&centered);
        let channels = matrix.ncols();
        for a in 0..channels {
            for b in (a + 1)..channels {
                let scale = (covariance[[a, a]] * covariance[[b, b]]).sqrt();
                let correlation = covariance[[a, b]] / scale;
                if !correlation.is_finite() || correlation.abs() >= DEPENDENT_CORRELATION {
                    return Err(SeparationError::DependentChannels(a, b));
                }
            }
        }
        Ok(())
    }

    fn decompose(
        &self,
        matrix: &Array2<f64>,
        n_components: usize,
    ) -> Result<Array2<f64>, SeparationError> {
        let dataset = DatasetBase::from(matrix.clone());
        let fitted = FastIca::params()
            .ncomponents(n_components)
            .max_iter(self.max_iterations)
            .tol(self.tolerance)
            .fit(&dataset)
            .map_err(|e| SeparationError::Decomposition(e.to_string()))?;
        Ok(fitted.predict(matrix))
    }
}

impl Default for FastIcaSeparator {
    fn default() -> Self {
        Self::from_config(&SeparationConfig::default(), &AcquisitionConfig::default())
    }
}

impl SourceSeparator for FastIcaSeparator {
    fn separate(&self, window: Window) -> Result<ProcessedWindow, SeparationError> {
        let matrix = window.to_matrix();
        self.check(&matrix)?;

        let n_components = window.channel_count();
        // linfa-ica panics on some near-singular inputs the checks above miss
        let sources = panic::catch_unwind(AssertUnwindSafe(|| {
            self.decompose(&matrix, n_components)
        }))
        .map_err(|payload| SeparationError::Decomposition(panic_message(payload.as_ref())))??;
        if sources.iter().any(|v| !v.is_finite()) {
            return Err(SeparationError::NonFinite);
        }

        let components = center_columns(&sources);
        debug!(
            samples = window.len(),
            components = components.len(),
            "window decomposed"
        );
        Ok(ProcessedWindow { window, components })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "decomposition panicked".to_string()
    }
}

/// Subtract each column's mean and return the columns as vectors.
fn center_columns(sources: &Array2<f64>) -> Vec<Vec<f64>> {
    sources
        .axis_iter(Axis(1))
        .map(|column| {
            let mean = column.mean().unwrap_or(0.0);
            column.iter().map(|v| v - mean).collect()
        })
        .collect()
}
