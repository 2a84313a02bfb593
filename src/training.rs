//! Model training from labeled recordings.
//!
//! Recordings for every configured label are combined into one dataset,
//! a Gaussian naive Bayes model is fitted over the per-sample features and
//! the result is persisted as a JSON artifact the trained classifier loads.

use crate::config::Config;
use crate::core::classifier::TrainedClassifier;
use crate::recording::{combine_recordings, recording_path, Dataset, RecordingError};
use chrono::{DateTime, Utc};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Artifact error: {0}")]
    Artifact(#[from] serde_json::Error),
    #[error(transparent)]
    Recording(#[from] RecordingError),
    #[error("missing recordings: {}", display_paths(.0))]
    MissingRecordings(Vec<PathBuf>),
    #[error("dataset has no rows")]
    EmptyDataset,
    #[error("dataset has {0} class(es), at least 2 are needed")]
    TooFewClasses(usize),
    #[error("dataset rows do not match its {0} feature columns")]
    RaggedRows(usize),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Per-class Gaussian parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassParameters {
    pub label: String,
    pub prior: f64,
    pub means: Vec<f64>,
    pub variances: Vec<f64>,
}

/// Persisted classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub feature_names: Vec<String>,
    /// Added to every variance before evaluating densities
    pub var_smoothing: f64,
    pub training_rows: usize,
    pub classes: Vec<ClassParameters>,
}

impl ModelArtifact {
    pub fn load(path: &Path) -> Result<Self, TrainingError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), TrainingError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Fits a model artifact from a dataset.
pub trait ModelTrainer {
    fn fit(&self, dataset: &Dataset, name: &str) -> Result<ModelArtifact, TrainingError>;
}

/// Gaussian naive Bayes with variance smoothing relative to the largest
/// feature variance.
#[derive(Debug, Clone)]
pub struct GaussianNbTrainer {
    pub var_smoothing: f64,
}

impl Default for GaussianNbTrainer {
    fn default() -> Self {
        Self {
            var_smoothing: 1e-9,
        }
    }
}

impl ModelTrainer for GaussianNbTrainer {
    fn fit(&self, dataset: &Dataset, name: &str) -> Result<ModelArtifact, TrainingError> {
        if dataset.is_empty() {
            return Err(TrainingError::EmptyDataset);
        }
        let classes = dataset.classes();
        if classes.len() < 2 {
            return Err(TrainingError::TooFewClasses(classes.len()));
        }

        let features = feature_matrix(dataset)?;
        let max_var = features
            .var_axis(Axis(0), 0.0)
            .fold(0.0_f64, |acc, &v| acc.max(v));
        let epsilon = (self.var_smoothing * max_var).max(f64::MIN_POSITIVE);

        let total = dataset.len() as f64;
        let parameters = classes
            .iter()
            .map(|label| {
                let indices: Vec<usize> = dataset
                    .labels
                    .iter()
                    .enumerate()
                    .filter(|(_, l)| *l == label)
                    .map(|(i, _)| i)
                    .collect();
                let members = features.select(Axis(0), &indices);
                ClassParameters {
                    label: label.clone(),
                    prior: indices.len() as f64 / total,
                    means: members
                        .mean_axis(Axis(0))
                        .map(|m| m.to_vec())
                        .unwrap_or_default(),
                    variances: members.var_axis(Axis(0), 0.0).to_vec(),
                }
            })
            .collect();

        Ok(ModelArtifact {
            name: name.to_string(),
            created_at: Utc::now(),
            feature_names: dataset.feature_names.clone(),
            var_smoothing: epsilon,
            training_rows: dataset.len(),
            classes: parameters,
        })
    }
}

/// Rows as an N x F matrix.
fn feature_matrix(dataset: &Dataset) -> Result<Array2<f64>, TrainingError> {
    let n_features = dataset.feature_names.len();
    if dataset.rows.iter().any(|row| row.len() != n_features) {
        return Err(TrainingError::RaggedRows(n_features));
    }
    let values: Vec<f64> = dataset.rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((dataset.len(), n_features), values)
        .map_err(|_| TrainingError::RaggedRows(n_features))
}

/// Outcome of a training run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub model: String,
    pub model_path: PathBuf,
    pub dataset_path: PathBuf,
    pub rows: usize,
    pub classes: Vec<String>,
}

/// Combine the recordings for every configured label and fit `name`.
pub fn train_from_recordings(config: &Config, name: &str) -> Result<TrainingReport, TrainingError> {
    train_with(config, name, &GaussianNbTrainer::default())
}

pub fn train_with(
    config: &Config,
    name: &str,
    trainer: &dyn ModelTrainer,
) -> Result<TrainingReport, TrainingError> {
    let inputs: Vec<PathBuf> = config
        .classifier
        .labels
        .all()
        .iter()
        .map(|label| recording_path(&config.data_path, &config.recording.file_prefix, label))
        .collect();

    let missing: Vec<PathBuf> = inputs.iter().filter(|p| !p.exists()).cloned().collect();
    if !missing.is_empty() {
        return Err(TrainingError::MissingRecordings(missing));
    }

    let dataset_path = config.data_path.join(&config.recording.dataset_file);
    let dataset = combine_recordings(&inputs, &dataset_path)?;
    let artifact = trainer.fit(&dataset, name)?;

    let model_path = TrainedClassifier::artifact_path(&config.models_path, name);
    artifact.save(&model_path)?;
    info!(
        model = name,
        rows = artifact.training_rows,
        path = %model_path.display(),
        "model trained"
    );

    Ok(TrainingReport {
        model: name.to_string(),
        model_path,
        dataset_path,
        rows: artifact.training_rows,
        classes: artifact.classes.iter().map(|c| c.label.clone()).collect(),
    })
}
