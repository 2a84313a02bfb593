//! Classifier adapters that map a processed window to one label per sample.

use crate::config::{ClassifierConfig, ClassifierMode, IntentLabels};
use crate::core::separation::ProcessedWindow;
use crate::serial::types::ChannelMode;
use crate::training::ModelArtifact;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::{Continuous, Normal};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("model '{name}' not found at {}", path.display())]
    ModelNotFound { name: String, path: PathBuf },
    #[error("model artifact is unreadable: {0}")]
    InvalidModel(String),
    #[error("model expects {expected} features, window provides {actual}")]
    FeatureMismatch { expected: usize, actual: usize },
    #[error("model '{name}' was trained on {model:?}, the configured channels provide {configured:?}")]
    LayoutMismatch {
        name: String,
        model: Vec<String>,
        configured: Vec<String>,
    },
}

/// Column names of the per-sample feature rows for a channel layout.
pub fn feature_names(mode: ChannelMode) -> Vec<String> {
    match mode {
        ChannelMode::Single => vec![
            "Timestamp".to_string(),
            "Raw_EMG".to_string(),
            "Independent_Component".to_string(),
        ],
        ChannelMode::Dual => vec![
            "Timestamp".to_string(),
            "Raw_EMG_1".to_string(),
            "Raw_EMG_2".to_string(),
            "Independent_Component_1".to_string(),
            "Independent_Component_2".to_string(),
        ],
    }
}

/// One feature row per sample: timestamp, raw readings, then components.
pub fn feature_rows(processed: &ProcessedWindow) -> Vec<Vec<f64>> {
    let window = &processed.window;
    let channels = window.channel_count();
    window
        .timestamps()
        .into_iter()
        .enumerate()
        .map(|(i, timestamp)| {
            let mut row = Vec::with_capacity(1 + 2 * channels);
            row.push(timestamp);
            for c in 0..channels {
                row.push(window.samples[i].channel(c).unwrap_or_default() as f64);
            }
            for c in 0..channels {
                row.push(processed.component(i, c).unwrap_or_default());
            }
            row
        })
        .collect()
}

/// Maps a processed window to one label per sample.
pub trait Classifier: Send {
    fn name(&self) -> &str;

    fn predict(&mut self, processed: &ProcessedWindow) -> Result<Vec<String>, ClassifierError>;
}

/// Gaussian naive Bayes model loaded from a persisted artifact.
pub struct TrainedClassifier {
    name: String,
    classes: Vec<CompiledClass>,
    feature_names: Vec<String>,
    feature_count: usize,
}

struct CompiledClass {
    label: String,
    log_prior: f64,
    features: Vec<Normal>,
}

impl TrainedClassifier {
    /// Path of the artifact for a model name.
    pub fn artifact_path(models_path: &Path, name: &str) -> PathBuf {
        models_path.join(format!("{name}.json"))
    }

    /// Load `<models_path>/<name>.json`.
    pub fn load(models_path: &Path, name: &str) -> Result<Self, ClassifierError> {
        let path = Self::artifact_path(models_path, name);
        if !path.exists() {
            return Err(ClassifierError::ModelNotFound {
                name: name.to_string(),
                path,
            });
        }
        let artifact = ModelArtifact::load(&path)
            .map_err(|e| ClassifierError::InvalidModel(e.to_string()))?;
        let classifier = Self::from_artifact(name, &artifact)?;
        info!(
            model = name,
            classes = classifier.classes.len(),
            features = classifier.feature_count,
            "classifier loaded"
        );
        Ok(classifier)
    }

    pub fn from_artifact(name: &str, artifact: &ModelArtifact) -> Result<Self, ClassifierError> {
        if artifact.classes.is_empty() {
            return Err(ClassifierError::InvalidModel("model has no classes".into()));
        }
        let feature_count = artifact.feature_names.len();
        let mut classes = Vec::with_capacity(artifact.classes.len());
        for class in &artifact.classes {
            if class.means.len() != feature_count || class.variances.len() != feature_count {
                return Err(ClassifierError::InvalidModel(format!(
                    "class '{}' has mismatched parameter lengths",
                    class.label
                )));
            }
            let features = class
                .means
                .iter()
                .zip(&class.variances)
                .map(|(&mean, &variance)| {
                    Normal::new(mean, (variance + artifact.var_smoothing).sqrt())
                        .map_err(|e| ClassifierError::InvalidModel(e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            classes.push(CompiledClass {
                label: class.label.clone(),
                log_prior: class.prior.max(f64::MIN_POSITIVE).ln(),
                features,
            });
        }
        Ok(Self {
            name: name.to_string(),
            classes,
            feature_names: artifact.feature_names.clone(),
            feature_count,
        })
    }

    /// Feature columns the model was trained on.
    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn predict_row(&self, row: &[f64]) -> &str {
        let mut best = &self.classes[0];
        let mut best_score = f64::NEG_INFINITY;
        for class in &self.classes {
            let score = class.log_prior
                + class
                    .features
                    .iter()
                    .zip(row)
                    .map(|(dist, &x)| dist.ln_pdf(x))
                    .sum::<f64>();
            if score > best_score {
                best_score = score;
                best = class;
            }
        }
        &best.label
    }
}

impl Classifier for TrainedClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&mut self, processed: &ProcessedWindow) -> Result<Vec<String>, ClassifierError> {
        let rows = feature_rows(processed);
        if let Some(first) = rows.first() {
            if first.len() != self.feature_count {
                return Err(ClassifierError::FeatureMismatch {
                    expected: self.feature_count,
                    actual: first.len(),
                });
            }
        }
        Ok(rows
            .iter()
            .map(|row| self.predict_row(row).to_string())
            .collect())
    }
}

/// Draws each label independently from a fixed prior.
pub struct SimulatedClassifier {
    labels: IntentLabels,
    affirmative_prior: f64,
    rng: StdRng,
}

impl SimulatedClassifier {
    pub fn new(labels: IntentLabels, affirmative_prior: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            labels,
            affirmative_prior: affirmative_prior.clamp(0.0, 1.0),
            rng,
        }
    }
}

impl Classifier for SimulatedClassifier {
    fn name(&self) -> &str {
        "simulated"
    }

    fn predict(&mut self, processed: &ProcessedWindow) -> Result<Vec<String>, ClassifierError> {
        Ok((0..processed.len())
            .map(|_| {
                if self.rng.random_bool(self.affirmative_prior) {
                    self.labels.affirmative.clone()
                } else {
                    self.labels.negative.clone()
                }
            })
            .collect())
    }
}

/// Construct the configured classifier variant.
///
/// A missing artifact, or one trained for another channel layout, fails
/// here, before any serial read begins.
pub fn build_classifier(
    config: &ClassifierConfig,
    models_path: &Path,
    mode: ChannelMode,
) -> Result<Box<dyn Classifier>, ClassifierError> {
    match &config.mode {
        ClassifierMode::Trained { model } => {
            let classifier = TrainedClassifier::load(models_path, model)?;
            let configured = feature_names(mode);
            if classifier.feature_names() != configured.as_slice() {
                return Err(ClassifierError::LayoutMismatch {
                    name: model.clone(),
                    model: classifier.feature_names().to_vec(),
                    configured,
                });
            }
            Ok(Box::new(classifier))
        }
        ClassifierMode::Simulated {
            affirmative_prior,
            seed,
        } => Ok(Box::new(SimulatedClassifier::new(
            config.labels.clone(),
            *affirmative_prior,
            *seed,
        ))),
    }
}
