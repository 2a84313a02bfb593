//! Core signal pipeline for the EMG Intent Agent.
//!
//! This module contains:
//! - Window accumulation of raw serial samples
//! - Blind source separation of sealed windows
//! - Classifier adapters (trained model or simulated)
//! - Decision aggregation with cooldown and hysteresis
//! - The session loops tying them together

pub mod classifier;
pub mod decision;
pub mod pipeline;
pub mod separation;
pub mod windowing;

// Re-export commonly used types
pub use classifier::{
    build_classifier, feature_names, feature_rows, Classifier, ClassifierError,
    SimulatedClassifier, TrainedClassifier,
};
pub use decision::{
    Decision, DecisionAggregator, Intent, Outcome, SharedDecision, VoteTally,
};
pub use pipeline::{record_window, InferencePipeline, WindowError, WindowReport};
pub use separation::{FastIcaSeparator, ProcessedWindow, SeparationError, SourceSeparator};
pub use windowing::{Completion, Push, Window, WindowAccumulator};
