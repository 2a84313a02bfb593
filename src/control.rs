//! Transport-agnostic control plane.
//!
//! Owns at most one acquisition session at a time (recording or inference),
//! each on its own worker thread. Workers report through a bounded status
//! queue that pollers drain one update at a time.

use crate::config::{ClassifierMode, Config};
use crate::core::classifier::{build_classifier, ClassifierError};
use crate::core::decision::{Decision, Intent, Outcome, SharedDecision};
use crate::core::pipeline::{record_window, InferencePipeline, WindowReport};
use crate::core::separation::{FastIcaSeparator, SourceSeparator};
use crate::core::windowing::WindowAccumulator;
use crate::dispatch::Dispatcher;
use crate::recording::{recording_path, write_labeled_window, LabeledWindow};
use crate::serial::{ChannelMode, SerialSource, SharedSignalSource, SimulatedSource};
use crate::stats::{create_shared_stats_with_persistence, SharedStats};
use crate::training::{train_from_recordings, TrainingError, TrainingReport};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Updates buffered before the oldest is discarded.
const STATUS_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Recording,
    Inference,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKind::Recording => write!(f, "recording"),
            SessionKind::Inference => write!(f, "inference"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("a {0} session is already running")]
    SessionActive(SessionKind),
    #[error("no {0} session is running")]
    NoActiveSession(SessionKind),
    #[error("invalid label '{label}', expected one of {allowed:?}")]
    InvalidLabel { label: String, allowed: Vec<String> },
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error(transparent)]
    Training(#[from] TrainingError),
    #[error("failed to start worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// One entry from the status queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusUpdate {
    /// Nothing new since the last poll
    Waiting,
    /// A recording finished and was saved
    Success {
        message: String,
        label: String,
        file: String,
        samples: usize,
    },
    /// An inference window was processed
    Prediction {
        /// Command token for the current decision
        prediction: String,
        intent: Intent,
        affirmative: usize,
        negative: usize,
        accepted: bool,
    },
    /// A session ended with an error
    Error { message: String },
}

/// Description of the running session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub kind: SessionKind,
    pub started_at: DateTime<Utc>,
    pub label: Option<String>,
}

struct ActiveSession {
    info: SessionInfo,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    /// Set before the final status is published.
    done: Arc<AtomicBool>,
}

impl ActiveSession {
    fn is_running(&self) -> bool {
        !self.done.load(Ordering::Acquire) && !self.handle.is_finished()
    }
}

struct Inner {
    config: Config,
    source: SharedSignalSource,
    dispatcher: Dispatcher,
    stats: SharedStats,
    status_tx: Sender<StatusUpdate>,
    status_rx: Receiver<StatusUpdate>,
    session: Mutex<Option<ActiveSession>>,
}

/// Command/query API over recording, training and inference.
#[derive(Clone)]
pub struct ControlPlane {
    inner: Arc<Inner>,
}

impl ControlPlane {
    pub fn new(
        config: Config,
        source: SharedSignalSource,
        dispatcher: Dispatcher,
        stats: SharedStats,
    ) -> Self {
        let (status_tx, status_rx) = bounded(STATUS_QUEUE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                dispatcher,
                stats,
                status_tx,
                status_rx,
                session: Mutex::new(None),
            }),
        }
    }

    /// Wire up the standard collaborators from configuration.
    pub fn from_config(config: Config, simulate: bool) -> Self {
        let source: SharedSignalSource = if simulate {
            Arc::new(
                SimulatedSource::new(config.serial.channels, config.acquisition.sample_rate)
                    .real_time(),
            )
        } else {
            Arc::new(SerialSource::from_config(&config.serial))
        };
        let stats = create_shared_stats_with_persistence(config.data_path.join("stats.json"));
        let dispatcher = Dispatcher::new(&config.dispatch, SharedDecision::new());
        Self::new(config, source, dispatcher, stats)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn stats(&self) -> &SharedStats {
        &self.inner.stats
    }

    /// Latest accepted decision.
    pub fn current_decision(&self) -> Decision {
        self.inner.dispatcher.current_decision()
    }

    pub fn active_session(&self) -> Option<SessionInfo> {
        let session = self.inner.session.lock();
        session
            .as_ref()
            .filter(|s| s.is_running())
            .map(|s| s.info.clone())
    }

    /// Next queued update, or `Waiting` when the queue is empty.
    pub fn poll_status(&self) -> StatusUpdate {
        self.inner
            .status_rx
            .try_recv()
            .unwrap_or(StatusUpdate::Waiting)
    }

    /// Begin a duration-bound recording for `label`.
    pub fn start_recording(&self, label: &str) -> Result<Uuid, ControlError> {
        let labels = &self.inner.config.classifier.labels;
        if !labels.contains(label) {
            return Err(ControlError::InvalidLabel {
                label: label.to_string(),
                allowed: labels.all().iter().map(|l| l.to_string()).collect(),
            });
        }

        let label = label.to_string();
        self.spawn_session(SessionKind::Recording, Some(label.clone()), move |inner, cancel| {
            recording_worker(&inner, &label, &cancel)
        })
    }

    /// Stop the recording early; whatever was captured is still saved.
    pub fn stop_recording(&self) -> Result<(), ControlError> {
        self.stop_session(SessionKind::Recording)
    }

    /// Begin continuous inference.
    ///
    /// The classifier is constructed before any serial read, so a missing
    /// model fails here rather than in the worker.
    pub fn start_inference(&self) -> Result<Uuid, ControlError> {
        let config = &self.inner.config;
        let classifier =
            build_classifier(&config.classifier, &config.models_path, config.serial.channels)?;
        // the slot check happens under the lock in spawn_session
        self.spawn_session(SessionKind::Inference, None, move |inner, cancel| {
            let separator: Box<dyn SourceSeparator> = Box::new(FastIcaSeparator::from_config(
                &inner.config.separation,
                &inner.config.acquisition,
            ));
            let pipeline = InferencePipeline::new(
                separator,
                classifier,
                inner.config.decision.cooldown,
                inner.config.classifier.labels.clone(),
                inner.dispatcher.clone(),
                inner.stats.clone(),
            );
            inference_worker(&inner, pipeline, &cancel)
        })
    }

    pub fn stop_inference(&self) -> Result<(), ControlError> {
        self.stop_session(SessionKind::Inference)
    }

    /// Train a model from the recordings on disk.
    pub fn train(&self, name: Option<&str>) -> Result<TrainingReport, ControlError> {
        let config = &self.inner.config;
        let name = match (name, &config.classifier.mode) {
            (Some(name), _) => name.to_string(),
            (None, ClassifierMode::Trained { model }) => model.clone(),
            (None, ClassifierMode::Simulated { .. }) => "nbest".to_string(),
        };
        Ok(train_from_recordings(config, &name)?)
    }

    /// Stop whatever session is running and wait for it.
    pub fn shutdown(&self) {
        let session = self.inner.session.lock().take();
        if let Some(session) = session {
            session.cancel.cancel();
            join_worker(session);
        }
        if let Err(e) = self.inner.stats.save() {
            warn!(error = %e, "could not persist acquisition stats");
        }
    }

    fn spawn_session<F>(
        &self,
        kind: SessionKind,
        label: Option<String>,
        work: F,
    ) -> Result<Uuid, ControlError>
    where
        F: FnOnce(Arc<Inner>, CancellationToken) -> Option<StatusUpdate> + Send + 'static,
    {
        let mut slot = self.inner.session.lock();
        if let Some(active) = slot.as_ref() {
            if active.is_running() {
                return Err(ControlError::SessionActive(active.info.kind));
            }
        }
        if let Some(finished) = slot.take() {
            join_worker(finished);
        }

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let done = Arc::new(AtomicBool::new(false));
        let inner = self.inner.clone();
        let worker_cancel = cancel.clone();
        let worker_done = done.clone();
        let handle = thread::Builder::new()
            .name(format!("emg-{kind}"))
            .spawn(move || {
                let final_status = panic::catch_unwind(AssertUnwindSafe(|| {
                    work(inner.clone(), worker_cancel)
                }))
                .unwrap_or_else(|_| failure(format!("{kind} session stopped unexpectedly")));
                worker_done.store(true, Ordering::Release);
                if let Some(update) = final_status {
                    inner.push_status(update);
                }
            })?;

        info!(session = %id, %kind, "session started");
        *slot = Some(ActiveSession {
            info: SessionInfo {
                id,
                kind,
                started_at: Utc::now(),
                label,
            },
            cancel,
            handle,
            done,
        });
        Ok(id)
    }

    fn stop_session(&self, kind: SessionKind) -> Result<(), ControlError> {
        let session = {
            let mut slot = self.inner.session.lock();
            match slot.as_ref() {
                Some(active) if active.info.kind == kind => slot.take(),
                _ => None,
            }
        };
        let session = session.ok_or(ControlError::NoActiveSession(kind))?;
        session.cancel.cancel();
        join_worker(session);
        Ok(())
    }
}

fn join_worker(session: ActiveSession) {
    let id = session.info.id;
    let kind = session.info.kind;
    if session.handle.join().is_err() {
        error!(session = %id, %kind, "session worker panicked");
    } else {
        info!(session = %id, %kind, "session stopped");
    }
}

impl Inner {
    fn push_status(&self, update: StatusUpdate) {
        if let Err(TrySendError::Full(update)) = self.status_tx.try_send(update) {
            let _ = self.status_rx.try_recv();
            let _ = self.status_tx.try_send(update);
        }
    }
}

fn failure(message: String) -> Option<StatusUpdate> {
    error!(%message, "session failed");
    Some(StatusUpdate::Error { message })
}

fn recording_worker(
    inner: &Inner,
    label: &str,
    cancel: &CancellationToken,
) -> Option<StatusUpdate> {
    let config = &inner.config;
    let mode: ChannelMode = config.serial.channels;

    let window = {
        let mut source = match inner.source.connect() {
            Ok(source) => source,
            Err(e) => return failure(e.to_string()),
        };
        info!(source = %inner.source.describe(), label, "recording");
        match record_window(
            &mut *source,
            mode,
            config.acquisition.recording_duration,
            cancel,
            &inner.stats,
        ) {
            Ok(Some(window)) => window,
            Ok(None) => return failure("No data recorded".to_string()),
            Err(e) => return failure(e.to_string()),
        }
        // connection dropped here, before the CSV is written
    };

    let samples = window.len();
    let separator = FastIcaSeparator::from_config(&config.separation, &config.acquisition);
    let processed = match separator.separate(window) {
        Ok(processed) => processed,
        Err(e) => return failure(format!("Recording could not be processed: {e}")),
    };

    let path = recording_path(&config.data_path, &config.recording.file_prefix, label);
    match write_labeled_window(&path, &LabeledWindow::new(processed, label)) {
        Ok(_) => {
            inner.stats.record_recording_saved();
            if let Err(e) = inner.stats.save() {
                warn!(error = %e, "could not persist acquisition stats");
            }
            Some(StatusUpdate::Success {
                message: format!("Recorded {samples} samples for {label}"),
                label: label.to_string(),
                file: path.display().to_string(),
                samples,
            })
        }
        Err(e) => failure(format!("Failed to save recording: {e}")),
    }
}

fn inference_worker(
    inner: &Inner,
    mut pipeline: InferencePipeline,
    cancel: &CancellationToken,
) -> Option<StatusUpdate> {
    let config = &inner.config;
    let mut source = match inner.source.connect() {
        Ok(source) => source,
        Err(e) => return failure(e.to_string()),
    };
    info!(
        source = %inner.source.describe(),
        classifier = pipeline.classifier_name(),
        "inference running"
    );

    let accumulator = WindowAccumulator::inference(
        config.serial.channels,
        config.acquisition.sample_rate,
        config.acquisition.inference_window(),
    );
    let result = pipeline.run(&mut *source, accumulator, cancel, |report| {
        inner.push_status(prediction_update(&inner.dispatcher, report));
    });
    drop(source);

    if let Err(e) = inner.stats.save() {
        warn!(error = %e, "could not persist acquisition stats");
    }
    result.err().and_then(|e| failure(e.to_string()))
}

fn prediction_update(dispatcher: &Dispatcher, report: &WindowReport) -> StatusUpdate {
    let intent = dispatcher.current_decision().intent;
    StatusUpdate::Prediction {
        prediction: dispatcher.command_for(intent).to_string(),
        intent,
        affirmative: report.tally.affirmative,
        negative: report.tally.negative,
        accepted: matches!(report.outcome, Outcome::Accepted(_)),
    }
}
