//! Session loops that drive acquisition through to dispatch.
//!
//! Both loops run on a dedicated worker thread, own the line source for the
//! whole session and poll the cancellation token on every read.

use crate::config::IntentLabels;
use crate::core::classifier::{Classifier, ClassifierError};
use crate::core::decision::{DecisionAggregator, Intent, Outcome, VoteTally};
use crate::core::separation::{ProcessedWindow, SeparationError, SourceSeparator};
use crate::core::windowing::{Push, Window, WindowAccumulator};
use crate::dispatch::Dispatcher;
use crate::serial::{ChannelMode, LineSource, SerialError};
use crate::stats::SharedStats;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive read failures tolerated before the session gives up.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 25;

/// A window that could not be turned into a vote.
#[derive(Debug, Error)]
pub enum WindowError {
    #[error(transparent)]
    Separation(#[from] SeparationError),
    #[error(transparent)]
    Classification(#[from] ClassifierError),
}

/// Summary of one processed inference window.
#[derive(Debug, Clone)]
pub struct WindowReport {
    pub samples: usize,
    pub labels: Vec<String>,
    pub tally: VoteTally,
    pub vote: Intent,
    pub outcome: Outcome,
}

/// Separator, classifier, aggregator and dispatcher for one inference session.
pub struct InferencePipeline {
    separator: Box<dyn SourceSeparator>,
    classifier: Box<dyn Classifier>,
    aggregator: DecisionAggregator,
    labels: IntentLabels,
    dispatcher: Dispatcher,
    stats: SharedStats,
}

impl InferencePipeline {
    pub fn new(
        separator: Box<dyn SourceSeparator>,
        classifier: Box<dyn Classifier>,
        cooldown: Duration,
        labels: IntentLabels,
        dispatcher: Dispatcher,
        stats: SharedStats,
    ) -> Self {
        let aggregator = DecisionAggregator::new(cooldown, dispatcher.shared_decision());
        Self {
            separator,
            classifier,
            aggregator,
            labels,
            dispatcher,
            stats,
        }
    }

    pub fn classifier_name(&self) -> &str {
        self.classifier.name()
    }

    /// Separate, classify, vote and gate one window.
    pub fn process_window(&mut self, window: Window) -> Result<WindowReport, WindowError> {
        let samples = window.len();
        let processed: ProcessedWindow = self.separator.separate(window)?;
        let labels = self.classifier.predict(&processed)?;

        let tally = VoteTally::from_labels(&labels, &self.labels);
        if tally.other > 0 {
            debug!(unknown = tally.other, "classifier emitted labels outside the intent pair");
        }
        let vote = tally.vote();
        let outcome = self.aggregator.observe(vote, Instant::now());

        if let Outcome::Accepted(decision) = &outcome {
            info!(
                intent = ?decision.intent,
                yes = tally.affirmative,
                no = tally.negative,
                "decision accepted"
            );
            self.dispatcher.on_decision_change(decision);
            self.stats.record_decision_dispatched();
        }

        Ok(WindowReport {
            samples,
            labels,
            tally,
            vote,
            outcome,
        })
    }

    /// Publish Stay if a Move is still standing from an earlier session.
    fn release(&mut self) {
        if let Some(decision) = self.aggregator.reset() {
            info!("standing move released");
            self.dispatcher.on_decision_change(&decision);
        }
    }

    /// Run until cancelled or the source fails.
    ///
    /// Windows that cannot be decomposed or classified are skipped. A window
    /// completed when the stop arrives is still processed; a partial window
    /// is discarded. The session always ends on Stay.
    pub fn run<F>(
        &mut self,
        source: &mut dyn LineSource,
        mut accumulator: WindowAccumulator,
        cancel: &CancellationToken,
        mut on_report: F,
    ) -> Result<(), SerialError>
    where
        F: FnMut(&WindowReport),
    {
        self.release();
        let result = self.read_windows(source, &mut accumulator, cancel, &mut on_report);
        self.release();
        result
    }

    fn read_windows<F>(
        &mut self,
        source: &mut dyn LineSource,
        accumulator: &mut WindowAccumulator,
        cancel: &CancellationToken,
        on_report: &mut F,
    ) -> Result<(), SerialError>
    where
        F: FnMut(&WindowReport),
    {
        let mut reader = TolerantReader::new(source);

        while !cancel.is_cancelled() {
            let Some(line) = reader.next_line()? else {
                continue;
            };
            match accumulator.push_line(&line) {
                Push::Pending => self.stats.record_line_read(),
                Push::Dropped => {
                    debug!(line = %line, "malformed line dropped");
                    self.stats.record_line_dropped();
                }
                Push::Complete(window) => {
                    self.stats.record_line_read();
                    self.stats.record_window_completed();
                    match self.process_window(window) {
                        Ok(report) => on_report(&report),
                        Err(e) => {
                            warn!(error = %e, "window skipped");
                            self.stats.record_window_skipped();
                        }
                    }
                }
            }
        }

        if accumulator.pending_samples() > 0 {
            debug!(samples = accumulator.pending_samples(), "partial window discarded");
        }
        Ok(())
    }
}

/// Read a time-bounded window for a recording session.
///
/// Returns `Ok(None)` when stopped or timed out before any sample arrived.
pub fn record_window(
    source: &mut dyn LineSource,
    mode: ChannelMode,
    duration: Duration,
    cancel: &CancellationToken,
    stats: &SharedStats,
) -> Result<Option<Window>, SerialError> {
    let mut accumulator = WindowAccumulator::recording(mode, duration);
    let mut reader = TolerantReader::new(source);

    while !cancel.is_cancelled() && !accumulator.is_complete() {
        let Some(line) = reader.next_line()? else {
            continue;
        };
        match accumulator.push_line(&line) {
            Push::Dropped => {
                debug!(line = %line, "malformed line dropped");
                stats.record_line_dropped();
            }
            Push::Pending => stats.record_line_read(),
            Push::Complete(window) => {
                stats.record_line_read();
                return Ok(Some(window));
            }
        }
    }

    let window = accumulator.seal();
    if let Some(window) = &window {
        info!(samples = window.len(), "recording window sealed");
    }
    Ok(window)
}

/// Skips transient read errors, failing only after a run of them.
struct TolerantReader<'a> {
    source: &'a mut dyn LineSource,
    consecutive_errors: u32,
}

impl<'a> TolerantReader<'a> {
    fn new(source: &'a mut dyn LineSource) -> Self {
        Self {
            source,
            consecutive_errors: 0,
        }
    }

    fn next_line(&mut self) -> Result<Option<String>, SerialError> {
        match self.source.read_line() {
            Ok(line) => {
                self.consecutive_errors = 0;
                Ok(line)
            }
            Err(SerialError::Read(e)) => {
                self.consecutive_errors += 1;
                debug!(error = %e, attempt = self.consecutive_errors, "transient read error");
                if self.consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    return Err(SerialError::Read(e));
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::core::classifier::SimulatedClassifier;
    use crate::core::decision::SharedDecision;
    use crate::core::separation::FastIcaSeparator;
    use crate::stats::create_shared_stats;
    use std::collections::VecDeque;

    /// Replays scripted lines, then cancels the session.
    struct Scripted {
        lines: VecDeque<Result<Option<String>, SerialError>>,
        cancel: CancellationToken,
    }

    impl LineSource for Scripted {
        fn read_line(&mut self) -> Result<Option<String>, SerialError> {
            match self.lines.pop_front() {
                Some(item) => item,
                None => {
                    self.cancel.cancel();
                    Ok(None)
                }
            }
        }
    }

    fn ramp(n: usize) -> Vec<Result<Option<String>, SerialError>> {
        (0..n)
            .map(|i| Ok(Some(((i * 37) % 1000).to_string())))
            .collect()
    }

    fn pipeline(prior: f64, stats: SharedStats) -> InferencePipeline {
        InferencePipeline::new(
            Box::new(FastIcaSeparator::default()),
            Box::new(SimulatedClassifier::new(IntentLabels::default(), prior, Some(3))),
            Duration::from_secs(1),
            IntentLabels::default(),
            Dispatcher::new(&DispatchConfig::default(), SharedDecision::new()),
            stats,
        )
    }

    #[test]
    fn test_windows_flow_to_decisions() {
        let cancel = CancellationToken::new();
        let mut lines = ramp(100);
        lines.insert(10, Ok(Some("abc".into())));
        lines.insert(20, Ok(None));
        lines.insert(30, Err(SerialError::Read(std::io::ErrorKind::Other.into())));
        let mut source = Scripted {
            lines: lines.into(),
            cancel: cancel.clone(),
        };

        let stats = create_shared_stats();
        let mut pipe = pipeline(1.0, stats.clone());
        let mut reports = Vec::new();
        pipe.run(
            &mut source,
            WindowAccumulator::inference(ChannelMode::Single, 50, Duration::from_millis(50)),
            &cancel,
            |r| reports.push(r.clone()),
        )
        .unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].samples, 50);
        assert_eq!(reports[0].vote, Intent::Move);
        assert!(matches!(reports[0].outcome, Outcome::Accepted(_)));
        // second window lands inside the cooldown
        assert_eq!(reports[1].outcome, Outcome::CooldownActive);

        let snapshot = stats.stats();
        assert_eq!(snapshot.lines_read, 100);
        assert_eq!(snapshot.lines_dropped, 1);
        assert_eq!(snapshot.windows_completed, 2);
        assert_eq!(snapshot.decisions_dispatched, 1);
    }

    #[test]
    fn test_disconnect_ends_session_with_error() {
        let cancel = CancellationToken::new();
        let mut lines = ramp(5);
        lines.push(Err(SerialError::Disconnected));
        let mut source = Scripted {
            lines: lines.into(),
            cancel: cancel.clone(),
        };
        let mut pipe = pipeline(0.0, create_shared_stats());
        let result = pipe.run(
            &mut source,
            WindowAccumulator::inference(ChannelMode::Single, 50, Duration::from_millis(50)),
            &cancel,
            |_| {},
        );
        assert!(matches!(result, Err(SerialError::Disconnected)));
    }

    #[test]
    fn test_persistent_read_errors_are_fatal() {
        let cancel = CancellationToken::new();
        let lines: Vec<_> = (0..MAX_CONSECUTIVE_READ_ERRORS)
            .map(|_| Err(SerialError::Read(std::io::ErrorKind::BrokenPipe.into())))
            .collect();
        let mut source = Scripted {
            lines: lines.into(),
            cancel: cancel.clone(),
        };
        let mut pipe = pipeline(0.0, create_shared_stats());
        let result = pipe.run(
            &mut source,
            WindowAccumulator::inference(ChannelMode::Single, 50, Duration::from_millis(50)),
            &cancel,
            |_| {},
        );
        assert!(matches!(result, Err(SerialError::Read(_))));
    }

    /// Replays lines and requests a stop together with the last one.
    struct StopWithLast {
        lines: VecDeque<String>,
        cancel: CancellationToken,
    }

    impl LineSource for StopWithLast {
        fn read_line(&mut self) -> Result<Option<String>, SerialError> {
            let line = self.lines.pop_front();
            if self.lines.is_empty() {
                self.cancel.cancel();
            }
            Ok(line)
        }
    }

    #[test]
    fn test_window_completed_at_stop_is_processed() {
        let cancel = CancellationToken::new();
        let mut source = StopWithLast {
            lines: (0..50).map(|i| ((i * 37) % 1000).to_string()).collect(),
            cancel: cancel.clone(),
        };
        let mut pipe = pipeline(1.0, create_shared_stats());
        let mut reports = Vec::new();
        pipe.run(
            &mut source,
            WindowAccumulator::inference(ChannelMode::Single, 50, Duration::from_millis(50)),
            &cancel,
            |r| reports.push(r.clone()),
        )
        .unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].samples, 50);
        assert_eq!(reports[0].vote, Intent::Move);
    }

    #[test]
    fn test_session_end_releases_standing_move() {
        let cancel = CancellationToken::new();
        let mut source = Scripted {
            lines: ramp(50).into(),
            cancel: cancel.clone(),
        };
        let mut pipe = pipeline(1.0, create_shared_stats());
        let mut events = pipe.dispatcher.subscribe();
        pipe.run(
            &mut source,
            WindowAccumulator::inference(ChannelMode::Single, 50, Duration::from_millis(50)),
            &cancel,
            |_| {},
        )
        .unwrap();

        assert_eq!(events.try_recv().unwrap().intent, Intent::Move);
        let released = events.try_recv().unwrap();
        assert_eq!(released.intent, Intent::Stay);
        assert_eq!(released.command, "STAY");
        assert!(events.try_recv().is_err());
        assert_eq!(pipe.dispatcher.current_decision().intent, Intent::Stay);
    }

    #[test]
    fn test_session_start_releases_move_left_by_another_owner() {
        let shared = SharedDecision::new();
        let mut previous = DecisionAggregator::new(Duration::from_secs(1), shared.clone());
        previous.observe(Intent::Move, Instant::now());

        let dispatcher = Dispatcher::new(&DispatchConfig::default(), shared);
        let mut events = dispatcher.subscribe();
        let mut pipe = InferencePipeline::new(
            Box::new(FastIcaSeparator::default()),
            Box::new(SimulatedClassifier::new(IntentLabels::default(), 0.0, Some(3))),
            Duration::from_secs(1),
            IntentLabels::default(),
            dispatcher.clone(),
            create_shared_stats(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut source = Scripted {
            lines: VecDeque::new(),
            cancel: cancel.clone(),
        };
        pipe.run(
            &mut source,
            WindowAccumulator::inference(ChannelMode::Single, 50, Duration::from_millis(50)),
            &cancel,
            |_| {},
        )
        .unwrap();

        assert_eq!(events.try_recv().unwrap().intent, Intent::Stay);
        assert!(events.try_recv().is_err());
        assert_eq!(dispatcher.current_decision().intent, Intent::Stay);
    }

    #[test]
    fn test_record_window_stopped_before_data() {
        let cancel = CancellationToken::new();
        let mut source = Scripted {
            lines: VecDeque::new(),
            cancel: cancel.clone(),
        };
        let window = record_window(
            &mut source,
            ChannelMode::Single,
            Duration::from_secs(15),
            &cancel,
            &create_shared_stats(),
        )
        .unwrap();
        assert!(window.is_none());
    }

    #[test]
    fn test_record_window_keeps_partial_data_on_stop() {
        let cancel = CancellationToken::new();
        let mut source = Scripted {
            lines: ramp(12).into(),
            cancel: cancel.clone(),
        };
        let window = record_window(
            &mut source,
            ChannelMode::Single,
            Duration::from_secs(15),
            &cancel,
            &create_shared_stats(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(window.len(), 12);
        assert_eq!(window.duration, Duration::from_secs(15));
    }
}
