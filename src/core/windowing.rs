//! Window accumulation for raw serial samples.
//!
//! Samples are collected into windows that complete either when a time
//! budget expires (recording) or when a target sample count is reached
//! (inference). A completed window is moved out and a fresh buffer started.

use crate::serial::types::{parse_line, ChannelMode, Sample};
use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// A sealed batch of consecutive samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Window {
    /// Wall-clock time the window was opened
    pub start: DateTime<Utc>,
    /// Nominal duration used to synthesize sample timestamps
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    /// Channel layout of every sample
    pub mode: ChannelMode,
    /// Samples in arrival order
    pub samples: Vec<Sample>,
}

impl Window {
    pub fn new(mode: ChannelMode, duration: Duration) -> Self {
        Self {
            start: Utc::now(),
            duration,
            mode,
            samples: Vec::new(),
        }
    }

    /// Build a window from existing samples.
    pub fn from_samples(mode: ChannelMode, duration: Duration, samples: Vec<Sample>) -> Self {
        Self {
            start: Utc::now(),
            duration,
            mode,
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn channel_count(&self) -> usize {
        self.mode.count()
    }

    /// Readings of one channel as floats.
    pub fn channel(&self, index: usize) -> Vec<f64> {
        self.samples
            .iter()
            .map(|s| s.channel(index).unwrap_or_default() as f64)
            .collect()
    }

    /// Evenly spaced timestamps from 0 to the nominal duration, inclusive.
    pub fn timestamps(&self) -> Vec<f64> {
        linspace(0.0, self.duration.as_secs_f64(), self.samples.len())
    }

    /// Samples as an N×C matrix.
    pub fn to_matrix(&self) -> Array2<f64> {
        let channels = self.channel_count();
        Array2::from_shape_fn((self.samples.len(), channels), |(i, j)| {
            self.samples[i].channel(j).unwrap_or_default() as f64
        })
    }
}

/// `n` evenly spaced points over `[start, end]`.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// When a window is considered complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Elapsed wall-clock time since the window opened
    Elapsed(Duration),
    /// Number of accepted samples
    SampleCount(usize),
}

/// Result of pushing into the accumulator.
#[derive(Debug)]
pub enum Push {
    /// The window needs more samples
    Pending,
    /// The line was malformed and ignored
    Dropped,
    /// The window is complete and has been handed over
    Complete(Window),
}

/// Collects samples into windows.
pub struct WindowAccumulator {
    mode: ChannelMode,
    completion: Completion,
    /// Duration stamped onto sealed windows
    nominal_duration: Duration,
    current: Window,
    opened_at: Instant,
    dropped_lines: u64,
}

impl WindowAccumulator {
    pub fn new(mode: ChannelMode, completion: Completion, nominal_duration: Duration) -> Self {
        Self {
            mode,
            completion,
            nominal_duration,
            current: Window::new(mode, nominal_duration),
            opened_at: Instant::now(),
            dropped_lines: 0,
        }
    }

    /// Time-bounded accumulator used by recording sessions.
    pub fn recording(mode: ChannelMode, duration: Duration) -> Self {
        Self::new(mode, Completion::Elapsed(duration), duration)
    }

    /// Count-bounded accumulator used by inference: one second of samples.
    pub fn inference(mode: ChannelMode, sample_rate: usize, window: Duration) -> Self {
        Self::new(mode, Completion::SampleCount(sample_rate.max(1)), window)
    }

    /// Add a sample, handing the window over if it is now complete.
    pub fn push(&mut self, sample: Sample) -> Push {
        if sample.mode() != self.mode {
            self.dropped_lines += 1;
            return Push::Dropped;
        }
        self.current.samples.push(sample);
        if self.is_complete() {
            match self.seal() {
                Some(window) => Push::Complete(window),
                None => Push::Pending,
            }
        } else {
            Push::Pending
        }
    }

    /// Parse a serial line and push it. Malformed lines never advance the count.
    pub fn push_line(&mut self, line: &str) -> Push {
        match parse_line(line, self.mode) {
            Some(sample) => self.push(sample),
            None => {
                self.dropped_lines += 1;
                Push::Dropped
            }
        }
    }

    /// Whether the current window has met its completion predicate.
    pub fn is_complete(&self) -> bool {
        match self.completion {
            Completion::Elapsed(budget) => self.opened_at.elapsed() >= budget,
            Completion::SampleCount(target) => self.current.samples.len() >= target,
        }
    }

    /// Take the current window and start a fresh one.
    ///
    /// Returns `None` when no sample arrived, so callers never see an empty window.
    pub fn seal(&mut self) -> Option<Window> {
        let fresh = Window::new(self.mode, self.nominal_duration);
        let window = std::mem::replace(&mut self.current, fresh);
        self.opened_at = Instant::now();
        if window.is_empty() {
            None
        } else {
            Some(window)
        }
    }

    /// Samples in the in-progress window.
    pub fn pending_samples(&self) -> usize {
        self.current.samples.len()
    }

    /// Lines dropped since the accumulator was created.
    pub fn dropped_lines(&self) -> u64 {
        self.dropped_lines
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_bound_window_completes_at_target() {
        let mut acc =
            WindowAccumulator::inference(ChannelMode::Single, 5, Duration::from_secs(1));
        for i in 0..4 {
            assert!(matches!(acc.push(Sample::Single(i)), Push::Pending));
        }
        match acc.push(Sample::Single(4)) {
            Push::Complete(window) => {
                assert_eq!(window.len(), 5);
                assert_eq!(window.channel(0), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
            }
            other => panic!("expected complete window, got {other:?}"),
        }
        // a fresh buffer was started
        assert_eq!(acc.pending_samples(), 0);
    }

    #[test]
    fn test_malformed_lines_do_not_advance_count() {
        let mut acc =
            WindowAccumulator::inference(ChannelMode::Single, 3, Duration::from_secs(1));
        assert!(matches!(acc.push_line("100"), Push::Pending));
        for line in ["abc", "1,2,3", ""] {
            assert!(matches!(acc.push_line(line), Push::Dropped));
        }
        assert_eq!(acc.pending_samples(), 1);
        assert_eq!(acc.dropped_lines(), 3);
    }

    #[test]
    fn test_dual_channel_lines() {
        let mut acc = WindowAccumulator::inference(ChannelMode::Dual, 2, Duration::from_secs(1));
        assert!(matches!(acc.push_line("512,600"), Push::Pending));
        assert!(matches!(acc.push_line("512"), Push::Dropped));
        match acc.push_line("10,20") {
            Push::Complete(window) => {
                assert_eq!(window.channel(0), vec![512.0, 10.0]);
                assert_eq!(window.channel(1), vec![600.0, 20.0]);
                assert_eq!(window.to_matrix().shape(), &[2, 2]);
            }
            other => panic!("expected complete window, got {other:?}"),
        }
    }

    #[test]
    fn test_time_bound_window() {
        let mut acc =
            WindowAccumulator::recording(ChannelMode::Single, Duration::from_millis(30));
        assert!(matches!(acc.push(Sample::Single(1)), Push::Pending));
        assert!(!acc.is_complete());
        std::thread::sleep(Duration::from_millis(40));
        assert!(acc.is_complete());
        let window = acc.seal().expect("window has one sample");
        assert_eq!(window.len(), 1);
        assert_eq!(window.duration, Duration::from_millis(30));
    }

    #[test]
    fn test_seal_without_samples_reports_no_data() {
        let mut acc = WindowAccumulator::recording(ChannelMode::Single, Duration::from_secs(15));
        assert!(acc.seal().is_none());
    }

    #[test]
    fn test_timestamps_span_nominal_duration() {
        let window = Window::from_samples(
            ChannelMode::Single,
            Duration::from_secs(15),
            (0..4).map(Sample::Single).collect(),
        );
        assert_eq!(window.timestamps(), vec![0.0, 5.0, 10.0, 15.0]);
        assert_eq!(linspace(0.0, 1.0, 1), vec![0.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }
}
