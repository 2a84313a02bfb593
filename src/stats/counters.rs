//! Atomic acquisition counters with optional JSON persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Counters for the current process, seeded from disk when persisted.
#[derive(Debug)]
pub struct AcquisitionStats {
    /// Serial lines parsed into samples
    lines_read: AtomicU64,
    /// Malformed lines skipped
    lines_dropped: AtomicU64,
    /// Windows handed to the separator
    windows_completed: AtomicU64,
    /// Windows skipped because decomposition or classification failed
    windows_skipped: AtomicU64,
    /// Accepted decisions sent to the dispatcher
    decisions_dispatched: AtomicU64,
    /// Labeled recordings written to disk
    recordings_saved: AtomicU64,
    session_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl AcquisitionStats {
    pub fn new() -> Self {
        Self {
            lines_read: AtomicU64::new(0),
            lines_dropped: AtomicU64::new(0),
            windows_completed: AtomicU64::new(0),
            windows_skipped: AtomicU64::new(0),
            decisions_dispatched: AtomicU64::new(0),
            recordings_saved: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create counters backed by a JSON file, loading previous totals.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.persist_path = Some(path);

        if let Err(e) = stats.load() {
            warn!(error = %e, "could not load previous acquisition stats");
        }

        stats
    }

    pub fn record_line_read(&self) {
        self.lines_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_line_dropped(&self) {
        self.lines_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_window_completed(&self) {
        self.windows_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_window_skipped(&self) {
        self.windows_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decision_dispatched(&self) {
        self.decisions_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recording_saved(&self) {
        self.recordings_saved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            lines_read: self.lines_read.load(Ordering::Relaxed),
            lines_dropped: self.lines_dropped.load(Ordering::Relaxed),
            windows_completed: self.windows_completed.load(Ordering::Relaxed),
            windows_skipped: self.windows_skipped.load(Ordering::Relaxed),
            decisions_dispatched: self.decisions_dispatched.load(Ordering::Relaxed),
            recordings_saved: self.recordings_saved.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Human-readable summary for the CLI.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Acquisition Statistics:\n\
             - Lines read: {}\n\
             - Lines dropped: {}\n\
             - Windows completed: {}\n\
             - Windows skipped: {}\n\
             - Decisions dispatched: {}\n\
             - Recordings saved: {}\n\
             - Session duration: {} seconds",
            stats.lines_read,
            stats.lines_dropped,
            stats.windows_completed,
            stats.windows_skipped,
            stats.decisions_dispatched,
            stats.recordings_saved,
            stats.session_duration_secs
        )
    }

    /// Write totals to the persistence file, if any.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedStats {
                lines_read: stats.lines_read,
                lines_dropped: stats.lines_dropped,
                windows_completed: stats.windows_completed,
                windows_skipped: stats.windows_skipped,
                decisions_dispatched: stats.decisions_dispatched,
                recordings_saved: stats.recordings_saved,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.lines_read.store(persisted.lines_read, Ordering::Relaxed);
                self.lines_dropped
                    .store(persisted.lines_dropped, Ordering::Relaxed);
                self.windows_completed
                    .store(persisted.windows_completed, Ordering::Relaxed);
                self.windows_skipped
                    .store(persisted.windows_skipped, Ordering::Relaxed);
                self.decisions_dispatched
                    .store(persisted.decisions_dispatched, Ordering::Relaxed);
                self.recordings_saved
                    .store(persisted.recordings_saved, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    pub fn reset(&self) {
        for counter in [
            &self.lines_read,
            &self.lines_dropped,
            &self.windows_completed,
            &self.windows_skipped,
            &self.decisions_dispatched,
            &self.recordings_saved,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for AcquisitionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub lines_read: u64,
    pub lines_dropped: u64,
    pub windows_completed: u64,
    pub windows_skipped: u64,
    pub decisions_dispatched: u64,
    pub recordings_saved: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    lines_read: u64,
    lines_dropped: u64,
    windows_completed: u64,
    windows_skipped: u64,
    decisions_dispatched: u64,
    #[serde(default)]
    recordings_saved: u64,
    last_updated: DateTime<Utc>,
}

pub type SharedStats = Arc<AcquisitionStats>;

pub fn create_shared_stats() -> SharedStats {
    Arc::new(AcquisitionStats::new())
}

pub fn create_shared_stats_with_persistence(path: PathBuf) -> SharedStats {
    Arc::new(AcquisitionStats::with_persistence(path))
}
