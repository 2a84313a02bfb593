//! Acquisition statistics for the EMG Intent Agent.
//!
//! Cumulative counters describing what the pipeline has read, dropped and
//! decided, persisted across runs so `emg-intent status` can report them.

pub mod counters;

pub use counters::{
    create_shared_stats, create_shared_stats_with_persistence, AcquisitionStats, SharedStats,
    StatsSnapshot,
};
