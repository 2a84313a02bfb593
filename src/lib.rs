//! EMG Intent Agent - real-time muscle-signal intent classification.
//!
//! This library samples a surface EMG sensor over a serial line, separates
//! each window into independent components, classifies the result into one
//! of two intents and drives a remote actuator through a rate-limited,
//! hysteresis-gated dispatcher.
//!
//! # Guarantees
//!
//! - **Cooldown**: accepted decisions are at least the configured cooldown apart
//! - **Hysteresis**: a Move is never followed by another Move without a Stay
//! - **Port hygiene**: every serial connection is released on every exit path
//! - **Non-blocking dispatch**: a slow actuator never stalls acquisition
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         EMG Intent Agent                          │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐             │
//! │  │   Serial    │──▶│  Windowing  │──▶│  FastICA    │             │
//! │  │  (retry)    │   │  (1s / 15s) │   │ (separate)  │             │
//! │  └─────────────┘   └─────────────┘   └─────────────┘             │
//! │                                             │                     │
//! │                                             ▼                     │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐             │
//! │  │ Dispatcher  │◀──│  Decision   │◀──│ Classifier  │             │
//! │  │ (broadcast) │   │ (cooldown)  │   │  (labels)   │             │
//! │  └─────────────┘   └─────────────┘   └─────────────┘             │
//! │         │                                                         │
//! │         ▼                                                         │
//! │   actuators, /ws subscribers, /api/prediction                     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use emg_intent_agent::{config::Config, control::ControlPlane};
//!
//! let mut config = Config::default();
//! config.classifier.mode = emg_intent_agent::config::ClassifierMode::Simulated {
//!     affirmative_prior: 0.6,
//!     seed: None,
//! };
//!
//! // Simulated signal, no hardware required
//! let control = ControlPlane::from_config(config, true);
//! control.start_inference().expect("Failed to start inference");
//!
//! // Status updates can be drained with control.poll_status()
//! ```

pub mod config;
pub mod control;
pub mod core;
pub mod dispatch;
pub mod recording;
pub mod serial;
pub mod stats;
pub mod training;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use config::{ClassifierMode, Config, IntentLabels};
pub use control::{ControlError, ControlPlane, SessionKind, StatusUpdate};
pub use core::{
    Classifier, Decision, DecisionAggregator, FastIcaSeparator, InferencePipeline, Intent,
    ProcessedWindow, SourceSeparator, Window, WindowAccumulator,
};
pub use dispatch::{spawn_actuator_links, DecisionEvent, Dispatcher};
pub use serial::{ChannelMode, Sample, SerialChannel, SerialError, SignalSource};
pub use stats::{AcquisitionStats, SharedStats, StatsSnapshot};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Operating notice shown before a session starts.
pub const SAFETY_NOTICE: &str = r#"
╔══════════════════════════════════════════════════════════════════╗
║               EMG INTENT AGENT - OPERATING NOTICE                ║
╠══════════════════════════════════════════════════════════════════╣
║                                                                  ║
║  This agent sends MOVE / STAY commands to a connected actuator.  ║
║                                                                  ║
║  ✓ BEFORE STARTING INFERENCE:                                    ║
║    • Keep the actuator in a clear, supervised area               ║
║    • Record and train with the person who will operate it        ║
║    • Confirm the stop command reaches the actuator               ║
║                                                                  ║
║  ✗ THE AGENT DOES NOT:                                           ║
║    • Validate signal quality beyond dropping malformed lines     ║
║    • Guarantee hard real-time response                           ║
║    • Retry commands an actuator failed to receive                ║
║                                                                  ║
║  Decisions are rate limited to one per cooldown period.          ║
║                                                                  ║
║  You can view acquisition statistics anytime with:               ║
║    emg-intent status                                             ║
║                                                                  ║
╚══════════════════════════════════════════════════════════════════╝
"#;
