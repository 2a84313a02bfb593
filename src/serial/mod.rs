//! Serial acquisition for the EMG Intent Agent.
//!
//! This module owns everything between the sensor board and the window
//! accumulator: the line protocol, port discovery, the reconnect policy and
//! a synthetic source for running without hardware.

pub mod discovery;
pub mod port;
pub mod simulated;
pub mod types;

pub use discovery::{default_port, list_ports, resolve_port};
pub use port::{
    Connection, LineReader, LineSource, PortBackend, PortSettings, RetryPolicy, SerialChannel,
    SerialError, SystemBackend,
};
pub use simulated::SimulatedSignal;
pub use types::{parse_line, ChannelMode, Sample};

use crate::config::SerialConfig;
use std::sync::Arc;

/// Something that can hand out a fresh line source for a session.
pub trait SignalSource: Send + Sync {
    /// Human-readable description for logs and status messages.
    fn describe(&self) -> String;

    /// Connect to the signal. Failures are session-fatal.
    fn connect(&self) -> Result<Box<dyn LineSource>, SerialError>;
}

/// Sessions read from a real serial port.
pub struct SerialSource {
    channel: SerialChannel,
    port: String,
    settings: PortSettings,
}

impl SerialSource {
    pub fn new(channel: SerialChannel, port: impl Into<String>, settings: PortSettings) -> Self {
        Self {
            channel,
            port: port.into(),
            settings,
        }
    }

    /// Build from configuration, resolving the port now.
    pub fn from_config(config: &SerialConfig) -> Self {
        Self::new(
            SerialChannel::system(config),
            resolve_port(config.port.as_deref()),
            PortSettings::from(config),
        )
    }

    pub fn port(&self) -> &str {
        &self.port
    }
}

impl SignalSource for SerialSource {
    fn describe(&self) -> String {
        format!("serial port {} at {} baud", self.port, self.settings.baud_rate)
    }

    fn connect(&self) -> Result<Box<dyn LineSource>, SerialError> {
        let connection = self.channel.open(&self.port, &self.settings)?;
        Ok(Box::new(connection))
    }
}

/// Sessions read from [`SimulatedSignal`].
pub struct SimulatedSource {
    mode: ChannelMode,
    sample_rate: usize,
    pace: Option<std::time::Duration>,
    seed: Option<u64>,
}

impl SimulatedSource {
    pub fn new(mode: ChannelMode, sample_rate: usize) -> Self {
        Self {
            mode,
            sample_rate,
            pace: None,
            seed: None,
        }
    }

    /// Emit samples at the configured rate instead of as fast as possible.
    pub fn real_time(mut self) -> Self {
        self.pace = Some(std::time::Duration::from_secs_f64(
            1.0 / self.sample_rate.max(1) as f64,
        ));
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl SignalSource for SimulatedSource {
    fn describe(&self) -> String {
        format!("simulated {:?} signal at {} Hz", self.mode, self.sample_rate)
    }

    fn connect(&self) -> Result<Box<dyn LineSource>, SerialError> {
        let mut signal = SimulatedSignal::new(self.mode, self.sample_rate);
        if let Some(seed) = self.seed {
            signal = signal.with_seed(seed);
        }
        if let Some(pace) = self.pace {
            signal = signal.paced(pace);
        }
        Ok(Box::new(signal))
    }
}

/// Shared handle to a signal source.
pub type SharedSignalSource = Arc<dyn SignalSource>;
