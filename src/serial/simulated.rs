//! Synthetic EMG source for running the pipeline without hardware.
//!
//! Produces a 10 Hz sine with Gaussian noise, scaled into the 10-bit ADC
//! range the board reports, formatted exactly like serial lines.

use crate::serial::port::{LineSource, SerialError};
use crate::serial::types::ChannelMode;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::thread;
use std::time::Duration;

const BASELINE: f64 = 512.0;
const AMPLITUDE: f64 = 200.0;
const NOISE_STD: f64 = 0.5;

/// A [`LineSource`] emitting synthetic samples.
pub struct SimulatedSignal {
    mode: ChannelMode,
    sample_rate: usize,
    index: u64,
    pace: Option<Duration>,
    rng: StdRng,
}

impl SimulatedSignal {
    pub fn new(mode: ChannelMode, sample_rate: usize) -> Self {
        Self {
            mode,
            sample_rate: sample_rate.max(1),
            index: 0,
            pace: None,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Deterministic noise for tests and demos.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Sleep between samples to mimic the board's output rate.
    pub fn paced(mut self, interval: Duration) -> Self {
        self.pace = Some(interval);
        self
    }

    fn gaussian(&mut self) -> f64 {
        // Box-Muller
        let u1: f64 = self.rng.random::<f64>().max(f64::MIN_POSITIVE);
        let u2: f64 = self.rng.random();
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }

    fn reading(&mut self, frequency: f64, phase: f64) -> i32 {
        let t = (self.index % self.sample_rate as u64) as f64 / self.sample_rate as f64;
        let signal = (2.0 * PI * frequency * t + phase).sin() + NOISE_STD * self.gaussian();
        (BASELINE + AMPLITUDE * signal).round().clamp(0.0, 1023.0) as i32
    }
}

impl LineSource for SimulatedSignal {
    fn read_line(&mut self) -> Result<Option<String>, SerialError> {
        if let Some(pace) = self.pace {
            thread::sleep(pace);
        }
        let line = match self.mode {
            ChannelMode::Single => self.reading(10.0, 0.0).to_string(),
            ChannelMode::Dual => {
                let a = self.reading(10.0, 0.0);
                let b = self.reading(23.0, PI / 3.0);
                format!("{a},{b}")
            }
        };
        self.index += 1;
        Ok(Some(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::types::{parse_line, Sample};

    #[test]
    fn test_lines_parse_in_their_mode() {
        let mut single = SimulatedSignal::new(ChannelMode::Single, 1000).with_seed(1);
        let mut dual = SimulatedSignal::new(ChannelMode::Dual, 1000).with_seed(1);
        for _ in 0..100 {
            let line = single.read_line().unwrap().unwrap();
            assert!(matches!(parse_line(&line, ChannelMode::Single), Some(Sample::Single(_))));
            let line = dual.read_line().unwrap().unwrap();
            assert!(matches!(parse_line(&line, ChannelMode::Dual), Some(Sample::Dual(..))));
        }
    }

    #[test]
    fn test_readings_stay_in_adc_range() {
        let mut source = SimulatedSignal::new(ChannelMode::Single, 250).with_seed(9);
        for _ in 0..1000 {
            let line = source.read_line().unwrap().unwrap();
            let value: i32 = line.parse().unwrap();
            assert!((0..=1023).contains(&value));
        }
    }
}
