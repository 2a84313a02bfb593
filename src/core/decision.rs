//! Decision aggregation: majority vote, cooldown gate and hysteresis gate.

use crate::config::IntentLabels;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Binary actuator intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    #[default]
    Stay,
    Move,
}

/// Current stable decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub intent: Intent,
    /// When this decision was last accepted; `None` until the first acceptance
    pub changed_at: Option<DateTime<Utc>>,
}

impl Default for Decision {
    fn default() -> Self {
        Self {
            intent: Intent::Stay,
            changed_at: None,
        }
    }
}

/// Label counts for one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    pub affirmative: usize,
    pub negative: usize,
    /// Labels matching neither intent label
    pub other: usize,
}

impl VoteTally {
    pub fn from_labels<S: AsRef<str>>(labels: &[S], intents: &IntentLabels) -> Self {
        let mut tally = Self::default();
        for label in labels {
            let label = label.as_ref();
            if label == intents.affirmative {
                tally.affirmative += 1;
            } else if label == intents.negative {
                tally.negative += 1;
            } else {
                tally.other += 1;
            }
        }
        tally
    }

    /// Move only on a strict affirmative majority; ties stay.
    pub fn vote(&self) -> Intent {
        if self.affirmative > self.negative {
            Intent::Move
        } else {
            Intent::Stay
        }
    }
}

/// What happened to a raw vote.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Accepted(Decision),
    /// Arrived within the cooldown of the last accepted decision
    CooldownActive,
    /// Move requested while already moving
    HeldByHysteresis,
}

/// Shared read handle to the current decision.
#[derive(Debug, Clone, Default)]
pub struct SharedDecision(Arc<RwLock<Decision>>);

impl SharedDecision {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Decision {
        *self.0.read()
    }

    fn set(&self, decision: Decision) {
        *self.0.write() = decision;
    }
}

/// Owns the current decision and gates every change to it.
pub struct DecisionAggregator {
    cooldown: Duration,
    current: SharedDecision,
    last_accepted: Option<Instant>,
}

impl DecisionAggregator {
    pub fn new(cooldown: Duration, current: SharedDecision) -> Self {
        Self {
            cooldown,
            current,
            last_accepted: None,
        }
    }

    /// Read handle for pollers and the dispatcher.
    pub fn shared(&self) -> SharedDecision {
        self.current.clone()
    }

    pub fn current(&self) -> Decision {
        self.current.get()
    }

    /// Feed one raw vote observed at `now`.
    pub fn observe(&mut self, vote: Intent, now: Instant) -> Outcome {
        if let Some(last) = self.last_accepted {
            if now.saturating_duration_since(last) < self.cooldown {
                return Outcome::CooldownActive;
            }
        }

        let current = self.current.get();
        if vote == Intent::Move && current.intent == Intent::Move {
            return Outcome::HeldByHysteresis;
        }

        let decision = Decision {
            intent: vote,
            changed_at: Some(Utc::now()),
        };
        self.current.set(decision);
        self.last_accepted = Some(now);
        Outcome::Accepted(decision)
    }

    /// Forget timing and fall back to Stay at a session boundary.
    ///
    /// Returns the new decision when a standing Move was released, so the
    /// caller can publish it.
    pub fn reset(&mut self) -> Option<Decision> {
        self.last_accepted = None;
        if self.current.get().intent != Intent::Move {
            return None;
        }
        let decision = Decision {
            intent: Intent::Stay,
            changed_at: Some(Utc::now()),
        };
        self.current.set(decision);
        Some(decision)
    }
}
