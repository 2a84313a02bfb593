//! Decision dispatch: broadcast fan-out and outbound actuator links.
//!
//! Accepted decisions are published on a `tokio::sync::broadcast` channel.
//! Every actuator link and every WebSocket subscriber reads its own receiver,
//! so a slow consumer lags on its own without blocking acquisition.

use crate::config::DispatchConfig;
use crate::core::decision::{Decision, Intent, SharedDecision};
use chrono::{DateTime, Utc};
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A decision as published to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEvent {
    pub intent: Intent,
    /// Wire token sent to actuators
    pub command: String,
    pub changed_at: Option<DateTime<Utc>>,
}

/// Publishes accepted decisions and serves the latest one.
#[derive(Clone)]
pub struct Dispatcher {
    tx: broadcast::Sender<DecisionEvent>,
    current: SharedDecision,
    move_command: String,
    stay_command: String,
}

impl Dispatcher {
    pub fn new(config: &DispatchConfig, current: SharedDecision) -> Self {
        let (tx, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            tx,
            current,
            move_command: config.move_command.clone(),
            stay_command: config.stay_command.clone(),
        }
    }

    /// Handle to the decision this dispatcher reports.
    pub fn shared_decision(&self) -> SharedDecision {
        self.current.clone()
    }

    pub fn command_for(&self, intent: Intent) -> &str {
        match intent {
            Intent::Move => &self.move_command,
            Intent::Stay => &self.stay_command,
        }
    }

    pub fn event_for(&self, decision: &Decision) -> DecisionEvent {
        DecisionEvent {
            intent: decision.intent,
            command: self.command_for(decision.intent).to_string(),
            changed_at: decision.changed_at,
        }
    }

    /// Fire-and-forget publish. Returns the number of subscribers reached.
    pub fn on_decision_change(&self, decision: &Decision) -> usize {
        let event = self.event_for(decision);
        match self.tx.send(event) {
            Ok(receivers) => {
                debug!(command = self.command_for(decision.intent), receivers, "decision published");
                receivers
            }
            Err(_) => {
                debug!("decision published with no subscribers");
                0
            }
        }
    }

    /// Last accepted decision, independent of delivery success.
    pub fn current_decision(&self) -> Decision {
        self.current.get()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DecisionEvent> {
        self.tx.subscribe()
    }
}

/// Start one outbound link per actuator URL.
///
/// Links connect lazily on the first event, drop the connection on a send
/// failure and reconnect on the next event. Failed sends are not retried.
pub fn spawn_actuator_links(
    dispatcher: &Dispatcher,
    urls: &[String],
    runtime: &tokio::runtime::Handle,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    urls.iter()
        .map(|url| {
            let rx = dispatcher.subscribe();
            let url = url.clone();
            let cancel = cancel.clone();
            runtime.spawn(actuator_link(url, rx, cancel))
        })
        .collect()
}

async fn actuator_link(
    url: String,
    mut rx: broadcast::Receiver<DecisionEvent>,
    cancel: CancellationToken,
) {
    let mut link = None;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%url, skipped, "actuator link lagged, decisions skipped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        if link.is_none() {
            match connect_async(url.as_str()).await {
                Ok((stream, _)) => {
                    info!(%url, "actuator connected");
                    link = Some(stream);
                }
                Err(e) => {
                    warn!(%url, error = %e, command = %event.command, "actuator unreachable, decision not delivered");
                    continue;
                }
            }
        }

        if let Some(stream) = link.as_mut() {
            if let Err(e) = stream.send(Message::text(event.command.clone())).await {
                warn!(%url, error = %e, "actuator send failed");
                link = None;
            } else {
                debug!(%url, command = %event.command, "command delivered");
            }
        }
    }

    if let Some(mut stream) = link {
        let _ = stream.close(None).await;
    }
    debug!(%url, "actuator link stopped");
}
