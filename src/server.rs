//! HTTP control surface for the EMG Intent Agent.
//!
//! This module exposes the [`ControlPlane`] over HTTP:
//! - Start/stop of recording and inference sessions
//! - Training from the recordings on disk
//! - Status polling and the latest decision
//! - A WebSocket feed of accepted decisions
//!
//! # Architecture
//!
//! ```text
//! Operator UI ──→ POST /api/* ──→ ControlPlane ──→ session worker
//!      ↑                                                │
//!      └──── GET /api/status, /ws ←── Dispatcher ←──────┘
//! ```

use crate::control::{ControlError, ControlPlane, StatusUpdate};
use crate::core::classifier::ClassifierError;
use crate::core::decision::Intent;
use crate::dispatch::DecisionEvent;
use crate::training::{TrainingError, TrainingReport};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderValue, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind to (0 for random)
    pub port: u16,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(5000)
    }
}

/// Body of POST /api/record
#[derive(Debug, Clone, Deserialize)]
pub struct RecordRequest {
    pub motion: String,
}

/// Body of POST /api/train
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrainRequest {
    pub name: Option<String>,
}

/// Response to start/stop actions
#[derive(Debug, Clone, Serialize)]
pub struct ActionResponse {
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

impl ActionResponse {
    fn success(message: impl Into<String>, session_id: Option<Uuid>) -> Json<Self> {
        Json(Self {
            status: "success".to_string(),
            message: message.into(),
            session_id,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainResponse {
    pub status: String,
    pub message: String,
    pub report: TrainingReport,
}

/// Latest decision
#[derive(Debug, Clone, Serialize)]
pub struct PredictionResponse {
    pub prediction: String,
    pub intent: Intent,
    pub changed_at: Option<DateTime<Utc>>,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl std::fmt::Display) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

fn control_error(e: ControlError) -> ApiError {
    let (status, code) = match &e {
        ControlError::InvalidLabel { .. } => (StatusCode::BAD_REQUEST, "INVALID_LABEL"),
        ControlError::SessionActive(_) => (StatusCode::CONFLICT, "SESSION_ACTIVE"),
        ControlError::NoActiveSession(_) => (StatusCode::CONFLICT, "NO_ACTIVE_SESSION"),
        ControlError::Classifier(ClassifierError::ModelNotFound { .. }) => {
            (StatusCode::NOT_FOUND, "MODEL_NOT_FOUND")
        }
        ControlError::Classifier(ClassifierError::LayoutMismatch { .. }) => {
            (StatusCode::CONFLICT, "MODEL_LAYOUT_MISMATCH")
        }
        ControlError::Classifier(_) => (StatusCode::INTERNAL_SERVER_ERROR, "MODEL_ERROR"),
        ControlError::Training(TrainingError::MissingRecordings(_)) => {
            (StatusCode::BAD_REQUEST, "MISSING_RECORDINGS")
        }
        ControlError::Training(_) => (StatusCode::INTERNAL_SERVER_ERROR, "TRAINING_ERROR"),
        ControlError::Spawn(_) => (StatusCode::INTERNAL_SERVER_ERROR, "WORKER_ERROR"),
    };
    tracing::warn!(code, error = %e, "control request rejected");
    api_error(status, code, e)
}

/// Run a blocking control-plane call off the async workers.
async fn blocking<T, F>(control: ControlPlane, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&ControlPlane) -> Result<T, ControlError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&control))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, "TASK_FAILED", e))?
        .map_err(control_error)
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// POST /api/record
async fn start_recording(
    State(control): State<ControlPlane>,
    Json(request): Json<RecordRequest>,
) -> Result<Json<ActionResponse>, ApiError> {
    let label = request.motion.clone();
    let id = blocking(control, move |c| c.start_recording(&label)).await?;
    Ok(ActionResponse::success(
        format!("Recording started for {}", request.motion),
        Some(id),
    ))
}

/// POST /api/stop-recording
async fn stop_recording(
    State(control): State<ControlPlane>,
) -> Result<Json<ActionResponse>, ApiError> {
    blocking(control, |c| c.stop_recording()).await?;
    Ok(ActionResponse::success("Recording stopped", None))
}

/// POST /api/train
async fn train(
    State(control): State<ControlPlane>,
    request: Option<Json<TrainRequest>>,
) -> Result<Json<TrainResponse>, ApiError> {
    let name = request.and_then(|Json(r)| r.name);
    let report = blocking(control, move |c| c.train(name.as_deref())).await?;
    Ok(Json(TrainResponse {
        status: "success".to_string(),
        message: format!("Model '{}' trained on {} rows", report.model, report.rows),
        report,
    }))
}

/// POST /api/start-inference
async fn start_inference(
    State(control): State<ControlPlane>,
) -> Result<Json<ActionResponse>, ApiError> {
    let id = blocking(control, |c| c.start_inference()).await?;
    Ok(ActionResponse::success("Inference started", Some(id)))
}

/// POST /api/stop-inference
async fn stop_inference(
    State(control): State<ControlPlane>,
) -> Result<Json<ActionResponse>, ApiError> {
    blocking(control, |c| c.stop_inference()).await?;
    Ok(ActionResponse::success("Inference stopped", None))
}

/// GET /api/status
async fn status(State(control): State<ControlPlane>) -> Json<StatusUpdate> {
    Json(control.poll_status())
}

/// GET /api/prediction
async fn prediction(State(control): State<ControlPlane>) -> Json<PredictionResponse> {
    let decision = control.current_decision();
    Json(PredictionResponse {
        prediction: control.dispatcher().command_for(decision.intent).to_string(),
        intent: decision.intent,
        changed_at: decision.changed_at,
    })
}

/// GET /ws
async fn decision_feed(ws: WebSocketUpgrade, State(control): State<ControlPlane>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, control))
}

async fn handle_socket(socket: WebSocket, control: ControlPlane) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = control.dispatcher().subscribe();

    let current = control
        .dispatcher()
        .event_for(&control.current_decision());
    if send_event(&mut sender, &current).await.is_err() {
        return;
    }
    tracing::debug!("decision feed subscriber connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if let Err(e) = send_event(&mut sender, &event).await {
                        tracing::debug!("decision feed subscriber dropped: {}", e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "decision feed subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                // replies are ignored
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn send_event<S>(sender: &mut S, event: &DecisionEvent) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let json = serde_json::to_string(event).map_err(axum::Error::new)?;
    sender.send(Message::Text(json)).await
}

/// Build the router over a control plane.
pub fn router(control: ControlPlane) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/record", post(start_recording))
        .route("/api/stop-recording", post(stop_recording))
        .route("/api/train", post(train))
        .route("/api/start-inference", post(start_inference))
        .route("/api/stop-inference", post(stop_inference))
        .route("/api/status", get(status))
        .route("/api/prediction", get(prediction))
        .route("/ws", get(decision_feed))
        .layer(
            CorsLayer::new()
                .allow_origin([
                    HeaderValue::from_static("http://localhost:3000"),
                    HeaderValue::from_static("http://127.0.0.1:3000"),
                ])
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(control)
}

/// Run the HTTP server
pub async fn run(
    config: ServerConfig,
    control: ControlPlane,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = router(control);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Control server listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
