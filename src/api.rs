//! Query and control surface for the web gateway.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::coordinator::{SessionRequest, StartOutcome, StopOutcome};
use crate::detection::TargetClasses;
use crate::errors::HubError;
use crate::hub::Hub;
use crate::reaper::HealthReaper;
use crate::registry::CameraKey;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u16>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn error(message: &str, code: u16) -> ApiResponse<()> {
        ApiResponse {
            status: "error".to_string(),
            data: None,
            error: Some(message.to_string()),
            code: Some(code),
        }
    }
}

pub fn ok<T: Serialize>(data: T) -> Response {
    Json(ApiResponse::success(data)).into_response()
}

pub fn fail(status: StatusCode, message: &str) -> Response {
    (status, Json(ApiResponse::<()>::error(message, status.as_u16()))).into_response()
}

pub fn error_response(err: &HubError) -> Response {
    let status = match err {
        HubError::UnknownProducer { .. } | HubError::UnknownCamera { .. } => StatusCode::NOT_FOUND,
        HubError::FrameTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        HubError::MalformedFrame { .. } | HubError::Protocol { .. } | HubError::Config { .. } => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Request failed: {}", err);
    }
    fail(status, &err.to_string())
}

pub async fn list_producers(State(hub): State<Arc<Hub>>) -> Response {
    ok(hub.registry.list().await)
}

pub async fn get_producer(State(hub): State<Arc<Hub>>, Path(producer_id): Path<String>) -> Response {
    match hub.registry.get(&producer_id).await {
        Some(producer) => ok(producer),
        None => error_response(&HubError::unknown_producer(producer_id)),
    }
}

pub async fn evict_producer(State(hub): State<Arc<Hub>>, Path(producer_id): Path<String>) -> Response {
    if hub.evict(&producer_id).await {
        info!("Producer '{}' evicted by operator", producer_id);
        ok(serde_json::json!({ "producer_id": producer_id, "evicted": true }))
    } else {
        error_response(&HubError::unknown_producer(producer_id))
    }
}

#[derive(Debug, Deserialize)]
pub struct SettingsRequest {
    pub quality: Option<u8>,
    pub fps: Option<u32>,
}

pub async fn update_camera_settings(
    State(hub): State<Arc<Hub>>,
    Path((producer_id, camera_index)): Path<(String, u32)>,
    Json(request): Json<SettingsRequest>,
) -> Response {
    if request.quality.is_none() && request.fps.is_none() {
        return fail(StatusCode::BAD_REQUEST, "quality or fps required");
    }
    let key = CameraKey::new(producer_id, camera_index);
    match hub.update_camera_settings(&key, request.quality, request.fps).await {
        Ok((quality, fps)) => ok(serde_json::json!({
            "producer_id": key.producer_id,
            "camera_index": key.camera_index,
            "quality": quality,
            "fps": fps,
        })),
        Err(e) => error_response(&e),
    }
}

pub async fn list_sessions(State(hub): State<Arc<Hub>>) -> Response {
    ok(hub.coordinator.list().await)
}

pub async fn get_session(
    State(hub): State<Arc<Hub>>,
    Path((producer_id, camera_index)): Path<(String, u32)>,
) -> Response {
    let key = CameraKey::new(producer_id, camera_index);
    match hub.coordinator.session(&key).await {
        Some(session) => ok(session),
        None => fail(StatusCode::NOT_FOUND, &format!("No session for {}", key)),
    }
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

/// Newest detection events of a running session, newest first.
pub async fn recent_detections(
    State(hub): State<Arc<Hub>>,
    Path((producer_id, camera_index)): Path<(String, u32)>,
    Query(query): Query<RecentQuery>,
) -> Response {
    let key = CameraKey::new(producer_id, camera_index);
    match hub.coordinator.recent_detections(&key, query.limit).await {
        Some(events) => ok(events),
        None => fail(StatusCode::NOT_FOUND, &format!("No session for {}", key)),
    }
}

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub producer_id: String,
    pub camera_index: u32,
    pub confidence: Option<f32>,
    pub target_classes: Option<Vec<String>>,
    pub poll_fps: Option<u32>,
}

pub async fn start_session(
    State(hub): State<Arc<Hub>>,
    Json(request): Json<StartSessionRequest>,
) -> Response {
    if let Some(confidence) = request.confidence {
        if !(0.0..=1.0).contains(&confidence) {
            return fail(StatusCode::BAD_REQUEST, "confidence must be within 0.0..=1.0");
        }
    }
    let key = CameraKey::new(request.producer_id, request.camera_index);
    let session_request = SessionRequest {
        confidence_threshold: request.confidence,
        target_classes: TargetClasses::from_labels(request.target_classes),
        poll_fps: request.poll_fps,
    };

    match hub.coordinator.start(key.clone(), session_request).await {
        StartOutcome::Started(session) => ok(session),
        StartOutcome::AlreadyActive(_) => fail(
            StatusCode::CONFLICT,
            &format!("Session already active for {}", key),
        ),
        StartOutcome::UnknownCamera => {
            error_response(&HubError::unknown_camera(key.producer_id, key.camera_index))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StopSessionRequest {
    pub producer_id: String,
    pub camera_index: u32,
}

pub async fn stop_session(
    State(hub): State<Arc<Hub>>,
    Json(request): Json<StopSessionRequest>,
) -> Response {
    let key = CameraKey::new(request.producer_id, request.camera_index);
    match hub.coordinator.stop(&key).await {
        StopOutcome::Stopped(session) => ok(serde_json::json!({
            "result": "stopped",
            "session": session,
        })),
        StopOutcome::NotActive => ok(serde_json::json!({ "result": "not_active" })),
    }
}

pub async fn get_stats(State(hub): State<Arc<Hub>>) -> Response {
    ok(hub.stats_snapshot().await)
}

/// Run one health sweep right away.
pub async fn sweep_now(State(hub): State<Arc<Hub>>) -> Response {
    let report = HealthReaper::new(hub).sweep(tokio::time::Instant::now()).await;
    ok(report)
}

pub async fn events_ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, hub))
}

async fn stream_events(socket: WebSocket, hub: Arc<Hub>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = hub.events.subscribe();
    info!("Event subscriber connected ({} total)", hub.events.subscriber_count());

    let mut send_task = tokio::spawn(async move {
        let mut lagged = 0u64;
        loop {
            match events.recv().await {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode {} event: {}", event.kind(), e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    lagged += skipped;
                    warn!("Event subscriber lagging, skipped {} events ({} total)", skipped, lagged);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    debug!("Event subscriber disconnected");
}
