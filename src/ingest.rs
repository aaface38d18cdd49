//! Producer-facing ingest: the `/ws/producer` socket and the plain HTTP frame push.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade};
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::api::{error_response, fail, ok};
use crate::errors::{HubError, Result};
use crate::frame_slot::{DropReason, PushOutcome};
use crate::hub::Hub;
use crate::protocol::{
    decode_binary_frame, decode_frame_data, parse_camera_index, ErrorCode, ProducerMessage,
    ServerMessage,
};
use crate::registry::CameraProperties;

pub async fn producer_ws_handler(
    ws: WebSocketUpgrade,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(hub): State<Arc<Hub>>,
) -> Response {
    let address = connect_info.map(|ConnectInfo(addr)| addr.to_string());
    // Frames between max_frame_bytes and this cap reach the slot and are counted there.
    let max_message = hub.config.ingest.max_message_bytes;
    ws.max_message_size(max_message)
        .max_frame_size(max_message)
        .on_upgrade(move |socket| handle_socket(socket, hub, address))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, address: Option<String>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(hub.config.ingest.command_buffer.max(1));

    info!("Producer connection opened from {}", address.as_deref().unwrap_or("unknown"));

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode control message: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!("Producer socket closed while sending: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut connection = ProducerConnection::new(hub, address, tx);

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => connection.handle_text(&text).await,
            Ok(Message::Binary(data)) => connection.handle_binary(Bytes::from(data)).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) if is_capacity_error(&e) => {
                // The transport cannot resync after an over-cap message; count it and let the
                // producer reconnect.
                connection.hub.stats.record_push(&PushOutcome::Dropped(DropReason::Oversized));
                warn!(
                    "Producer message above {} bytes, closing connection: {}",
                    connection.hub.config.ingest.max_message_bytes, e
                );
                break;
            }
            Err(e) => {
                warn!("Producer socket error: {}", e);
                break;
            }
        }
    }

    connection.close().await;
    drop(connection);

    // All senders are gone once the registry detached this connection, which ends the writer.
    if tokio::time::timeout(Duration::from_secs(1), &mut send_task).await.is_err() {
        send_task.abort();
    }
}

fn is_capacity_error(err: &axum::Error) -> bool {
    let text = err.to_string();
    text.contains("Space limit exceeded") || text.contains("Message too long")
}

/// Per-socket state: which producer this connection speaks for.
struct ProducerConnection {
    hub: Arc<Hub>,
    address: Option<String>,
    replies: mpsc::Sender<ServerMessage>,
    producer_id: Option<String>,
    connection_id: Option<Uuid>,
    next_sequence: u64,
}

impl ProducerConnection {
    fn new(hub: Arc<Hub>, address: Option<String>, replies: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            hub,
            address,
            replies,
            producer_id: None,
            connection_id: None,
            next_sequence: 0,
        }
    }

    fn reply(&self, message: ServerMessage) {
        if let Err(e) = self.replies.try_send(message) {
            warn!("Reply to producer dropped: {}", e);
        }
    }

    fn sequence(&mut self, given: Option<u64>) -> u64 {
        let sequence = given.unwrap_or(self.next_sequence);
        self.next_sequence = sequence.wrapping_add(1);
        sequence
    }

    async fn handle_text(&mut self, text: &str) {
        let message = match serde_json::from_str::<ProducerMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("Unparseable producer message: {}", e);
                self.reply(ServerMessage::error(ErrorCode::BadMessage, format!("invalid message: {}", e)));
                return;
            }
        };
        trace!("Producer message for '{}'", message.producer_id());

        match message {
            ProducerMessage::Register { producer_id, display_name, client_type } => {
                self.register(producer_id, display_name, client_type).await;
            }
            ProducerMessage::Unregister { producer_id } => {
                if self.producer_id.as_deref() == Some(producer_id.as_str()) {
                    self.producer_id = None;
                    self.connection_id = None;
                }
                info!("Producer '{}' unregistered", producer_id);
                self.hub.evict(&producer_id).await;
            }
            ProducerMessage::Heartbeat { producer_id } => {
                if let Err(e) = self.hub.heartbeat(&producer_id).await {
                    self.reply(ServerMessage::from_error(&e));
                }
            }
            ProducerMessage::CameraInfo { producer_id, cameras } => {
                let mut result = Ok(());
                for (key, properties) in cameras {
                    result = self.report(&producer_id, &key, properties).await;
                    if result.is_err() {
                        break;
                    }
                }
                self.finish(&producer_id, result).await;
            }
            ProducerMessage::ReportCamera { producer_id, camera_index, width, height, fps, quality } => {
                let properties = CameraProperties { width, height, fps, quality, ..Default::default() };
                let result = self
                    .hub
                    .report_camera(&producer_id, camera_index, properties)
                    .await
                    .map(|_| ());
                self.finish(&producer_id, result).await;
            }
            ProducerMessage::Frame { producer_id, camera_index, sequence, frame_data } => {
                let sequence = self.sequence(sequence);
                match decode_frame_data(&frame_data) {
                    Ok(payload) => self.push(&producer_id, camera_index, sequence, payload).await,
                    Err(e) => {
                        warn!("Undecodable frame from {}/{}: {}", producer_id, camera_index, e);
                        let result = self
                            .hub
                            .reject_frame(&producer_id, camera_index, DropReason::Malformed, frame_data.len())
                            .await;
                        let reason = match result {
                            Ok(_) => {
                                let _ = self.hub.heartbeat(&producer_id).await;
                                e.to_string()
                            }
                            Err(unknown) => unknown.to_string(),
                        };
                        self.reply(ServerMessage::FrameRejected { camera_index, reason });
                    }
                }
            }
        }
    }

    async fn handle_binary(&mut self, data: Bytes) {
        let Some(producer_id) = self.producer_id.clone() else {
            self.reply(ServerMessage::error(
                ErrorCode::NotRegistered,
                "binary frames require a prior register message",
            ));
            return;
        };
        match decode_binary_frame(data) {
            Ok(frame) => {
                let sequence = self.sequence(Some(frame.sequence));
                self.push(&producer_id, frame.camera_index, sequence, frame.payload).await;
            }
            Err(e) => self.reply(ServerMessage::from_error(&e)),
        }
    }

    async fn register(&mut self, producer_id: String, display_name: Option<String>, client_type: Option<String>) {
        let outcome = match self
            .hub
            .register_producer(
                &producer_id,
                display_name.as_deref(),
                client_type.as_deref(),
                self.address.clone(),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.reply(ServerMessage::from_error(&e));
                return;
            }
        };

        if let (Some(previous), Some(connection_id)) = (self.producer_id.take(), self.connection_id.take()) {
            if previous != producer_id {
                self.hub.registry.detach_connection(&previous, connection_id).await;
            }
        }
        match self.hub.registry.attach_connection(&producer_id, self.replies.clone()).await {
            Ok(connection_id) => {
                self.connection_id = Some(connection_id);
                self.producer_id = Some(producer_id.clone());
            }
            Err(e) => {
                // Evicted between the two calls.
                self.reply(ServerMessage::from_error(&e));
                return;
            }
        }

        self.reply(ServerMessage::Registered { producer_id, created: outcome.created });
        if outcome.producer.cameras.is_empty() {
            self.reply(ServerMessage::GetCameraInfo);
        }
    }

    async fn report(&self, producer_id: &str, key: &str, properties: CameraProperties) -> Result<()> {
        let camera_index = parse_camera_index(key)?;
        self.hub.report_camera(producer_id, camera_index, properties).await?;
        Ok(())
    }

    /// Reply with the error if any; otherwise the message counts as a heartbeat.
    async fn finish(&self, producer_id: &str, result: Result<()>) {
        match result {
            Ok(()) => {
                let _ = self.hub.heartbeat(producer_id).await;
            }
            Err(e) => self.reply(ServerMessage::from_error(&e)),
        }
    }

    async fn push(&self, producer_id: &str, camera_index: u32, sequence: u64, payload: Bytes) {
        match self.hub.ingest_frame(producer_id, camera_index, sequence, payload).await {
            Ok(PushOutcome::Accepted { .. }) => {
                let _ = self.hub.heartbeat(producer_id).await;
            }
            Ok(PushOutcome::Dropped(reason)) => {
                // A bad frame still proves the producer is alive.
                let _ = self.hub.heartbeat(producer_id).await;
                self.reply(ServerMessage::FrameRejected {
                    camera_index,
                    reason: drop_reason_text(reason).to_string(),
                });
            }
            Err(e) => self.reply(ServerMessage::FrameRejected {
                camera_index,
                reason: e.to_string(),
            }),
        }
    }

    /// Socket closed: detach the control channel but keep the producer registered.
    async fn close(&mut self) {
        if let (Some(producer_id), Some(connection_id)) = (self.producer_id.take(), self.connection_id.take()) {
            self.hub.registry.detach_connection(&producer_id, connection_id).await;
            info!("Producer '{}' connection closed; it stays registered until the reaper decides", producer_id);
        } else {
            debug!("Unregistered producer connection closed");
        }
    }
}

fn drop_reason_text(reason: DropReason) -> &'static str {
    match reason {
        DropReason::Oversized => "oversized",
        DropReason::Malformed => "malformed",
        DropReason::Closed => "camera_removed",
    }
}

#[derive(Debug, Deserialize)]
pub struct PushQuery {
    pub sequence: Option<u64>,
}

enum PushBody {
    Complete(Bytes),
    /// Total bytes seen; reading stops once `max_message_bytes` is passed.
    TooLarge(usize),
}

/// Buffer at most `limit` bytes of the body. Larger bodies are drained without buffering so
/// the producer sees a proper 413.
async fn read_push_body(body: Body, limit: usize, cap: usize) -> std::result::Result<PushBody, axum::Error> {
    let mut stream = body.into_data_stream();
    let mut buffer = BytesMut::new();
    let mut seen = 0usize;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        seen += chunk.len();
        if seen > limit {
            buffer.clear();
            if seen > cap {
                break;
            }
            continue;
        }
        buffer.extend_from_slice(&chunk);
    }
    if seen > limit {
        Ok(PushBody::TooLarge(seen))
    } else {
        Ok(PushBody::Complete(buffer.freeze()))
    }
}

/// `POST /api/producers/:producer_id/cameras/:camera_index/frame` with the encoded image as body.
pub async fn push_frame_handler(
    State(hub): State<Arc<Hub>>,
    Path((producer_id, camera_index)): Path<(String, u32)>,
    Query(query): Query<PushQuery>,
    body: Body,
) -> Response {
    let sequence = query.sequence.unwrap_or(0);
    let limit = hub.config.ingest.max_frame_bytes;

    let (size, result) = match read_push_body(body, limit, hub.config.ingest.max_message_bytes).await {
        Ok(PushBody::Complete(payload)) => {
            let size = payload.len();
            (size, hub.ingest_frame(&producer_id, camera_index, sequence, payload).await)
        }
        Ok(PushBody::TooLarge(size)) => (
            size,
            hub.reject_frame(&producer_id, camera_index, DropReason::Oversized, size).await,
        ),
        Err(e) => {
            debug!("Frame upload from '{}' aborted: {}", producer_id, e);
            return fail(StatusCode::BAD_REQUEST, &format!("failed to read body: {}", e));
        }
    };

    match result {
        Ok(PushOutcome::Accepted { generation, .. }) => {
            let _ = hub.heartbeat(&producer_id).await;
            ok(serde_json::json!({
                "producer_id": producer_id,
                "camera_index": camera_index,
                "generation": generation,
            }))
        }
        Ok(PushOutcome::Dropped(DropReason::Oversized)) => {
            let _ = hub.heartbeat(&producer_id).await;
            error_response(&HubError::FrameTooLarge { size, limit })
        }
        Ok(PushOutcome::Dropped(DropReason::Malformed)) => {
            let _ = hub.heartbeat(&producer_id).await;
            error_response(&HubError::malformed(format!(
                "{} bytes are not a recognised image",
                size
            )))
        }
        Ok(PushOutcome::Dropped(DropReason::Closed)) => {
            error_response(&HubError::unknown_camera(producer_id, camera_index))
        }
        Err(e) => error_response(&e),
    }
}
