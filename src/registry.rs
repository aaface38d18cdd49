//! Producers and the cameras they own.
//!
//! The outer map is only write-locked to add or remove a producer. Everything else
//! (heartbeats, camera reports, frame pushes) takes the outer read lock plus the lock of the
//! one producer involved, so a busy producer never stalls another one.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{HubError, Result};
use crate::frame_slot::{DropReason, Frame, FrameSlot, PushOutcome, SlotCounters};
use crate::protocol::ServerMessage;
use crate::utils::{clamp_fps, clamp_quality};

pub const DEFAULT_STREAM_QUALITY: u8 = 80;

/// Composite key of one camera.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CameraKey {
    pub producer_id: String,
    pub camera_index: u32,
}

impl CameraKey {
    pub fn new(producer_id: impl Into<String>, camera_index: u32) -> Self {
        Self { producer_id: producer_id.into(), camera_index }
    }
}

impl fmt::Display for CameraKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.producer_id, self.camera_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerStatus {
    Active,
    Stale,
}

/// What a producer reports about one of its cameras.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraProperties {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    /// Anything else the producer sent (brightness, exposure, ...), kept verbatim.
    #[serde(flatten, default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
struct CameraInfo {
    properties: CameraProperties,
    quality: u8,
    target_fps: u32,
    reported_at: DateTime<Utc>,
}

pub struct CameraEntry {
    pub key: CameraKey,
    pub slot: FrameSlot,
    info: RwLock<CameraInfo>,
}

impl CameraEntry {
    pub async fn snapshot(&self) -> CameraSnapshot {
        let info = self.info.read().await.clone();
        let latest = self.slot.peek();
        CameraSnapshot {
            camera_index: self.key.camera_index,
            width: info.properties.width,
            height: info.properties.height,
            fps: info.properties.fps,
            quality: info.quality,
            target_fps: info.target_fps,
            extra: info.properties.extra,
            reported_at: info.reported_at,
            last_frame_at: latest.as_ref().map(|f| f.received_at),
            last_frame_bytes: latest.as_ref().map(|f| f.size()),
            last_sequence: latest.as_ref().map(|f| f.sequence),
            sessions_attached: self.slot.reader_count(),
            counters: self.slot.counters(),
        }
    }

    pub async fn streaming_settings(&self) -> (u8, u32) {
        let info = self.info.read().await;
        (info.quality, info.target_fps)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraSnapshot {
    pub camera_index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub quality: u8,
    pub target_fps: u32,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
    pub reported_at: DateTime<Utc>,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub last_frame_bytes: Option<usize>,
    pub last_sequence: Option<u64>,
    pub sessions_attached: usize,
    pub counters: SlotCounters,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProducerSnapshot {
    pub producer_id: String,
    pub display_name: String,
    pub client_type: String,
    pub address: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub status: ProducerStatus,
    pub connected: bool,
    pub cameras: Vec<CameraSnapshot>,
}

struct Connection {
    id: Uuid,
    commands: mpsc::Sender<ServerMessage>,
}

struct ProducerState {
    display_name: String,
    client_type: String,
    address: Option<String>,
    registered_at: DateTime<Utc>,
    last_heartbeat_at: DateTime<Utc>,
    last_seen: Instant,
    status: ProducerStatus,
    cameras: HashMap<u32, Arc<CameraEntry>>,
    connection: Option<Connection>,
}

pub struct ProducerEntry {
    pub producer_id: String,
    state: RwLock<ProducerState>,
}

impl ProducerEntry {
    pub async fn snapshot(&self) -> ProducerSnapshot {
        let state = self.state.read().await;
        let mut cameras = Vec::with_capacity(state.cameras.len());
        for camera in state.cameras.values() {
            cameras.push(camera.snapshot().await);
        }
        cameras.sort_by_key(|c| c.camera_index);

        ProducerSnapshot {
            producer_id: self.producer_id.clone(),
            display_name: state.display_name.clone(),
            client_type: state.client_type.clone(),
            address: state.address.clone(),
            registered_at: state.registered_at,
            last_heartbeat_at: state.last_heartbeat_at,
            status: state.status,
            connected: state.connection.is_some(),
            cameras,
        }
    }

    pub async fn camera_keys(&self) -> Vec<CameraKey> {
        let state = self.state.read().await;
        state.cameras.values().map(|c| c.key.clone()).collect()
    }

    /// Close every camera slot, releasing held frames.
    pub async fn close(&self) {
        let mut state = self.state.write().await;
        for camera in state.cameras.values() {
            camera.slot.close();
        }
        state.cameras.clear();
        state.connection = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Refreshed,
    /// The producer was stale and is active again.
    Recovered,
}

#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    pub producer: ProducerSnapshot,
    pub created: bool,
    pub recovered: bool,
}

/// Point-in-time liveness view used by the health reaper.
#[derive(Debug, Clone)]
pub struct LivenessSample {
    pub producer_id: String,
    pub status: ProducerStatus,
    pub idle_for: Duration,
}

pub struct ProducerRegistry {
    producers: RwLock<HashMap<String, Arc<ProducerEntry>>>,
    max_frame_bytes: usize,
    validate_format: bool,
}

impl ProducerRegistry {
    pub fn new(max_frame_bytes: usize, validate_format: bool) -> Self {
        Self {
            producers: RwLock::new(HashMap::new()),
            max_frame_bytes,
            validate_format,
        }
    }

    async fn entry(&self, producer_id: &str) -> Result<Arc<ProducerEntry>> {
        let producers = self.producers.read().await;
        producers
            .get(producer_id)
            .cloned()
            .ok_or_else(|| HubError::unknown_producer(producer_id))
    }

    /// Create or refresh a producer. Re-registration keeps its cameras.
    pub async fn register(
        &self,
        producer_id: &str,
        display_name: Option<&str>,
        client_type: Option<&str>,
        address: Option<String>,
    ) -> RegisterOutcome {
        let existing = { self.producers.read().await.get(producer_id).cloned() };

        let (entry, created) = match existing {
            Some(entry) => (entry, false),
            None => {
                let mut producers = self.producers.write().await;
                // Another connection may have registered the same id meanwhile.
                let mut created = false;
                let entry = producers
                    .entry(producer_id.to_string())
                    .or_insert_with(|| {
                        created = true;
                        let now = Utc::now();
                        Arc::new(ProducerEntry {
                            producer_id: producer_id.to_string(),
                            state: RwLock::new(ProducerState {
                                display_name: producer_id.to_string(),
                                client_type: "camera".to_string(),
                                address: None,
                                registered_at: now,
                                last_heartbeat_at: now,
                                last_seen: Instant::now(),
                                status: ProducerStatus::Active,
                                cameras: HashMap::new(),
                                connection: None,
                            }),
                        })
                    })
                    .clone();
                (entry, created)
            }
        };

        let recovered = {
            let mut state = entry.state.write().await;
            if let Some(name) = display_name {
                state.display_name = name.to_string();
            }
            if let Some(kind) = client_type {
                state.client_type = kind.to_string();
            }
            if address.is_some() {
                state.address = address;
            }
            let recovered = state.status == ProducerStatus::Stale;
            state.status = ProducerStatus::Active;
            state.last_heartbeat_at = Utc::now();
            state.last_seen = Instant::now();
            recovered
        };

        if created {
            info!("Registered new producer '{}'", producer_id);
        } else {
            debug!("Producer '{}' re-registered, metadata refreshed", producer_id);
        }

        RegisterOutcome { producer: entry.snapshot().await, created, recovered }
    }

    pub async fn heartbeat(&self, producer_id: &str) -> Result<Liveness> {
        self.heartbeat_at(producer_id, Instant::now()).await
    }

    pub async fn heartbeat_at(&self, producer_id: &str, now: Instant) -> Result<Liveness> {
        let entry = self.entry(producer_id).await?;
        let mut state = entry.state.write().await;
        state.last_seen = now;
        state.last_heartbeat_at = Utc::now();
        if state.status == ProducerStatus::Stale {
            state.status = ProducerStatus::Active;
            info!("Producer '{}' is active again", producer_id);
            return Ok(Liveness::Recovered);
        }
        Ok(Liveness::Refreshed)
    }

    /// Create or update a camera. Returns true when the camera is new.
    pub async fn report_camera(
        &self,
        producer_id: &str,
        camera_index: u32,
        properties: CameraProperties,
    ) -> Result<bool> {
        let entry = self.entry(producer_id).await?;
        let mut state = entry.state.write().await;

        if let Some(camera) = state.cameras.get(&camera_index) {
            let mut info = camera.info.write().await;
            if let Some(quality) = properties.quality {
                info.quality = clamp_quality(quality);
            }
            info.properties = properties;
            info.reported_at = Utc::now();
            debug!("Updated camera {} on producer '{}'", camera_index, producer_id);
            return Ok(false);
        }

        let quality = clamp_quality(properties.quality.unwrap_or(DEFAULT_STREAM_QUALITY));
        let target_fps = clamp_fps(properties.fps);
        info!(
            "Producer '{}' reported camera {} ({}x{} @ {} fps)",
            producer_id, camera_index, properties.width, properties.height, properties.fps
        );
        let camera = CameraEntry {
            key: CameraKey::new(producer_id, camera_index),
            slot: FrameSlot::new(self.max_frame_bytes, self.validate_format),
            info: RwLock::new(CameraInfo {
                properties,
                quality,
                target_fps,
                reported_at: Utc::now(),
            }),
        };
        state.cameras.insert(camera_index, Arc::new(camera));
        Ok(true)
    }

    /// Typed camera lookup.
    pub async fn camera(&self, key: &CameraKey) -> Result<Arc<CameraEntry>> {
        let entry = self.entry(&key.producer_id).await?;
        let state = entry.state.read().await;
        state
            .cameras
            .get(&key.camera_index)
            .cloned()
            .ok_or_else(|| HubError::unknown_camera(&key.producer_id, key.camera_index))
    }

    /// Hand one frame to its camera's slot. Never creates producers or cameras.
    pub async fn push_frame(
        &self,
        producer_id: &str,
        camera_index: u32,
        sequence: u64,
        payload: Bytes,
    ) -> Result<PushOutcome> {
        let camera = self.camera(&CameraKey::new(producer_id, camera_index)).await?;
        Ok(camera.slot.push(Frame::new(producer_id, camera_index, sequence, payload)))
    }

    /// Count a refused frame against its camera. Unknown producers or cameras are errors,
    /// exactly as for `push_frame`.
    pub async fn reject_frame(
        &self,
        producer_id: &str,
        camera_index: u32,
        reason: DropReason,
    ) -> Result<PushOutcome> {
        let camera = self.camera(&CameraKey::new(producer_id, camera_index)).await?;
        Ok(camera.slot.reject(reason))
    }

    /// Record the requested quality and fps for a camera; returns the clamped values.
    pub async fn update_settings(
        &self,
        key: &CameraKey,
        quality: Option<u8>,
        fps: Option<u32>,
    ) -> Result<(u8, u32)> {
        let camera = self.camera(key).await?;
        let mut info = camera.info.write().await;
        if let Some(quality) = quality {
            info.quality = clamp_quality(quality);
        }
        if let Some(fps) = fps {
            info.target_fps = clamp_fps(fps);
        }
        Ok((info.quality, info.target_fps))
    }

    /// Bind the outbound control channel of a live connection to a producer.
    pub async fn attach_connection(
        &self,
        producer_id: &str,
        commands: mpsc::Sender<ServerMessage>,
    ) -> Result<Uuid> {
        let entry = self.entry(producer_id).await?;
        let mut state = entry.state.write().await;
        let id = Uuid::new_v4();
        if state.connection.is_some() {
            info!("Producer '{}' reconnected, replacing previous connection", producer_id);
        }
        state.connection = Some(Connection { id, commands });
        Ok(id)
    }

    /// Drop the control channel if it still belongs to `connection_id`.
    pub async fn detach_connection(&self, producer_id: &str, connection_id: Uuid) {
        if let Ok(entry) = self.entry(producer_id).await {
            let mut state = entry.state.write().await;
            if state.connection.as_ref().map(|c| c.id) == Some(connection_id) {
                state.connection = None;
                info!("Producer '{}' disconnected", producer_id);
            }
        }
    }

    /// Queue a control message for a producer. Returns false if it could not be queued;
    /// producers are not required to be connected.
    pub async fn send_command(&self, producer_id: &str, message: ServerMessage) -> Result<bool> {
        let entry = self.entry(producer_id).await?;
        let state = entry.state.read().await;
        match &state.connection {
            Some(connection) => match connection.commands.try_send(message) {
                Ok(()) => Ok(true),
                Err(e) => {
                    warn!("Dropping control message for producer '{}': {}", producer_id, e);
                    Ok(false)
                }
            },
            None => {
                debug!("Producer '{}' has no live connection, control message dropped", producer_id);
                Ok(false)
            }
        }
    }

    pub async fn get(&self, producer_id: &str) -> Option<ProducerSnapshot> {
        match self.entry(producer_id).await {
            Ok(entry) => Some(entry.snapshot().await),
            Err(_) => None,
        }
    }

    /// Consistent copy of every producer and camera, sorted by producer id.
    pub async fn list(&self) -> Vec<ProducerSnapshot> {
        let entries: Vec<Arc<ProducerEntry>> = {
            let producers = self.producers.read().await;
            producers.values().cloned().collect()
        };
        let mut snapshots = Vec::with_capacity(entries.len());
        for entry in entries {
            snapshots.push(entry.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));
        snapshots
    }

    pub async fn contains(&self, producer_id: &str) -> bool {
        self.producers.read().await.contains_key(producer_id)
    }

    pub async fn liveness(&self, now: Instant) -> Vec<LivenessSample> {
        let entries: Vec<Arc<ProducerEntry>> = {
            let producers = self.producers.read().await;
            producers.values().cloned().collect()
        };
        let mut samples = Vec::with_capacity(entries.len());
        for entry in entries {
            let state = entry.state.read().await;
            samples.push(LivenessSample {
                producer_id: entry.producer_id.clone(),
                status: state.status,
                idle_for: now.saturating_duration_since(state.last_seen),
            });
        }
        samples
    }

    /// Mark a producer stale if it has still been idle for at least `timeout` at `now`.
    pub async fn mark_stale_if_idle(&self, producer_id: &str, now: Instant, timeout: Duration) -> bool {
        let Ok(entry) = self.entry(producer_id).await else { return false; };
        let mut state = entry.state.write().await;
        if state.status == ProducerStatus::Active
            && now.saturating_duration_since(state.last_seen) >= timeout
        {
            state.status = ProducerStatus::Stale;
            return true;
        }
        false
    }

    /// Remove a producer from the map. The entry is returned still open so the caller can
    /// stop sessions before closing its slots. Removing twice returns None.
    pub async fn remove(&self, producer_id: &str) -> Option<Arc<ProducerEntry>> {
        let mut producers = self.producers.write().await;
        producers.remove(producer_id)
    }

    /// Remove a producer only if it has been idle for at least `threshold` at `now`.
    pub async fn remove_if_idle(
        &self,
        producer_id: &str,
        now: Instant,
        threshold: Duration,
    ) -> Option<Arc<ProducerEntry>> {
        let mut producers = self.producers.write().await;
        let idle = match producers.get(producer_id) {
            Some(entry) => {
                let state = entry.state.read().await;
                now.saturating_duration_since(state.last_seen) >= threshold
            }
            None => false,
        };
        if idle {
            producers.remove(producer_id)
        } else {
            None
        }
    }

    pub async fn counts(&self) -> RegistryCounts {
        let entries: Vec<Arc<ProducerEntry>> = {
            let producers = self.producers.read().await;
            producers.values().cloned().collect()
        };
        let mut counts = RegistryCounts::default();
        for entry in entries {
            let state = entry.state.read().await;
            counts.producers += 1;
            match state.status {
                ProducerStatus::Active => counts.active_producers += 1,
                ProducerStatus::Stale => counts.stale_producers += 1,
            }
            counts.cameras += state.cameras.len();
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryCounts {
    pub producers: usize,
    pub active_producers: usize,
    pub stale_producers: usize,
    pub cameras: usize,
}
