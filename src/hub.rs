use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::coordinator::StreamCoordinator;
use crate::detection::DetectionEngine;
use crate::errors::{HubError, Result};
use crate::events::{EventBus, HubEvent, ProducerChange, StopReason};
use crate::frame_slot::{DropReason, PushOutcome};
use crate::protocol::ServerMessage;
use crate::registry::{
    CameraKey, CameraProperties, Liveness, ProducerEntry, ProducerRegistry, RegisterOutcome,
};
use crate::stats::{StatsAggregator, StatsSnapshot};

/// Process-wide state, built once at startup and shared as `Arc<Hub>`.
pub struct Hub {
    pub config: Config,
    pub registry: Arc<ProducerRegistry>,
    pub coordinator: Arc<StreamCoordinator>,
    pub stats: Arc<StatsAggregator>,
    pub events: Arc<EventBus>,
}

impl Hub {
    pub fn new(config: Config, engine: Arc<dyn DetectionEngine>) -> Self {
        let registry = Arc::new(ProducerRegistry::new(
            config.ingest.max_frame_bytes,
            config.ingest.validate_image_format,
        ));
        let stats = Arc::new(StatsAggregator::new());
        let events = Arc::new(EventBus::new(config.events.channel_capacity));
        let coordinator = Arc::new(StreamCoordinator::new(
            config.coordinator.clone(),
            registry.clone(),
            engine.clone(),
            stats.clone(),
            events.clone(),
        ));
        info!(
            "Hub ready (detection engine: {}, max frame {} bytes)",
            engine.name(),
            config.ingest.max_frame_bytes
        );

        Self { config, registry, coordinator, stats, events }
    }

    pub async fn register_producer(
        &self,
        producer_id: &str,
        display_name: Option<&str>,
        client_type: Option<&str>,
        address: Option<String>,
    ) -> Result<RegisterOutcome> {
        if producer_id.trim().is_empty() {
            return Err(HubError::protocol("producer_id must not be empty"));
        }
        let outcome = self
            .registry
            .register(producer_id, display_name, client_type, address)
            .await;
        if outcome.created {
            self.events.publish(HubEvent::producer(producer_id, ProducerChange::Registered));
        } else if outcome.recovered {
            self.events.publish(HubEvent::producer(producer_id, ProducerChange::Recovered));
        }
        Ok(outcome)
    }

    pub async fn heartbeat(&self, producer_id: &str) -> Result<Liveness> {
        let liveness = self.registry.heartbeat(producer_id).await?;
        if liveness == Liveness::Recovered {
            self.events.publish(HubEvent::producer(producer_id, ProducerChange::Recovered));
        }
        Ok(liveness)
    }

    pub async fn report_camera(
        &self,
        producer_id: &str,
        camera_index: u32,
        properties: CameraProperties,
    ) -> Result<bool> {
        self.registry.report_camera(producer_id, camera_index, properties).await
    }

    /// Push one frame and account for the outcome. Unknown producers or cameras come back
    /// as errors and are counted; they never create state.
    pub async fn ingest_frame(
        &self,
        producer_id: &str,
        camera_index: u32,
        sequence: u64,
        payload: Bytes,
    ) -> Result<PushOutcome> {
        let size = payload.len();
        let result = self.registry.push_frame(producer_id, camera_index, sequence, payload).await;
        self.account(producer_id, camera_index, size, result)
    }

    /// Count a frame the transport could not hand over (too large to buffer, undecodable)
    /// with the same accounting as `ingest_frame`.
    pub async fn reject_frame(
        &self,
        producer_id: &str,
        camera_index: u32,
        reason: DropReason,
        size: usize,
    ) -> Result<PushOutcome> {
        let result = self.registry.reject_frame(producer_id, camera_index, reason).await;
        self.account(producer_id, camera_index, size, result)
    }

    fn account(
        &self,
        producer_id: &str,
        camera_index: u32,
        size: usize,
        result: Result<PushOutcome>,
    ) -> Result<PushOutcome> {
        match result {
            Ok(outcome) => {
                self.stats.record_push(&outcome);
                match outcome {
                    PushOutcome::Dropped(DropReason::Oversized) => warn!(
                        "Dropped oversized frame from {}/{}: {} bytes (limit {})",
                        producer_id, camera_index, size, self.config.ingest.max_frame_bytes
                    ),
                    PushOutcome::Dropped(DropReason::Malformed) => warn!(
                        "Dropped malformed frame from {}/{} ({} bytes)",
                        producer_id, camera_index, size
                    ),
                    PushOutcome::Dropped(DropReason::Closed) => debug!(
                        "Frame for {}/{} arrived while its camera was being removed",
                        producer_id, camera_index
                    ),
                    PushOutcome::Accepted { .. } => {}
                }
                Ok(outcome)
            }
            Err(e) => {
                self.stats.record_rejected_unknown();
                debug!("Rejected frame: {}", e);
                Err(e)
            }
        }
    }

    /// Record requested quality/fps and forward them to the producer.
    pub async fn update_camera_settings(
        &self,
        key: &CameraKey,
        quality: Option<u8>,
        fps: Option<u32>,
    ) -> Result<(u8, u32)> {
        let (quality, fps) = self.registry.update_settings(key, quality, fps).await?;
        let command = ServerMessage::UpdateStreamingSettings {
            camera_index: key.camera_index,
            quality,
            fps,
        };
        self.registry.send_command(&key.producer_id, command).await?;
        info!("Updated streaming settings for {}: quality {}, {} fps", key, quality, fps);
        Ok((quality, fps))
    }

    /// Remove a producer with its cameras and sessions. Evicting twice is a no-op.
    pub async fn evict(&self, producer_id: &str) -> bool {
        match self.registry.remove(producer_id).await {
            Some(entry) => {
                self.release(entry).await;
                true
            }
            None => {
                debug!("Evict for '{}' ignored, producer not registered", producer_id);
                false
            }
        }
    }

    /// Tear down an entry already taken out of the registry: sessions first, then slots.
    pub(crate) async fn release(&self, entry: Arc<ProducerEntry>) {
        let producer_id = entry.producer_id.clone();
        let stopped = self
            .coordinator
            .stop_all_for_producer(&producer_id, StopReason::ProducerEvicted)
            .await;
        let cameras = entry.camera_keys().await.len();
        entry.close().await;
        info!(
            "Evicted producer '{}' ({} cameras, {} sessions stopped)",
            producer_id, cameras, stopped
        );
        self.events.publish(HubEvent::producer(&producer_id, ProducerChange::Evicted));
    }

    pub async fn stats_snapshot(&self) -> StatsSnapshot {
        let sessions = self.coordinator.list().await;
        self.stats.snapshot(&self.registry, sessions).await
    }

    /// Publish a stats event every `events.stats_interval`.
    pub fn spawn_stats_publisher(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(hub.config.events.stats_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Started stats publisher every {:?}", hub.config.events.stats_interval);
            loop {
                ticker.tick().await;
                let snapshot = hub.stats_snapshot().await;
                hub.events.publish(HubEvent::Stats(Box::new(snapshot)));
            }
        })
    }

    /// Stop every session, then drop every producer.
    pub async fn shutdown(&self) {
        info!("Draining hub...");
        self.coordinator.shutdown().await;
        let producers = self.registry.list().await;
        for producer in producers {
            if let Some(entry) = self.registry.remove(&producer.producer_id).await {
                entry.close().await;
            }
        }
        info!("Hub drained");
    }
}
