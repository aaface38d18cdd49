use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::coordinator::SessionSnapshot;
use crate::detection::DetectionResult;
use crate::frame_slot::{DropReason, PushOutcome};
use crate::registry::{ProducerRegistry, ProducerStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropBreakdown {
    pub oversized: u64,
    pub malformed: u64,
    pub superseded: u64,
}

impl DropBreakdown {
    pub fn total(&self) -> u64 {
        self.oversized + self.malformed + self.superseded
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraIngestStats {
    pub producer_id: String,
    pub camera_index: u32,
    pub producer_status: ProducerStatus,
    pub frames_ingested: u64,
    pub frames_dropped: u64,
    pub drops: DropBreakdown,
    pub sessions_attached: usize,
    pub last_frame_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub active_producer_count: usize,
    pub stale_producer_count: usize,
    pub total_camera_count: usize,
    pub active_session_count: usize,
    pub frames_ingested_total: u64,
    pub frames_dropped_total: u64,
    pub drops: DropBreakdown,
    pub frames_rejected_unknown_total: u64,
    pub frames_analyzed_total: u64,
    pub detections_total: u64,
    pub detection_errors_total: u64,
    pub detection_counts: BTreeMap<String, u64>,
    pub sessions: Vec<SessionSnapshot>,
    pub cameras: Vec<CameraIngestStats>,
}

impl StatsSnapshot {
    pub fn camera(&self, producer_id: &str, camera_index: u32) -> Option<&CameraIngestStats> {
        self.cameras
            .iter()
            .find(|c| c.producer_id == producer_id && c.camera_index == camera_index)
    }
}

/// Monotonic counters fed by the ingest and coordination paths.
pub struct StatsAggregator {
    started_at: Instant,
    frames_ingested: AtomicU64,
    dropped_oversized: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_superseded: AtomicU64,
    rejected_unknown: AtomicU64,
    frames_analyzed: AtomicU64,
    detections: AtomicU64,
    detection_errors: AtomicU64,
    label_counts: RwLock<BTreeMap<String, u64>>,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            frames_ingested: AtomicU64::new(0),
            dropped_oversized: AtomicU64::new(0),
            dropped_malformed: AtomicU64::new(0),
            dropped_superseded: AtomicU64::new(0),
            rejected_unknown: AtomicU64::new(0),
            frames_analyzed: AtomicU64::new(0),
            detections: AtomicU64::new(0),
            detection_errors: AtomicU64::new(0),
            label_counts: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn record_push(&self, outcome: &PushOutcome) {
        match outcome {
            PushOutcome::Accepted { superseded_unread, .. } => {
                self.frames_ingested.fetch_add(1, Ordering::Relaxed);
                if *superseded_unread {
                    self.dropped_superseded.fetch_add(1, Ordering::Relaxed);
                }
            }
            PushOutcome::Dropped(DropReason::Oversized) => {
                self.dropped_oversized.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Dropped(DropReason::Malformed) => {
                self.dropped_malformed.fetch_add(1, Ordering::Relaxed);
            }
            // The camera went away between lookup and push.
            PushOutcome::Dropped(DropReason::Closed) => {
                self.rejected_unknown.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_rejected_unknown(&self) {
        self.rejected_unknown.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn record_analysis(&self, result: &DetectionResult) {
        self.frames_analyzed.fetch_add(1, Ordering::Relaxed);
        if result.is_empty() {
            return;
        }
        self.detections.fetch_add(result.count() as u64, Ordering::Relaxed);
        let mut labels = self.label_counts.write().await;
        for detection in &result.detections {
            *labels.entry(detection.label.clone()).or_insert(0) += 1;
        }
    }

    pub fn record_detection_error(&self) {
        self.detection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drops(&self) -> DropBreakdown {
        DropBreakdown {
            oversized: self.dropped_oversized.load(Ordering::Relaxed),
            malformed: self.dropped_malformed.load(Ordering::Relaxed),
            superseded: self.dropped_superseded.load(Ordering::Relaxed),
        }
    }

    pub fn rejected_unknown_total(&self) -> u64 {
        self.rejected_unknown.load(Ordering::Relaxed)
    }

    pub fn frames_ingested_total(&self) -> u64 {
        self.frames_ingested.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Copy of every counter plus gauges derived from the registry at this moment.
    pub async fn snapshot(&self, registry: &ProducerRegistry, sessions: Vec<SessionSnapshot>) -> StatsSnapshot {
        let producers = registry.list().await;
        let mut cameras = Vec::new();
        let mut active_producer_count = 0;
        let mut stale_producer_count = 0;

        for producer in &producers {
            match producer.status {
                ProducerStatus::Active => active_producer_count += 1,
                ProducerStatus::Stale => stale_producer_count += 1,
            }
            for camera in &producer.cameras {
                let drops = DropBreakdown {
                    oversized: camera.counters.oversized,
                    malformed: camera.counters.malformed,
                    superseded: camera.counters.superseded,
                };
                cameras.push(CameraIngestStats {
                    producer_id: producer.producer_id.clone(),
                    camera_index: camera.camera_index,
                    producer_status: producer.status,
                    frames_ingested: camera.counters.accepted,
                    frames_dropped: drops.total(),
                    drops,
                    sessions_attached: camera.sessions_attached,
                    last_frame_at: camera.last_frame_at,
                });
            }
        }

        let drops = self.drops();
        let snapshot = StatsSnapshot {
            timestamp: Utc::now(),
            uptime_secs: self.uptime_secs(),
            active_producer_count,
            stale_producer_count,
            total_camera_count: cameras.len(),
            active_session_count: sessions.iter().filter(|s| s.active).count(),
            frames_ingested_total: self.frames_ingested_total(),
            frames_dropped_total: drops.total(),
            drops,
            frames_rejected_unknown_total: self.rejected_unknown.load(Ordering::Relaxed),
            frames_analyzed_total: self.frames_analyzed.load(Ordering::Relaxed),
            detections_total: self.detections.load(Ordering::Relaxed),
            detection_errors_total: self.detection_errors.load(Ordering::Relaxed),
            detection_counts: self.label_counts.read().await.clone(),
            sessions,
            cameras,
        };
        debug!(
            "Stats: {} producers, {} cameras, {} sessions, {} ingested, {} dropped",
            snapshot.active_producer_count + snapshot.stale_producer_count,
            snapshot.total_camera_count,
            snapshot.active_session_count,
            snapshot.frames_ingested_total,
            snapshot.frames_dropped_total
        );
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Detection;
    use crate::registry::CameraProperties;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_push_outcomes_feed_counters() {
        let stats = StatsAggregator::new();
        stats.record_push(&PushOutcome::Accepted { generation: 1, superseded_unread: false });
        stats.record_push(&PushOutcome::Accepted { generation: 2, superseded_unread: true });
        stats.record_push(&PushOutcome::Dropped(DropReason::Oversized));
        stats.record_push(&PushOutcome::Dropped(DropReason::Malformed));
        stats.record_push(&PushOutcome::Dropped(DropReason::Closed));
        stats.record_rejected_unknown();

        let registry = ProducerRegistry::new(1024, true);
        let snapshot = stats.snapshot(&registry, Vec::new()).await;
        assert_eq!(snapshot.frames_ingested_total, 2);
        assert_eq!(snapshot.frames_dropped_total, 3);
        assert_eq!(snapshot.drops, DropBreakdown { oversized: 1, malformed: 1, superseded: 1 });
        assert_eq!(snapshot.frames_rejected_unknown_total, 2);
    }

    #[tokio::test]
    async fn test_analysis_counts_labels() {
        let stats = StatsAggregator::new();
        let result = DetectionResult {
            detections: vec![
                Detection { label: "person".into(), confidence: 0.9, bbox: None },
                Detection { label: "person".into(), confidence: 0.8, bbox: None },
                Detection { label: "car".into(), confidence: 0.7, bbox: None },
            ],
        };
        stats.record_analysis(&result).await;
        stats.record_analysis(&DetectionResult::default()).await;
        stats.record_detection_error();

        let registry = ProducerRegistry::new(1024, true);
        let snapshot = stats.snapshot(&registry, Vec::new()).await;
        assert_eq!(snapshot.frames_analyzed_total, 2);
        assert_eq!(snapshot.detections_total, 3);
        assert_eq!(snapshot.detection_errors_total, 1);
        assert_eq!(snapshot.detection_counts.get("person"), Some(&2));
    }

    #[tokio::test]
    async fn test_snapshot_reads_registry_gauges() {
        let registry = ProducerRegistry::new(1024, false);
        registry.register("cam-a", None, None, None).await;
        registry.register("cam-b", None, None, None).await;
        let props = CameraProperties { width: 640, height: 480, fps: 10, ..Default::default() };
        registry.report_camera("cam-a", 0, props.clone()).await.unwrap();
        registry.report_camera("cam-a", 1, props).await.unwrap();
        registry.push_frame("cam-a", 1, 1, Bytes::from_static(b"raw")).await.unwrap();

        let snapshot = StatsAggregator::new().snapshot(&registry, Vec::new()).await;
        assert_eq!(snapshot.active_producer_count, 2);
        assert_eq!(snapshot.total_camera_count, 2);
        assert_eq!(snapshot.camera("cam-a", 1).unwrap().frames_ingested, 1);
        assert!(snapshot.camera("cam-b", 0).is_none());
    }
}
