//! Analysis sessions: at most one per camera, each polling its camera's slot on its own
//! schedule and handing fresh frames to the detection engine.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::CoordinatorConfig;
use crate::detection::{AnalysisRequest, DetectionEngine, TargetClasses};
use crate::events::{DetectionEvent, EventBus, HubEvent, SessionState, StopReason};
use crate::protocol::{ServerMessage, StreamingSettings};
use crate::registry::{CameraEntry, CameraKey, ProducerRegistry};
use crate::stats::StatsAggregator;

/// Parameters of a start request; unset values fall back to the coordinator defaults.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub confidence_threshold: Option<f32>,
    pub target_classes: TargetClasses,
    pub poll_fps: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub producer_id: String,
    pub camera_index: u32,
    pub active: bool,
    pub confidence_threshold: f32,
    pub target_classes: TargetClasses,
    pub poll_fps: u32,
    pub started_at: DateTime<Utc>,
    pub frames_analyzed: u64,
    pub detections_total: u64,
    pub errors_total: u64,
    pub last_frame_generation: u64,
    pub last_analyzed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started(SessionSnapshot),
    /// A session already runs for this camera; it is left untouched.
    AlreadyActive(SessionSnapshot),
    UnknownCamera,
}

#[derive(Debug, Clone)]
pub enum StopOutcome {
    Stopped(SessionSnapshot),
    NotActive,
}

#[derive(Default)]
struct SessionCounters {
    frames_analyzed: AtomicU64,
    detections: AtomicU64,
    errors: AtomicU64,
    last_generation: AtomicU64,
    last_analyzed_ms: AtomicI64,
}

/// Newest detection events of one session, oldest first.
struct RecentDetections {
    capacity: usize,
    events: RwLock<VecDeque<DetectionEvent>>,
}

impl RecentDetections {
    fn new(capacity: usize) -> Self {
        Self { capacity, events: RwLock::new(VecDeque::with_capacity(capacity)) }
    }

    async fn record(&self, event: DetectionEvent) {
        if self.capacity == 0 {
            return;
        }
        let mut events = self.events.write().await;
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Up to `limit` events, newest first.
    async fn latest(&self, limit: usize) -> Vec<DetectionEvent> {
        self.events.read().await.iter().rev().take(limit).cloned().collect()
    }
}

struct Session {
    key: CameraKey,
    request: AnalysisRequest,
    poll_fps: u32,
    started_at: DateTime<Utc>,
    active: Arc<AtomicBool>,
    counters: Arc<SessionCounters>,
    recent: Arc<RecentDetections>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Session {
    fn snapshot(&self) -> SessionSnapshot {
        let last_ms = self.counters.last_analyzed_ms.load(Ordering::Relaxed);
        SessionSnapshot {
            producer_id: self.key.producer_id.clone(),
            camera_index: self.key.camera_index,
            active: self.active.load(Ordering::Acquire),
            confidence_threshold: self.request.confidence_threshold,
            target_classes: self.request.target_classes.clone(),
            poll_fps: self.poll_fps,
            started_at: self.started_at,
            frames_analyzed: self.counters.frames_analyzed.load(Ordering::Relaxed),
            detections_total: self.counters.detections.load(Ordering::Relaxed),
            errors_total: self.counters.errors.load(Ordering::Relaxed),
            last_frame_generation: self.counters.last_generation.load(Ordering::Relaxed),
            last_analyzed_at: if last_ms > 0 { DateTime::from_timestamp_millis(last_ms) } else { None },
        }
    }

    /// Signal the loop, wait up to `timeout` for it to finish, then abort it.
    async fn halt(mut self, timeout: Duration) -> SessionSnapshot {
        self.active.store(false, Ordering::Release);
        let _ = self.cancel.send(true);

        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if e.is_panic() {
                    error!("Session {} task panicked: {}", self.key, e);
                }
            }
            Err(_) => {
                warn!("Session {} did not stop within {:?}, aborting", self.key, timeout);
                self.task.abort();
                let _ = (&mut self.task).await;
            }
        }
        self.snapshot()
    }
}

pub struct StreamCoordinator {
    sessions: Mutex<HashMap<CameraKey, Session>>,
    registry: Arc<ProducerRegistry>,
    engine: Arc<dyn DetectionEngine>,
    stats: Arc<StatsAggregator>,
    events: Arc<EventBus>,
    config: CoordinatorConfig,
}

impl StreamCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<ProducerRegistry>,
        engine: Arc<dyn DetectionEngine>,
        stats: Arc<StatsAggregator>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            registry,
            engine,
            stats,
            events,
            config,
        }
    }

    fn effective_poll_fps(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.config.default_poll_fps)
            .clamp(1, self.config.max_poll_fps.max(1))
    }

    pub async fn start(&self, key: CameraKey, request: SessionRequest) -> StartOutcome {
        let camera;
        let snapshot;
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(existing) = sessions.get(&key) {
                debug!("Session for {} already active, start rejected", key);
                return StartOutcome::AlreadyActive(existing.snapshot());
            }

            // Looked up under the session lock so an eviction in progress either hides the
            // camera from us or stops the session we insert.
            camera = match self.registry.camera(&key).await {
                Ok(camera) => camera,
                Err(e) => {
                    debug!("Cannot start session: {}", e);
                    return StartOutcome::UnknownCamera;
                }
            };

            let analysis = AnalysisRequest {
                confidence_threshold: request
                    .confidence_threshold
                    .unwrap_or(self.config.default_confidence)
                    .clamp(0.0, 1.0),
                target_classes: request.target_classes,
            };
            let poll_fps = self.effective_poll_fps(request.poll_fps);
            let active = Arc::new(AtomicBool::new(true));
            let counters = Arc::new(SessionCounters::default());
            let recent = Arc::new(RecentDetections::new(self.config.recent_detections));
            let (cancel, cancel_rx) = watch::channel(false);

            let session_loop = SessionLoop {
                key: key.clone(),
                camera: camera.clone(),
                engine: self.engine.clone(),
                stats: self.stats.clone(),
                events: self.events.clone(),
                request: analysis.clone(),
                period: Duration::from_secs_f64(1.0 / poll_fps as f64),
                active: active.clone(),
                counters: counters.clone(),
                recent: recent.clone(),
            };
            let task = tokio::spawn(session_loop.run(cancel_rx));

            let session = Session {
                key: key.clone(),
                request: analysis,
                poll_fps,
                started_at: Utc::now(),
                active,
                counters,
                recent,
                cancel,
                task,
            };
            snapshot = session.snapshot();
            sessions.insert(key.clone(), session);
        }

        info!(
            "Started analysis session for {} at {} fps (confidence {:.2})",
            key, snapshot.poll_fps, snapshot.confidence_threshold
        );

        let (quality, fps) = camera.streaming_settings().await;
        let command = ServerMessage::StartStreaming {
            camera_index: key.camera_index,
            settings: StreamingSettings { quality, fps },
        };
        if let Err(e) = self.registry.send_command(&key.producer_id, command).await {
            debug!("start_streaming not delivered for {}: {}", key, e);
        }
        self.events.publish(HubEvent::session(
            &key.producer_id,
            key.camera_index,
            SessionState::Started,
            None,
        ));

        StartOutcome::Started(snapshot)
    }

    /// Stop one session. The session's task has ended when this returns.
    pub async fn stop(&self, key: &CameraKey) -> StopOutcome {
        let session = { self.sessions.lock().await.remove(key) };
        let Some(session) = session else {
            debug!("Stop for {} ignored, no active session", key);
            return StopOutcome::NotActive;
        };

        let snapshot = session.halt(self.config.stop_timeout).await;
        info!(
            "Stopped analysis session for {} after {} frames",
            key, snapshot.frames_analyzed
        );

        let command = ServerMessage::StopStreaming { camera_index: key.camera_index };
        if let Err(e) = self.registry.send_command(&key.producer_id, command).await {
            debug!("stop_streaming not delivered for {}: {}", key, e);
        }
        self.events.publish(HubEvent::session(
            &key.producer_id,
            key.camera_index,
            SessionState::Stopped,
            Some(StopReason::Requested),
        ));
        StopOutcome::Stopped(snapshot)
    }

    /// Stop every session whose camera belongs to `producer_id`. Returns how many stopped.
    pub async fn stop_all_for_producer(&self, producer_id: &str, reason: StopReason) -> usize {
        let drained: Vec<Session> = {
            let mut sessions = self.sessions.lock().await;
            let keys: Vec<CameraKey> = sessions
                .keys()
                .filter(|k| k.producer_id == producer_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| sessions.remove(k)).collect()
        };
        self.halt_all(drained, reason).await
    }

    /// Stop everything; used on service shutdown.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<Session> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        let count = self.halt_all(drained, StopReason::Shutdown).await;
        if count > 0 {
            info!("Stopped {} analysis sessions on shutdown", count);
        }
        count
    }

    async fn halt_all(&self, sessions: Vec<Session>, reason: StopReason) -> usize {
        let timeout = self.config.stop_timeout;
        let stopped = join_all(sessions.into_iter().map(|s| s.halt(timeout))).await;
        for snapshot in &stopped {
            info!(
                "Stopped analysis session for {}/{} ({:?})",
                snapshot.producer_id, snapshot.camera_index, reason
            );
            self.events.publish(HubEvent::session(
                &snapshot.producer_id,
                snapshot.camera_index,
                SessionState::Stopped,
                Some(reason),
            ));
        }
        stopped.len()
    }

    pub async fn session(&self, key: &CameraKey) -> Option<SessionSnapshot> {
        self.sessions.lock().await.get(key).map(Session::snapshot)
    }

    /// Newest detection events of the session on `key`, at most `limit`. `None` when no
    /// session runs for the camera.
    pub async fn recent_detections(&self, key: &CameraKey, limit: Option<usize>) -> Option<Vec<DetectionEvent>> {
        let recent = self.sessions.lock().await.get(key).map(|s| s.recent.clone())?;
        let limit = limit.unwrap_or(self.config.recent_detections);
        Some(recent.latest(limit).await)
    }

    pub async fn list(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> =
            self.sessions.lock().await.values().map(Session::snapshot).collect();
        snapshots.sort_by(|a, b| {
            (a.producer_id.as_str(), a.camera_index).cmp(&(b.producer_id.as_str(), b.camera_index))
        });
        snapshots
    }

    pub async fn active_count(&self) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|s| s.active.load(Ordering::Acquire))
            .count()
    }

    pub async fn is_active(&self, key: &CameraKey) -> bool {
        self.sessions
            .lock()
            .await
            .get(key)
            .map(|s| s.active.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

/// Everything one session's polling task owns.
struct SessionLoop {
    key: CameraKey,
    camera: Arc<CameraEntry>,
    engine: Arc<dyn DetectionEngine>,
    stats: Arc<StatsAggregator>,
    events: Arc<EventBus>,
    request: AnalysisRequest,
    period: Duration,
    active: Arc<AtomicBool>,
    counters: Arc<SessionCounters>,
    recent: Arc<RecentDetections>,
}

impl SessionLoop {
    async fn run(self, mut cancel: watch::Receiver<bool>) {
        let _reader = self.camera.slot.attach_reader();
        let mut changes = self.camera.slot.changes();
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_generation = 0u64;

        trace!("Session loop for {} running every {:?}", self.key, self.period);

        loop {
            if !self.active.load(Ordering::Acquire) {
                break;
            }
            tokio::select! {
                _ = cancel.changed() => break,
                _ = ticker.tick() => {}
            }
            if !self.active.load(Ordering::Acquire) {
                break;
            }
            if self.camera.slot.is_closed() {
                debug!("Slot for {} closed, session loop ending", self.key);
                break;
            }

            changes.mark_seen();
            let frame = match self.camera.slot.take_latest() {
                Some(frame) if frame.generation > last_generation => frame,
                _ => {
                    // Nothing new since the last poll: wait for the producer instead of
                    // resubmitting the same frame.
                    tokio::select! {
                        _ = cancel.changed() => break,
                        alive = changes.changed() => {
                            if !alive {
                                break;
                            }
                        }
                    }
                    continue;
                }
            };
            last_generation = frame.generation;
            self.counters.last_generation.store(frame.generation, Ordering::Relaxed);

            let result = tokio::select! {
                _ = cancel.changed() => break,
                result = self.engine.analyze(&frame, &self.request) => result,
            };

            match result {
                Ok(result) => {
                    self.counters.frames_analyzed.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .last_analyzed_ms
                        .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                    self.stats.record_analysis(&result).await;

                    if !result.is_empty() {
                        let count = result.count();
                        self.counters.detections.fetch_add(count as u64, Ordering::Relaxed);
                        debug!("{} detections on {} (generation {})", count, self.key, frame.generation);
                        let event = DetectionEvent {
                            producer_id: self.key.producer_id.clone(),
                            camera_index: self.key.camera_index,
                            timestamp: Utc::now(),
                            frame_sequence: frame.sequence,
                            frame_generation: frame.generation,
                            detection_count: count,
                            results: result,
                        };
                        self.recent.record(event.clone()).await;
                        self.events.publish(HubEvent::Detection(event));
                    }
                }
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    self.stats.record_detection_error();
                    warn!(
                        "Detection failed for {} (generation {}): {}",
                        self.key, frame.generation, e
                    );
                }
            }
        }

        self.active.store(false, Ordering::Release);
        trace!("Session loop for {} finished", self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{Detection, DetectionResult, NullEngine};
    use crate::errors::{HubError, Result as HubResult};
    use crate::frame_slot::Frame;
    use crate::registry::CameraProperties;
    use async_trait::async_trait;
    use bytes::Bytes;

    /// Fails every other frame and reports one "person" otherwise.
    #[derive(Default)]
    struct FlakyEngine {
        calls: AtomicU64,
    }

    #[async_trait]
    impl DetectionEngine for FlakyEngine {
        async fn analyze(&self, _frame: &Frame, _request: &AnalysisRequest) -> HubResult<DetectionResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                Err(HubError::detection("model crashed"))
            } else {
                Ok(DetectionResult {
                    detections: vec![Detection { label: "person".into(), confidence: 0.9, bbox: None }],
                })
            }
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    async fn setup(engine: Arc<dyn DetectionEngine>) -> (Arc<ProducerRegistry>, StreamCoordinator, Arc<EventBus>) {
        let registry = Arc::new(ProducerRegistry::new(1024, false));
        registry.register("cam-a", None, None, None).await;
        let props = CameraProperties { width: 640, height: 480, fps: 30, ..Default::default() };
        registry.report_camera("cam-a", 0, props).await.unwrap();
        let events = Arc::new(EventBus::new(64));
        let config = CoordinatorConfig { default_poll_fps: 20, ..Default::default() };
        let coordinator = StreamCoordinator::new(
            config,
            registry.clone(),
            engine,
            Arc::new(StatsAggregator::new()),
            events.clone(),
        );
        (registry, coordinator, events)
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (_registry, coordinator, _events) = setup(Arc::new(NullEngine)).await;
        let key = CameraKey::new("cam-a", 0);

        assert!(matches!(
            coordinator.start(key.clone(), SessionRequest::default()).await,
            StartOutcome::Started(_)
        ));
        assert!(matches!(
            coordinator.start(key.clone(), SessionRequest::default()).await,
            StartOutcome::AlreadyActive(_)
        ));
        assert_eq!(coordinator.active_count().await, 1);

        assert!(matches!(coordinator.stop(&key).await, StopOutcome::Stopped(_)));
        assert!(matches!(coordinator.stop(&key).await, StopOutcome::NotActive));
        assert_eq!(coordinator.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_camera() {
        let (_registry, coordinator, _events) = setup(Arc::new(NullEngine)).await;
        let outcome = coordinator.start(CameraKey::new("cam-a", 5), SessionRequest::default()).await;
        assert!(matches!(outcome, StartOutcome::UnknownCamera));
        let outcome = coordinator.start(CameraKey::new("nobody", 0), SessionRequest::default()).await;
        assert!(matches!(outcome, StartOutcome::UnknownCamera));
    }

    #[tokio::test]
    async fn test_poll_rate_is_clamped() {
        let (_registry, coordinator, _events) = setup(Arc::new(NullEngine)).await;
        let request = SessionRequest { poll_fps: Some(500), ..Default::default() };
        match coordinator.start(CameraKey::new("cam-a", 0), request).await {
            StartOutcome::Started(snapshot) => assert_eq!(snapshot.poll_fps, 30),
            other => panic!("unexpected {:?}", other),
        }
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_engine_errors_do_not_end_session() {
        let (registry, coordinator, events) = setup(Arc::new(FlakyEngine::default())).await;
        let mut rx = events.subscribe();
        let key = CameraKey::new("cam-a", 0);
        coordinator.start(key.clone(), SessionRequest::default()).await;

        for seq in 0..8u64 {
            registry.push_frame("cam-a", 0, seq, Bytes::from(vec![seq as u8 + 1])).await.unwrap();
            tokio::time::sleep(Duration::from_millis(70)).await;
        }

        let snapshot = coordinator.session(&key).await.unwrap();
        assert!(snapshot.active);
        assert!(snapshot.errors_total >= 1);
        assert!(snapshot.frames_analyzed >= 1);

        let mut saw_detection = false;
        while let Ok(event) = rx.try_recv() {
            if let HubEvent::Detection(d) = event {
                assert_eq!(d.detection_count, 1);
                saw_detection = true;
            }
        }
        assert!(saw_detection);
        coordinator.stop(&key).await;
    }

    #[tokio::test]
    async fn test_recent_detections_keep_newest() {
        let (registry, _unused, events) = setup(Arc::new(FlakyEngine::default())).await;
        let config = CoordinatorConfig { default_poll_fps: 20, recent_detections: 2, ..Default::default() };
        let coordinator = StreamCoordinator::new(
            config,
            registry.clone(),
            Arc::new(FlakyEngine::default()),
            Arc::new(StatsAggregator::new()),
            events,
        );
        let key = CameraKey::new("cam-a", 0);
        assert!(coordinator.recent_detections(&key, None).await.is_none());
        coordinator.start(key.clone(), SessionRequest::default()).await;

        for seq in 1..=10u64 {
            registry.push_frame("cam-a", 0, seq, Bytes::from(vec![seq as u8])).await.unwrap();
            tokio::time::sleep(Duration::from_millis(70)).await;
        }

        let recent = coordinator.recent_detections(&key, None).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].frame_generation > recent[1].frame_generation);
        let one = coordinator.recent_detections(&key, Some(1)).await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].frame_generation, recent[0].frame_generation);

        coordinator.stop(&key).await;
        assert!(coordinator.recent_detections(&key, None).await.is_none());
    }

    #[tokio::test]
    async fn test_same_frame_is_not_resubmitted() {
        let (registry, coordinator, _events) = setup(Arc::new(NullEngine)).await;
        let key = CameraKey::new("cam-a", 0);
        registry.push_frame("cam-a", 0, 1, Bytes::from_static(b"one")).await.unwrap();
        coordinator.start(key.clone(), SessionRequest::default()).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        let snapshot = coordinator.session(&key).await.unwrap();
        assert_eq!(snapshot.frames_analyzed, 1);
        assert_eq!(snapshot.last_frame_generation, 1);
        coordinator.stop(&key).await;
    }

    #[tokio::test]
    async fn test_stop_all_for_producer() {
        let (registry, coordinator, _events) = setup(Arc::new(NullEngine)).await;
        let props = CameraProperties { width: 320, height: 240, fps: 5, ..Default::default() };
        registry.report_camera("cam-a", 1, props).await.unwrap();
        coordinator.start(CameraKey::new("cam-a", 0), SessionRequest::default()).await;
        coordinator.start(CameraKey::new("cam-a", 1), SessionRequest::default()).await;

        assert_eq!(coordinator.stop_all_for_producer("cam-a", StopReason::ProducerEvicted).await, 2);
        assert!(coordinator.list().await.is_empty());
    }
}
