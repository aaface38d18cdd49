mod common;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use camera_feed_hub::coordinator::{SessionRequest, StartOutcome, StopOutcome};
use camera_feed_hub::detection::{AnalysisRequest, DetectionEngine, DetectionResult, NullEngine};
use camera_feed_hub::errors::{HubError, Result as HubResult};
use camera_feed_hub::frame_slot::{Frame, FrameSlot};
use camera_feed_hub::reaper::HealthReaper;
use camera_feed_hub::registry::{CameraKey, ProducerStatus};
use tokio::time::Instant;

use common::{hub, hub_with, jpeg, producer};

#[test]
fn test_freshness_last_push_wins_for_any_sequence() {
    for count in [1u64, 2, 7, 64, 513] {
        let slot = FrameSlot::new(1024, true);
        for seq in 0..count {
            slot.push(Frame::new("cam-a", 0, seq, jpeg(seq as u8)));
        }
        let latest = slot.take_latest().expect("frame after pushes");
        assert_eq!(latest.sequence, count - 1);
        assert_eq!(latest.payload, jpeg((count - 1) as u8));
    }
}

#[test]
fn test_push_without_reader_holds_one_frame() {
    let slot = FrameSlot::new(1024, true);
    let started = std::time::Instant::now();
    for seq in 0..50_000u64 {
        assert!(slot.push(Frame::new("cam-a", 0, seq, jpeg(1))).is_accepted());
    }
    assert!(started.elapsed() < Duration::from_secs(5));

    let held = slot.peek().expect("latest frame");
    // One reference in the slot, one here: nothing else is retained.
    assert_eq!(Arc::strong_count(&held), 2);
}

#[tokio::test]
async fn test_at_most_one_session_per_camera() {
    let hub = hub();
    producer(&hub, "cam-a", 1).await;
    let key = CameraKey::new("cam-a", 0);

    let first = hub.coordinator.start(key.clone(), SessionRequest::default()).await;
    let second = hub.coordinator.start(key.clone(), SessionRequest::default()).await;
    assert!(matches!(first, StartOutcome::Started(_)));
    assert!(matches!(second, StartOutcome::AlreadyActive(_)));
    assert_eq!(hub.coordinator.list().await.len(), 1);

    assert!(matches!(hub.coordinator.stop(&key).await, StopOutcome::Stopped(_)));
    assert!(matches!(hub.coordinator.stop(&key).await, StopOutcome::NotActive));
}

#[tokio::test]
async fn test_eviction_cascades_to_cameras_and_sessions() {
    let hub = hub();
    producer(&hub, "cam-a", 2).await;
    let started = hub
        .coordinator
        .start(CameraKey::new("cam-a", 1), SessionRequest::default())
        .await;
    assert!(matches!(started, StartOutcome::Started(_)));

    assert!(hub.evict("cam-a").await);

    assert_eq!(hub.coordinator.active_count().await, 0);
    assert!(hub.registry.get("cam-a").await.is_none());
    for index in 0..2 {
        let err = hub.ingest_frame("cam-a", index, 1, jpeg(1)).await.unwrap_err();
        assert!(err.is_unknown_entity(), "unexpected error {}", err);
    }
    // Evicting again is a no-op.
    assert!(!hub.evict("cam-a").await);
}

#[tokio::test]
async fn test_heartbeat_state_machine() {
    let hub = hub_with(Arc::new(NullEngine), |config| {
        config.health.heartbeat_timeout = Duration::from_secs(10);
        config.health.grace_period = Duration::from_secs(20);
    });
    producer(&hub, "cam-a", 1).await;
    hub.ingest_frame("cam-a", 0, 1, jpeg(9)).await.unwrap();
    let key = CameraKey::new("cam-a", 0);
    hub.coordinator.start(key.clone(), SessionRequest::default()).await;

    let reaper = HealthReaper::new(hub.clone());
    let t0 = Instant::now();

    let report = reaper.sweep(t0 + Duration::from_secs(10)).await;
    assert_eq!(report.marked_stale, vec!["cam-a".to_string()]);
    let snapshot = hub.registry.get("cam-a").await.unwrap();
    assert_eq!(snapshot.status, ProducerStatus::Stale);
    // Stale is non-destructive.
    assert_eq!(snapshot.cameras.len(), 1);
    assert!(hub.coordinator.is_active(&key).await);

    // A heartbeat before eviction restores the producer with its data.
    hub.registry
        .heartbeat_at("cam-a", t0 + Duration::from_secs(25))
        .await
        .unwrap();
    let snapshot = hub.registry.get("cam-a").await.unwrap();
    assert_eq!(snapshot.status, ProducerStatus::Active);
    assert_eq!(snapshot.cameras[0].last_sequence, Some(1));
    assert!(hub.coordinator.is_active(&key).await);

    // Silent again for timeout + grace after that heartbeat: evicted.
    let report = reaper.sweep(t0 + Duration::from_secs(25 + 30)).await;
    assert_eq!(report.evicted, vec!["cam-a".to_string()]);
    assert!(hub.registry.get("cam-a").await.is_none());
    assert!(!hub.coordinator.is_active(&key).await);
}

/// Counts analysed frames per camera.
#[derive(Default)]
struct CountingEngine {
    calls: AtomicU64,
}

#[async_trait]
impl DetectionEngine for CountingEngine {
    async fn analyze(&self, _frame: &Frame, _request: &AnalysisRequest) -> HubResult<DetectionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(DetectionResult::default())
    }

    fn name(&self) -> &str {
        "counting"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fast_and_slow_producers_are_independent() {
    let engine = Arc::new(CountingEngine::default());
    let hub = hub_with(engine.clone(), |config| {
        config.coordinator.max_poll_fps = 200;
    });
    producer(&hub, "camA", 1).await;
    producer(&hub, "camB", 1).await;

    // Rates scaled 20x: camA pushes at 200/s, camB at 40/s, the session polls camA at 100/s.
    let request = SessionRequest { poll_fps: Some(100), ..Default::default() };
    let started = hub.coordinator.start(CameraKey::new("camA", 0), request).await;
    assert!(matches!(started, StartOutcome::Started(_)));

    let pusher = |producer_id: &'static str, every: Duration| {
        let hub = hub.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            for seq in 0..100u64 {
                ticker.tick().await;
                hub.ingest_frame(producer_id, 0, seq, jpeg(seq as u8)).await.unwrap();
            }
        })
    };
    let fast = pusher("camA", Duration::from_millis(5));
    let slow = pusher("camB", Duration::from_millis(25));
    fast.await.unwrap();
    let analyzed_when_fast_done = engine.calls.load(Ordering::SeqCst);
    slow.await.unwrap();

    // camA's session made progress while camB was still trickling frames in.
    assert!(analyzed_when_fast_done >= 10, "only {} frames analysed", analyzed_when_fast_done);

    let stats = hub.stats_snapshot().await;
    let cam_a = stats.camera("camA", 0).unwrap();
    let cam_b = stats.camera("camB", 0).unwrap();
    assert_eq!(cam_a.frames_ingested, 100);
    assert!(cam_a.frames_dropped > 0, "camA outpaces its poll rate");
    assert_eq!(cam_b.frames_ingested, 100);
    assert_eq!(cam_b.frames_dropped, 0);
    assert!(stats.frames_dropped_total > 0);

    hub.shutdown().await;
}

/// Analysis that takes a long time, tracking how many calls are still running.
#[derive(Default)]
struct SlowEngine {
    calls: AtomicU64,
    in_flight: Arc<AtomicUsize>,
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DetectionEngine for SlowEngine {
    async fn analyze(&self, _frame: &Frame, _request: &AnalysisRequest) -> HubResult<DetectionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight(self.in_flight.clone());
        tokio::time::sleep(Duration::from_millis(500)).await;
        Err(HubError::detection("too slow to matter"))
    }

    fn name(&self) -> &str {
        "slow"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_mid_poll_leaves_no_task_behind() {
    let engine = Arc::new(SlowEngine::default());
    let hub = hub_with(engine.clone(), |config| {
        config.coordinator.default_poll_fps = 30;
    });
    producer(&hub, "cam-a", 1).await;
    let key = CameraKey::new("cam-a", 0);
    hub.ingest_frame("cam-a", 0, 1, jpeg(1)).await.unwrap();
    hub.coordinator.start(key.clone(), SessionRequest::default()).await;

    // Wait until the engine is busy with the first frame.
    let deadline = Instant::now() + Duration::from_secs(2);
    while engine.in_flight.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "session never called the engine");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let stopped_at = Instant::now();
    assert!(matches!(hub.coordinator.stop(&key).await, StopOutcome::Stopped(_)));
    assert!(stopped_at.elapsed() < Duration::from_millis(400), "stop waited for the engine");
    tokio::task::yield_now().await;
    assert_eq!(engine.in_flight.load(Ordering::SeqCst), 0);

    let calls = engine.calls.load(Ordering::SeqCst);
    for seq in 2..10 {
        hub.ingest_frame("cam-a", 0, seq, jpeg(seq as u8)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(engine.calls.load(Ordering::SeqCst), calls);
    assert_eq!(hub.registry.get("cam-a").await.unwrap().cameras[0].sessions_attached, 0);
}

#[tokio::test]
async fn test_engine_failures_are_counted_not_fatal() {
    let engine = Arc::new(SlowEngine::default());
    let hub = hub_with(engine, |config| {
        config.coordinator.default_poll_fps = 30;
    });
    producer(&hub, "cam-a", 1).await;
    let key = CameraKey::new("cam-a", 0);
    hub.coordinator.start(key.clone(), SessionRequest::default()).await;

    for seq in 0..3u64 {
        hub.ingest_frame("cam-a", 0, seq, jpeg(seq as u8)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(550)).await;
    }

    let session = hub.coordinator.session(&key).await.unwrap();
    assert!(session.active);
    assert!(session.errors_total >= 2);
    assert!(hub.stats_snapshot().await.detection_errors_total >= 2);
    hub.coordinator.stop(&key).await;
}
