#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use camera_feed_hub::detection::{DetectionEngine, NullEngine};
use camera_feed_hub::registry::CameraProperties;
use camera_feed_hub::{Config, Hub};

/// Smallest byte string that sniffs as a JPEG; `tag` makes payloads distinguishable.
pub fn jpeg(tag: u8) -> Bytes {
    Bytes::from(vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, tag, 0xFF, 0xD9])
}

pub fn camera(width: u32, height: u32, fps: u32) -> CameraProperties {
    CameraProperties { width, height, fps, ..Default::default() }
}

pub fn hub_with(engine: Arc<dyn DetectionEngine>, tweak: impl FnOnce(&mut Config)) -> Arc<Hub> {
    let mut config = Config::default();
    tweak(&mut config);
    Arc::new(Hub::new(config, engine))
}

pub fn hub() -> Arc<Hub> {
    hub_with(Arc::new(NullEngine), |_| {})
}

/// Register `producer_id` with cameras `0..cameras`.
pub async fn producer(hub: &Hub, producer_id: &str, cameras: u32) {
    hub.register_producer(producer_id, None, None, None)
        .await
        .expect("register");
    for index in 0..cameras {
        hub.report_camera(producer_id, index, camera(640, 480, 15))
            .await
            .expect("report camera");
    }
}
