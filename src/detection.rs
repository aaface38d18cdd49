//! Boundary to the external detection engine.
//!
//! The hub never looks inside a result beyond counting and filtering detections.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, info};
use url::Url;

use crate::config::DetectionConfig;
use crate::errors::{HubError, Result};
use crate::frame_slot::Frame;

/// Which labels a session cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TargetClasses {
    #[default]
    All,
    Only(BTreeSet<String>),
}

impl TargetClasses {
    /// `None`, an empty list or a list containing "all" mean every class.
    pub fn from_labels(labels: Option<Vec<String>>) -> Self {
        let labels: BTreeSet<String> = labels
            .unwrap_or_default()
            .into_iter()
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty())
            .collect();
        if labels.is_empty() || labels.contains("all") {
            TargetClasses::All
        } else {
            TargetClasses::Only(labels)
        }
    }

    pub fn accepts(&self, label: &str) -> bool {
        match self {
            TargetClasses::All => true,
            TargetClasses::Only(labels) => labels.contains(&label.to_lowercase()),
        }
    }
}

impl Serialize for TargetClasses {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            TargetClasses::All => serializer.serialize_str("all"),
            TargetClasses::Only(labels) => serializer.collect_seq(labels),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRequest {
    pub confidence_threshold: f32,
    pub target_classes: TargetClasses,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    /// x1, y1, x2, y2 in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f32; 4]>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    pub fn count(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Keep only detections at or above the threshold and inside the target classes.
    pub fn filtered(mut self, request: &AnalysisRequest) -> Self {
        self.detections.retain(|d| {
            d.confidence >= request.confidence_threshold && request.target_classes.accepts(&d.label)
        });
        self
    }
}

#[async_trait]
pub trait DetectionEngine: Send + Sync {
    async fn analyze(&self, frame: &Frame, request: &AnalysisRequest) -> Result<DetectionResult>;

    fn name(&self) -> &str;
}

/// Engine used when no detection service is configured; it never finds anything.
#[derive(Debug, Default)]
pub struct NullEngine;

#[async_trait]
impl DetectionEngine for NullEngine {
    async fn analyze(&self, _frame: &Frame, _request: &AnalysisRequest) -> Result<DetectionResult> {
        Ok(DetectionResult::default())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Posts each frame to an HTTP detection service.
pub struct HttpDetectionEngine {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpDetectionEngine {
    pub fn new(config: &DetectionConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint)?;
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, endpoint })
    }

    fn request_url(&self, frame: &Frame, request: &AnalysisRequest) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("confidence", &request.confidence_threshold.to_string());
            if let TargetClasses::Only(labels) = &request.target_classes {
                let joined: Vec<&str> = labels.iter().map(String::as_str).collect();
                query.append_pair("classes", &joined.join(","));
            }
            query.append_pair("producer_id", &frame.producer_id);
            query.append_pair("camera_index", &frame.camera_index.to_string());
        }
        url
    }
}

#[async_trait]
impl DetectionEngine for HttpDetectionEngine {
    async fn analyze(&self, frame: &Frame, request: &AnalysisRequest) -> Result<DetectionResult> {
        let url = self.request_url(frame, request);
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(frame.payload.clone())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(HubError::detection(format!(
                "detection service answered {} for {}/{}",
                status, frame.producer_id, frame.camera_index
            )));
        }

        let result: DetectionResult = response.json().await?;
        debug!(
            "Detection service returned {} raw detections for {}/{}",
            result.count(),
            frame.producer_id,
            frame.camera_index
        );
        Ok(result.filtered(request))
    }

    fn name(&self) -> &str {
        "http"
    }
}

pub fn engine_from_config(config: Option<&DetectionConfig>) -> Result<Arc<dyn DetectionEngine>> {
    match config {
        Some(config) => {
            info!("Using HTTP detection engine at {}", config.endpoint);
            Ok(Arc::new(HttpDetectionEngine::new(config)?))
        }
        None => {
            info!("No detection endpoint configured, using the null engine");
            Ok(Arc::new(NullEngine))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn detection(label: &str, confidence: f32) -> Detection {
        Detection { label: label.to_string(), confidence, bbox: None }
    }

    #[test]
    fn test_target_classes_from_labels() {
        assert_eq!(TargetClasses::from_labels(None), TargetClasses::All);
        assert_eq!(TargetClasses::from_labels(Some(vec![])), TargetClasses::All);
        assert_eq!(
            TargetClasses::from_labels(Some(vec!["person".into(), "ALL".into()])),
            TargetClasses::All
        );

        let only = TargetClasses::from_labels(Some(vec!["Person".into(), " car ".into()]));
        assert!(only.accepts("person"));
        assert!(only.accepts("CAR"));
        assert!(!only.accepts("dog"));
        assert_eq!(serde_json::to_value(&only).unwrap(), serde_json::json!(["car", "person"]));
        assert_eq!(serde_json::to_value(TargetClasses::All).unwrap(), serde_json::json!("all"));
    }

    #[test]
    fn test_filtered_applies_threshold_and_classes() {
        let result = DetectionResult {
            detections: vec![
                detection("person", 0.9),
                detection("person", 0.1),
                detection("dog", 0.95),
            ],
        };
        let request = AnalysisRequest {
            confidence_threshold: 0.5,
            target_classes: TargetClasses::from_labels(Some(vec!["person".into()])),
        };
        let filtered = result.filtered(&request);
        assert_eq!(filtered.count(), 1);
        assert_eq!(filtered.detections[0].label, "person");
    }

    #[tokio::test]
    async fn test_null_engine_finds_nothing() {
        let frame = Frame::new("cam-a", 0, 1, Bytes::from_static(b"x"));
        let request = AnalysisRequest { confidence_threshold: 0.25, target_classes: TargetClasses::All };
        let result = NullEngine.analyze(&frame, &request).await.unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_http_engine_query() {
        let engine = HttpDetectionEngine::new(&DetectionConfig {
            endpoint: "http://127.0.0.1:9000/analyze".into(),
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        let frame = Frame::new("cam-a", 2, 1, Bytes::from_static(b"x"));
        let request = AnalysisRequest {
            confidence_threshold: 0.5,
            target_classes: TargetClasses::from_labels(Some(vec!["person".into(), "car".into()])),
        };
        let url = engine.request_url(&frame, &request);
        let query = url.query().unwrap();
        assert!(query.contains("confidence=0.5"));
        assert!(query.contains("classes=car%2Cperson"));
        assert!(query.contains("camera_index=2"));

        assert!(HttpDetectionEngine::new(&DetectionConfig {
            endpoint: "not a url".into(),
            timeout: Duration::from_secs(1),
        })
        .is_err());
    }
}
