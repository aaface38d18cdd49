use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::errors::{Result, HubError};
use crate::utils::human_duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub events: EventsConfig,
    pub detection: Option<DetectionConfig>,
    pub mqtt: Option<MqttConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_allow_origin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize, // Frames above this are dropped and counted
    #[serde(default = "default_true")]
    pub validate_image_format: bool, // Payload must sniff as an encoded image
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize, // Outbound control messages queued per producer
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize, // Transport cap per WebSocket message or HTTP body; larger cuts the socket
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(with = "human_duration", default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: Duration,
    #[serde(with = "human_duration", default = "default_grace_period")]
    pub grace_period: Duration,
    #[serde(with = "human_duration", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_poll_fps")]
    pub default_poll_fps: u32,
    #[serde(default = "default_max_poll_fps")]
    pub max_poll_fps: u32,
    #[serde(default = "default_confidence")]
    pub default_confidence: f32,
    #[serde(with = "human_duration", default = "default_stop_timeout")]
    pub stop_timeout: Duration, // How long stop() waits for a session task before aborting it
    #[serde(default = "default_recent_detections")]
    pub recent_detections: usize, // Detection events kept per session for the recent endpoint
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(with = "human_duration", default = "default_stats_interval")]
    pub stats_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Base URL of the external detection service, e.g. http://127.0.0.1:9000/analyze
    pub endpoint: String,
    #[serde(with = "human_duration", default = "default_detection_timeout")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub base_topic: String,
    pub qos: u8,
    pub retain: bool,
    pub keep_alive_secs: u64,
    pub max_packet_size: Option<usize>, // Maximum MQTT packet size in bytes (default: 268435455)
}

fn default_true() -> bool { true }
fn default_max_frame_bytes() -> usize { 2 * 1024 * 1024 } // 2MB
fn default_command_buffer() -> usize { 32 }
fn default_max_message_bytes() -> usize { 16 * 1024 * 1024 } // 16MB
fn default_heartbeat_timeout() -> Duration { Duration::from_secs(10) }
fn default_grace_period() -> Duration { Duration::from_secs(20) }
fn default_sweep_interval() -> Duration { Duration::from_secs(2) }
fn default_poll_fps() -> u32 { 5 }
fn default_max_poll_fps() -> u32 { 30 }
fn default_confidence() -> f32 { 0.25 }
fn default_stop_timeout() -> Duration { Duration::from_secs(1) }
fn default_recent_detections() -> usize { 50 }
fn default_channel_capacity() -> usize { 256 }
fn default_stats_interval() -> Duration { Duration::from_secs(5) }
fn default_detection_timeout() -> Duration { Duration::from_secs(5) }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5002,
            cors_allow_origin: Some("*".to_string()),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
            validate_image_format: true,
            command_buffer: default_command_buffer(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: default_heartbeat_timeout(),
            grace_period: default_grace_period(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_poll_fps: default_poll_fps(),
            max_poll_fps: default_max_poll_fps(),
            default_confidence: default_confidence(),
            stop_timeout: default_stop_timeout(),
            recent_detections: default_recent_detections(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            stats_interval: default_stats_interval(),
        }
    }
}

impl MqttConfig {
    pub fn substitute_variables(&mut self) {
        let hostname = gethostname::gethostname()
            .to_string_lossy()
            .to_string();

        self.base_topic = self.base_topic.replace("${hostname}", &hostname);
        self.client_id = self.client_id.replace("${hostname}", &hostname);

        info!("MQTT config substituted: base_topic = {}, client_id = {}",
              self.base_topic, self.client_id);
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let extension = Path::new(path).extension().and_then(|s| s.to_str());
        let mut config = Self::parse(&content, extension)?;

        if let Some(ref mut mqtt) = config.mqtt {
            mqtt.substitute_variables();
        }

        config.validate()?;
        info!("Loaded configuration from {}", path);
        Ok(config)
    }

    /// Parse config text; `extension` selects JSON or YAML, anything else is TOML.
    pub fn parse(content: &str, extension: Option<&str>) -> Result<Self> {
        let config = match extension {
            Some("json") => serde_json::from_str(content)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(content)?,
            _ => toml::from_str(content)?,
        };
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ingest.max_frame_bytes == 0 {
            return Err(HubError::config("ingest.max_frame_bytes must be greater than zero"));
        }
        if self.ingest.max_message_bytes <= self.ingest.max_frame_bytes {
            return Err(HubError::config(format!(
                "ingest.max_message_bytes ({}) must exceed ingest.max_frame_bytes ({})",
                self.ingest.max_message_bytes, self.ingest.max_frame_bytes
            )));
        }
        if self.coordinator.default_poll_fps == 0 || self.coordinator.max_poll_fps == 0 {
            return Err(HubError::config("coordinator poll rates must be greater than zero"));
        }
        if self.coordinator.default_poll_fps > self.coordinator.max_poll_fps {
            return Err(HubError::config(format!(
                "coordinator.default_poll_fps ({}) exceeds max_poll_fps ({})",
                self.coordinator.default_poll_fps, self.coordinator.max_poll_fps
            )));
        }
        if !(0.0..=1.0).contains(&self.coordinator.default_confidence) {
            return Err(HubError::config("coordinator.default_confidence must be within 0.0..=1.0"));
        }
        if self.events.channel_capacity == 0 {
            return Err(HubError::config("events.channel_capacity must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.health.heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(config.ingest.max_frame_bytes, 2 * 1024 * 1024);
        assert_eq!(config.ingest.max_message_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn test_parse_toml_with_durations() {
        let toml = r#"
            [server]
            host = "127.0.0.1"
            port = 6000

            [health]
            heartbeat_timeout = "3s"
            grace_period = "1500ms"

            [coordinator]
            default_poll_fps = 2
        "#;
        let config = Config::parse(toml, Some("toml")).unwrap();
        assert_eq!(config.server.port, 6000);
        assert_eq!(config.health.heartbeat_timeout, Duration::from_secs(3));
        assert_eq!(config.health.grace_period, Duration::from_millis(1500));
        assert_eq!(config.health.sweep_interval, Duration::from_secs(2));
        assert_eq!(config.coordinator.default_poll_fps, 2);
        assert_eq!(config.coordinator.max_poll_fps, 30);
        assert!(config.mqtt.is_none());
    }

    #[test]
    fn test_parse_json_and_yaml() {
        let json = r#"{ "ingest": { "max_frame_bytes": 1024 } }"#;
        let config = Config::parse(json, Some("json")).unwrap();
        assert_eq!(config.ingest.max_frame_bytes, 1024);
        assert!(config.ingest.validate_image_format);

        let yaml = "events:\n  channel_capacity: 8\n  stats_interval: 1s\n";
        let config = Config::parse(yaml, Some("yaml")).unwrap();
        assert_eq!(config.events.channel_capacity, 8);
        assert_eq!(config.events.stats_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::parse("[health]\nheartbeat_timeout = \"0s\"\n", None).is_err());

        let mut config = Config::default();
        config.coordinator.default_poll_fps = 60;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.coordinator.default_confidence = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ingest.max_message_bytes = config.ingest.max_frame_bytes;
        assert!(config.validate().is_err());
    }
}
