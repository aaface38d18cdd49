use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::errors::{HubError, Result};
use crate::events::HubEvent;

/// Where and how one event is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub retain: bool,
    pub payload: Vec<u8>,
}

/// Map an event onto its topic under `base_topic`.
pub fn publication_for(config: &MqttConfig, event: &HubEvent) -> Result<Publication> {
    let base = config.base_topic.trim_end_matches('/');
    let (topic, retain, payload) = match event {
        HubEvent::Stats(stats) => (
            format!("{}/stats", base),
            config.retain,
            serde_json::to_vec(stats)?,
        ),
        HubEvent::Producer(producer) => (
            format!("{}/producers/{}/status", base, producer.producer_id),
            true,
            serde_json::to_vec(producer)?,
        ),
        HubEvent::Session(session) => (
            format!("{}/sessions/{}/{}", base, session.producer_id, session.camera_index),
            config.retain,
            serde_json::to_vec(session)?,
        ),
        // Detections are events, never retained.
        HubEvent::Detection(detection) => (
            format!("{}/detections/{}/{}", base, detection.producer_id, detection.camera_index),
            false,
            serde_json::to_vec(detection)?,
        ),
    };
    Ok(Publication { topic, retain, payload })
}

fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Forwards hub events to an MQTT broker.
pub struct MqttBridge {
    client: AsyncClient,
    eventloop: EventLoop,
    config: MqttConfig,
}

impl MqttBridge {
    pub fn new(config: MqttConfig) -> Result<Self> {
        let url = url::Url::parse(&config.broker_url)
            .map_err(|e| HubError::mqtt(format!("Invalid MQTT broker URL '{}': {}", config.broker_url, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| HubError::mqtt(format!("No host found in MQTT broker URL: {}", config.broker_url)))?;
        let port = url.port().unwrap_or(1883);

        info!("Connecting to MQTT broker at {}:{}", host, port);

        let mut mqtt_options = MqttOptions::new(&config.client_id, host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));

        let max_packet_size = config.max_packet_size.unwrap_or(268435455);
        mqtt_options.set_max_packet_size(max_packet_size, max_packet_size);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
        Ok(Self { client, eventloop, config })
    }

    /// Drive the connection and forward every event from `events` until the bus closes.
    pub fn start(mut self, mut events: broadcast::Receiver<HubEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => info!("Connected to MQTT broker"),
                    Ok(Event::Incoming(Packet::Disconnect)) => warn!("Disconnected from MQTT broker"),
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        let client = self.client;
        let config = self.config;
        tokio::spawn(async move {
            let qos = qos(config.qos);
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("MQTT bridge lagging, skipped {} events", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let publication = match publication_for(&config, &event) {
                    Ok(publication) => publication,
                    Err(e) => {
                        error!("Failed to encode {} event for MQTT: {}", event.kind(), e);
                        continue;
                    }
                };
                debug!("MQTT publish to {}", publication.topic);
                // try_publish keeps a stalled broker from backing up the event bus.
                if let Err(e) = client.try_publish(
                    publication.topic,
                    qos,
                    publication.retain,
                    publication.payload,
                ) {
                    warn!("Failed to publish {} event: {}", event.kind(), e);
                }
            }
            info!("MQTT bridge stopped");
        })
    }
}
