//! Messages exchanged with producers over `/ws/producer`.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};

use crate::errors::{HubError, Result};
use crate::registry::CameraProperties;

/// First byte of a binary frame message.
pub const BINARY_FRAME_TAG: u8 = 0x00;
/// Tag + camera index (u32 LE) + sequence (u64 LE).
pub const BINARY_FRAME_HEADER_LEN: usize = 1 + 4 + 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProducerMessage {
    Register {
        producer_id: String,
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        client_type: Option<String>,
    },
    /// Batch camera report, keyed by the camera index as a string.
    CameraInfo {
        producer_id: String,
        cameras: HashMap<String, CameraProperties>,
    },
    ReportCamera {
        producer_id: String,
        camera_index: u32,
        width: u32,
        height: u32,
        fps: u32,
        #[serde(default)]
        quality: Option<u8>,
    },
    Frame {
        producer_id: String,
        camera_index: u32,
        #[serde(default)]
        sequence: Option<u64>,
        frame_data: String,
    },
    Heartbeat {
        producer_id: String,
    },
    Unregister {
        producer_id: String,
    },
}

impl ProducerMessage {
    pub fn producer_id(&self) -> &str {
        match self {
            ProducerMessage::Register { producer_id, .. }
            | ProducerMessage::CameraInfo { producer_id, .. }
            | ProducerMessage::ReportCamera { producer_id, .. }
            | ProducerMessage::Frame { producer_id, .. }
            | ProducerMessage::Heartbeat { producer_id }
            | ProducerMessage::Unregister { producer_id } => producer_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingSettings {
    pub quality: u8,
    pub fps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadMessage,
    NotRegistered,
    UnknownProducer,
    UnknownCamera,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered {
        producer_id: String,
        created: bool,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    FrameRejected {
        camera_index: u32,
        reason: String,
    },
    StartStreaming {
        camera_index: u32,
        settings: StreamingSettings,
    },
    StopStreaming {
        camera_index: u32,
    },
    UpdateStreamingSettings {
        camera_index: u32,
        quality: u8,
        fps: u32,
    },
    GetCameraInfo,
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error { code, message: message.into() }
    }

    /// Map a rejection from the registry to the code producers act on.
    pub fn from_error(err: &HubError) -> Self {
        let code = match err {
            HubError::UnknownProducer { .. } => ErrorCode::UnknownProducer,
            HubError::UnknownCamera { .. } => ErrorCode::UnknownCamera,
            _ => ErrorCode::BadMessage,
        };
        ServerMessage::error(code, err.to_string())
    }
}

/// A frame received as a binary WebSocket message.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryFrame {
    pub camera_index: u32,
    pub sequence: u64,
    pub payload: Bytes,
}

pub fn decode_binary_frame(mut data: Bytes) -> Result<BinaryFrame> {
    if data.len() < BINARY_FRAME_HEADER_LEN {
        return Err(HubError::protocol(format!(
            "binary frame too short: {} bytes",
            data.len()
        )));
    }
    let tag = data.get_u8();
    if tag != BINARY_FRAME_TAG {
        return Err(HubError::protocol(format!("unknown binary message tag 0x{:02x}", tag)));
    }
    let camera_index = data.get_u32_le();
    let sequence = data.get_u64_le();
    Ok(BinaryFrame { camera_index, sequence, payload: data })
}

pub fn encode_binary_frame(camera_index: u32, sequence: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(BINARY_FRAME_HEADER_LEN + payload.len());
    out.push(BINARY_FRAME_TAG);
    out.extend_from_slice(&camera_index.to_le_bytes());
    out.extend_from_slice(&sequence.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decode a base64 `frame_data` field. A `data:image/...;base64,` prefix is tolerated.
pub fn decode_frame_data(frame_data: &str) -> Result<Bytes> {
    let encoded = match frame_data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => frame_data,
    };
    BASE64
        .decode(encoded.trim())
        .map(Bytes::from)
        .map_err(|e| HubError::malformed(format!("frame_data is not valid base64: {}", e)))
}

pub fn encode_frame_data(payload: &[u8]) -> String {
    BASE64.encode(payload)
}

/// Camera index keys of a batch report must be plain integers.
pub fn parse_camera_index(key: &str) -> Result<u32> {
    key.trim()
        .parse::<u32>()
        .map_err(|_| HubError::protocol(format!("invalid camera index '{}'", key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_producer_messages() {
        let msg: ProducerMessage =
            serde_json::from_str(r#"{"type":"register","producer_id":"cam-a","display_name":"Lobby"}"#)
                .unwrap();
        assert_eq!(
            msg,
            ProducerMessage::Register {
                producer_id: "cam-a".into(),
                display_name: Some("Lobby".into()),
                client_type: None,
            }
        );

        let msg: ProducerMessage = serde_json::from_str(
            r#"{"type":"camera_info","producer_id":"cam-a","cameras":{"0":{"width":640,"height":480,"fps":15,"brightness":0.5}}}"#,
        )
        .unwrap();
        match msg {
            ProducerMessage::CameraInfo { cameras, .. } => {
                let cam = &cameras["0"];
                assert_eq!((cam.width, cam.height, cam.fps), (640, 480, 15));
                assert!(cam.extra.contains_key("brightness"));
            }
            other => panic!("unexpected message {:?}", other),
        }

        let msg: ProducerMessage =
            serde_json::from_str(r#"{"type":"heartbeat","producer_id":"cam-b"}"#).unwrap();
        assert_eq!(msg.producer_id(), "cam-b");

        assert!(serde_json::from_str::<ProducerMessage>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn test_server_message_shape() {
        let json = serde_json::to_value(ServerMessage::UpdateStreamingSettings {
            camera_index: 1,
            quality: 70,
            fps: 10,
        })
        .unwrap();
        assert_eq!(json["type"], "update_streaming_settings");
        assert_eq!(json["quality"], 70);

        let json = serde_json::to_value(ServerMessage::from_error(&HubError::unknown_camera("cam-a", 4))).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "unknown_camera");
    }

    #[test]
    fn test_binary_frame_layout() {
        let encoded = encode_binary_frame(2, 99, b"jpeg");
        assert_eq!(encoded.len(), BINARY_FRAME_HEADER_LEN + 4);
        assert_eq!(&encoded[1..5], &2u32.to_le_bytes());

        let frame = decode_binary_frame(Bytes::from(encoded)).unwrap();
        assert_eq!(frame.camera_index, 2);
        assert_eq!(frame.sequence, 99);
        assert_eq!(&frame.payload[..], b"jpeg");

        assert!(decode_binary_frame(Bytes::from_static(&[0x00, 0x01])).is_err());
        let mut bad_tag = encode_binary_frame(0, 0, b"x");
        bad_tag[0] = 0x07;
        assert!(decode_binary_frame(Bytes::from(bad_tag)).is_err());
    }

    #[test]
    fn test_frame_data_accepts_data_url() {
        let raw = [0xFFu8, 0xD8, 0xFF];
        let plain = encode_frame_data(&raw);
        assert_eq!(&decode_frame_data(&plain).unwrap()[..], &raw);

        let url = format!("data:image/jpeg;base64,{}", plain);
        assert_eq!(&decode_frame_data(&url).unwrap()[..], &raw);

        assert!(matches!(decode_frame_data("***"), Err(HubError::MalformedFrame { .. })));
    }

    #[test]
    fn test_parse_camera_index() {
        assert_eq!(parse_camera_index("3").unwrap(), 3);
        assert!(parse_camera_index("front").is_err());
    }
}
