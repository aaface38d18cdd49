use thiserror::Error;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Unknown producer '{producer_id}'")]
    UnknownProducer { producer_id: String },

    #[error("Unknown camera {camera_index} on producer '{producer_id}'")]
    UnknownCamera { producer_id: String, camera_index: u32 },

    #[error("Frame too large: {size} bytes (limit {limit})")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Malformed frame: {message}")]
    MalformedFrame { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Detection engine error: {message}")]
    Detection { message: String },

    #[error("MQTT error: {message}")]
    Mqtt { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("URL parse error: {source}")]
    UrlParse {
        #[from]
        source: url::ParseError,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },

    #[error("YAML error: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },

    #[error("MQTT client error: {source}")]
    MqttClient {
        #[from]
        source: rumqttc::ClientError,
    },

    #[error("HTTP client error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },
}

impl HubError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn unknown_producer(producer_id: impl Into<String>) -> Self {
        Self::UnknownProducer { producer_id: producer_id.into() }
    }

    pub fn unknown_camera(producer_id: impl Into<String>, camera_index: u32) -> Self {
        Self::UnknownCamera { producer_id: producer_id.into(), camera_index }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedFrame { message: message.into() }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub fn detection(message: impl Into<String>) -> Self {
        Self::Detection { message: message.into() }
    }

    pub fn mqtt(message: impl Into<String>) -> Self {
        Self::Mqtt { message: message.into() }
    }

    /// True for errors that mean "the caller must register again".
    pub fn is_unknown_entity(&self) -> bool {
        matches!(self, Self::UnknownProducer { .. } | Self::UnknownCamera { .. })
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
