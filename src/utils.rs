use std::time::Duration;
use crate::errors::{Result, HubError};

/// Parse a duration string like "500ms", "10s", "5m" into a std Duration
pub fn parse_duration(s: &str) -> Result<Duration> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(HubError::config("Empty duration string"));
    }

    let duration = humantime::parse_duration(trimmed)
        .map_err(|e| HubError::config(format!("Invalid duration '{}': {}", trimmed, e)))?;

    if duration.is_zero() {
        return Err(HubError::config("Duration must be positive"));
    }

    Ok(duration)
}

/// Serde adapter for `Duration` fields written as human strings in config files.
pub mod human_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Clamp a requested frame rate into the range producers honor.
pub fn clamp_fps(fps: u32) -> u32 {
    fps.clamp(1, 30)
}

/// Clamp a requested JPEG quality into 1..=100.
pub fn clamp_quality(quality: u8) -> u8 {
    quality.clamp(1, 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration(" 2h ").unwrap(), Duration::from_secs(7200));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_clamping() {
        assert_eq!(clamp_fps(0), 1);
        assert_eq!(clamp_fps(15), 15);
        assert_eq!(clamp_fps(120), 30);
        assert_eq!(clamp_quality(0), 1);
        assert_eq!(clamp_quality(80), 80);
        assert_eq!(clamp_quality(255), 100);
    }
}
