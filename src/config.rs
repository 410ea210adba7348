use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::pipeline::receiver::AssemblerConfig;
use crate::protocol::ProtocolParams;

/// Receiver tuning. Every field has a default, so a config file only needs
/// the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub protocol: ProtocolParams,
    pub heartbeat_interval_ms: u64,
    pub receive_timeout_ms: u64,
    /// Samples held by the playback ring, one slot of which stays empty
    pub audio_ring_capacity: usize,
    pub audio_samples_per_frame: usize,
    pub poll_interval_ms: u64,
    /// Capacity of the completed-frame channel in background mode
    pub frame_channel_capacity: usize,
    pub drop_superseded: bool,
    pub request_video: bool,
    pub request_audio: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolParams::default(),
            heartbeat_interval_ms: 1000,
            receive_timeout_ms: 5000,
            audio_ring_capacity: 48_000,
            audio_samples_per_frame: 960,
            poll_interval_ms: 5,
            frame_channel_capacity: 8,
            drop_superseded: true,
            request_video: true,
            request_audio: true,
        }
    }
}

impl ReceiverConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("invalid receiver config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json_str(&json)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.protocol.fec_group_size > 0, "fec_group_size must be positive");
        anyhow::ensure!(
            self.protocol.max_packet_size > crate::protocol::FRAGMENT_HEADER_SIZE,
            "max_packet_size must leave room for a fragment payload"
        );
        anyhow::ensure!(
            self.protocol.max_packet_size <= crate::protocol::MAX_PACKET_SIZE,
            "max_packet_size {} exceeds the {}-byte receive buffer",
            self.protocol.max_packet_size,
            crate::protocol::MAX_PACKET_SIZE
        );
        anyhow::ensure!(
            self.audio_ring_capacity > self.audio_samples_per_frame,
            "audio ring must hold at least one frame"
        );
        anyhow::ensure!(self.frame_channel_capacity > 0, "frame channel cannot be zero-sized");
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn assembler(&self) -> AssemblerConfig {
        AssemblerConfig {
            drop_superseded: self.drop_superseded,
        }
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ReceiverConfig::from_json_str(r#"{ "receive_timeout_ms": 2500 }"#).unwrap();
        assert_eq!(config.receive_timeout(), Duration::from_millis(2500));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.protocol, ProtocolParams::default());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(ReceiverConfig::from_json_str(r#"{ "audio_ring_capacity": 10 }"#).is_err());
        assert!(ReceiverConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_packet_size_bounded_by_receive_buffer() {
        let err = ReceiverConfig::from_json_str(r#"{ "protocol": { "max_packet_size": 2000 } }"#)
            .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
        let smaller = ReceiverConfig::from_json_str(r#"{ "protocol": { "max_packet_size": 508 } }"#)
            .unwrap();
        assert_eq!(smaller.protocol.max_packet_size, 508);
    }

    #[test]
    fn test_superseded_frames_dropped_by_default() {
        assert!(ReceiverConfig::default().assembler().drop_superseded);
    }

    #[test]
    fn test_round_trip_through_json() {
        let config = ReceiverConfig {
            drop_superseded: false,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(ReceiverConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_app_metadata() {
        assert_eq!(app_name(), "depthcast");
        assert!(!version().is_empty());
    }
}
