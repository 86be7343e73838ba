//! Call configuration

use crate::transport::TransportConfig;
use crate::types::MediaConstraints;
use serde::{Deserialize, Serialize};

/// STUN server used when none is configured
pub const DEFAULT_STUN_SERVER: &str = "stun:stun1.l.google.com:19302";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerCallConfig {
    /// Relay connection settings
    pub transport: TransportConfig,
    /// STUN/TURN URLs handed to the media transport
    pub ice_servers: Vec<String>,
    /// Local capture constraints
    pub media: MediaConstraints,
    /// Pause local video right after acquiring it
    pub start_video_paused: bool,
    /// Capacity of the call event broadcast channel
    pub event_capacity: usize,
}

impl Default for PeerCallConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            media: MediaConstraints::video_call(),
            start_video_paused: true,
            event_capacity: 100,
        }
    }
}
