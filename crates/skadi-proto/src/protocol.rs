use serde::{Deserialize, Serialize};

use crate::channel::StreamQuality;

/// Well-known loopback UDP port held by the primary instance.
pub const LOCK_PORT: u16 = 37973;

/// Payload of the datagram a secondary launch sends to wake the primary.
pub const WAKEUP_SIGNATURE: &[u8] = b"SKADI";

/// True when a received datagram is exactly the wakeup signature.
pub fn is_wakeup(payload: &[u8]) -> bool {
    payload == WAKEUP_SIGNATURE
}

// ── local control API bodies ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsResponse {
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualitiesResponse {
    pub channel: String,
    pub qualities: Vec<StreamQuality>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
