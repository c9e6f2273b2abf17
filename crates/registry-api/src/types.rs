use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Envelope ────────────────────────────────────────────────────────

/// Every registry response is wrapped in this envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub error: bool,
    pub code: u16,
    pub error_message: Option<String>,
    pub data: Option<T>,
}

// ── Server types ────────────────────────────────────────────────────

/// Authoritative record of a game server, as stored by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub server_type: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub status: Option<String>,
    /// Id of the VPS hosting this server.
    pub vps: String,
    #[serde(default)]
    pub creation_time: Option<DateTime<Utc>>,
}
