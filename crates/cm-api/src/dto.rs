use serde::{Deserialize, Serialize};

// ── Requests ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct OpenServerRequest {
    #[serde(rename = "type")]
    pub server_type: String,
}

// ── Responses ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct CloseServerResponse {
    pub id: String,
    pub vps_id: String,
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub nodes: usize,
    pub server_types: Vec<String>,
}
