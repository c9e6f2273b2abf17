use chrono::{DateTime, Utc};
use registry_api::ServerRecord;
use serde::Serialize;

/// A game server confirmed running on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Server {
    pub id: String,
    #[serde(rename = "type")]
    pub server_type: String,
    /// Id of the owning node. Lookup only; the node map owns the server.
    pub vps_id: String,
    pub port: Option<u16>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Server {
    pub fn from_record(record: ServerRecord) -> Self {
        Self {
            id: record.id,
            server_type: record.server_type,
            vps_id: record.vps,
            port: record.port,
            created_at: record.creation_time,
        }
    }

    pub fn is_type(&self, server_type: &str) -> bool {
        self.server_type.eq_ignore_ascii_case(server_type)
    }
}
