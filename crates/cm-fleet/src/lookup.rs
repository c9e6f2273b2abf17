use std::time::Duration;

use async_trait::async_trait;
use registry_api::{RegistryClient, ServerRecord};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("server {0} not found")]
    NotFound(String),

    #[error("registry transport failure: {0}")]
    Transport(String),

    #[error("registry fatal failure: {0}")]
    Fatal(String),

    #[error("registry lookup timed out after {0:?}")]
    Timeout(Duration),
}

/// Authoritative source of server records.
#[async_trait]
pub trait ServerLookup: Send + Sync + 'static {
    async fn get_server(&self, server_id: &str) -> Result<ServerRecord, LookupError>;
}

#[async_trait]
impl ServerLookup for RegistryClient {
    async fn get_server(&self, server_id: &str) -> Result<ServerRecord, LookupError> {
        RegistryClient::get_server(self, server_id)
            .await
            .map_err(|e| classify(server_id, e))
    }
}

fn classify(server_id: &str, error: registry_api::Error) -> LookupError {
    use registry_api::Error;

    if error.is_not_found() {
        return LookupError::NotFound(server_id.to_string());
    }
    match error {
        Error::Request(e) if e.is_decode() => LookupError::Fatal(e.to_string()),
        Error::MissingData(endpoint) => LookupError::Fatal(format!("{endpoint} returned no data")),
        e @ (Error::InvalidId(_) | Error::InvalidUrl(_)) => LookupError::Fatal(e.to_string()),
        other => LookupError::Transport(other.to_string()),
    }
}
