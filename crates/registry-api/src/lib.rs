//! Typed Rust client for the server registry REST API.
//!
//! The registry is the authoritative store of running game servers. The
//! control plane only needs to read single records back after a VPS reports
//! that it created one.

mod types;

pub use types::*;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("registry api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("registry api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("registry api rejected request ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("registry api {0} returned no data")]
    MissingData(&'static str),

    #[error("invalid server id {0:?}")]
    InvalidId(String),

    #[error("invalid registry url {0}")]
    InvalidUrl(String),
}

impl Error {
    /// Whether the registry answered that the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status == reqwest::StatusCode::NOT_FOUND,
            Self::Rejected { code, .. } => *code == 404,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the server registry REST API.
#[derive(Clone)]
pub struct RegistryClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Base url extended with `segments`, each percent-encoded as a single
    /// path segment.
    fn url(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| Error::InvalidUrl(format!("{}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| Error::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: reqwest::Url) -> reqwest::RequestBuilder {
        let req = self.http.request(method, url);
        match &self.token {
            Some(token) => req.header("Authorization", format!("Bearer {token}")),
            None => req,
        }
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    fn unwrap_envelope<T>(envelope: Envelope<T>, endpoint: &'static str) -> Result<T> {
        if envelope.error {
            return Err(Error::Rejected {
                code: envelope.code,
                message: envelope.error_message.unwrap_or_default(),
            });
        }
        envelope.data.ok_or(Error::MissingData(endpoint))
    }

    // ── Servers ─────────────────────────────────────────────────────

    pub async fn get_server(&self, server_id: &str) -> Result<ServerRecord> {
        // `.` and `..` would be dropped from the path rather than encoded
        if matches!(server_id.trim(), "" | "." | "..") {
            return Err(Error::InvalidId(server_id.to_string()));
        }
        let url = self.url(&["server", server_id])?;
        let resp = self.request(reqwest::Method::GET, url).send().await?;

        let envelope: Envelope<ServerRecord> =
            Self::check(resp, "get server").await?.json().await?;
        Self::unwrap_envelope(envelope, "get server")
    }
}
