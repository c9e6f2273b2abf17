use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::FleetError;
use crate::server::Server;

/// Single-use result slot shared between the places that may settle a request.
///
/// The first call to [`complete`](Completion::complete) wins. Once every clone
/// is dropped without completing, the waiting side observes a closed channel.
pub(crate) struct Completion<T> {
    slot: Arc<Mutex<Option<oneshot::Sender<Result<T, FleetError>>>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Completion<T> {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<Result<T, FleetError>>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self {
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (completion, rx)
    }

    pub(crate) fn complete(&self, result: Result<T, FleetError>) -> bool {
        match self.slot.lock().take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

/// A requested server that its node has not confirmed yet.
///
/// Immutable once created; consumed exactly once by
/// [`succeed`](TempServer::succeed), [`fail`](TempServer::fail) or by being
/// dropped when the request is abandoned.
pub struct TempServer {
    correlation_id: Uuid,
    server_type: String,
    completion: Completion<Arc<Server>>,
}

impl TempServer {
    pub(crate) fn new(
        correlation_id: Uuid,
        server_type: impl Into<String>,
        completion: Completion<Arc<Server>>,
    ) -> Self {
        Self {
            correlation_id,
            server_type: server_type.into(),
            completion,
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn server_type(&self) -> &str {
        &self.server_type
    }

    pub fn is_type(&self, server_type: &str) -> bool {
        self.server_type.eq_ignore_ascii_case(server_type)
    }

    pub(crate) fn succeed(self, server: Arc<Server>) {
        self.completion.complete(Ok(server));
    }

    pub(crate) fn fail(self, error: FleetError) {
        self.completion.complete(Err(error));
    }
}

/// Outcome of an open or close request, delivered once.
pub struct Pending<T> {
    vps_id: String,
    target: String,
    rx: oneshot::Receiver<Result<T, FleetError>>,
    opaque: bool,
}

/// Resolves to the server once its node registered it.
pub type PendingServer = Pending<Arc<Server>>;

/// Resolves once the stop command was handed to the node.
pub type PendingClose = Pending<()>;

impl<T> Pending<T> {
    pub(crate) fn new(
        vps_id: impl Into<String>,
        target: impl Into<String>,
        rx: oneshot::Receiver<Result<T, FleetError>>,
    ) -> Self {
        Self {
            vps_id: vps_id.into(),
            target: target.into(),
            rx,
            opaque: false,
        }
    }

    /// Report every failure as [`FleetError::Unknown`].
    pub(crate) fn opaque(mut self) -> Self {
        self.opaque = true;
        self
    }

    /// Node the request was delegated to.
    pub fn vps_id(&self) -> &str {
        &self.vps_id
    }

    /// Server type for open requests, server id for close requests.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn wait(self) -> Result<T, FleetError> {
        let result = match self.rx.await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    vps_id = %self.vps_id,
                    target = %self.target,
                    "request abandoned before completion"
                );
                Err(FleetError::Unknown)
            }
        };

        match result {
            Err(e) if self.opaque && e != FleetError::Unknown => {
                tracing::info!(
                    vps_id = %self.vps_id,
                    target = %self.target,
                    error = %e,
                    "request on vps failed"
                );
                Err(FleetError::Unknown)
            }
            other => other,
        }
    }
}
