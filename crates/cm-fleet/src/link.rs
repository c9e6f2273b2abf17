use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("link is closed")]
    Closed,

    #[error("link send queue is full")]
    Backpressure,
}

/// Why a node refused a new link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    #[error("no vps uses this token")]
    InvalidToken,

    #[error("vps {0} is not part of the fleet")]
    UnknownVps(String),

    #[error("vps {0} already has an active link")]
    AlreadyLinked(String),

    #[error("vps {0} is unloaded")]
    Unloaded(String),
}

/// Control connection between the plane and one node.
///
/// Implementations must not block in [`send`](Link::send); a full outbound
/// queue is reported as [`LinkError::Backpressure`] and retried later.
pub trait Link: Send + Sync + 'static {
    fn send(&self, channel: &str, payload: &str) -> Result<(), LinkError>;

    fn is_connected(&self) -> bool;

    fn is_authenticated(&self) -> bool;

    fn disconnect(&self, reason: &str);
}

pub(crate) fn same_link(a: &Arc<dyn Link>, b: &Arc<dyn Link>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
