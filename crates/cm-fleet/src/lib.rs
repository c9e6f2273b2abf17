//! Fleet state for the game-server control plane.
//!
//! [`ServerManager`] owns one [`Vps`] per configured node and places new
//! servers on the least loaded one. Each node talks to its machine over a
//! [`Link`], tracks pending creations as [`TempServer`]s and reconciles its
//! configured minimums in the background. Commands are delivered through the
//! shared [`RetryScheduler`] so they survive short link outages.

pub mod commands;
pub mod config;
pub mod link;
pub mod lookup;
pub mod manager;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod temp_server;
pub mod vps;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

pub use config::{
    ConfigSource, FileConfigSource, FleetConfig, NodeConfig, StaticConfigSource, TypeLimits,
};
pub use link::{AttachError, Link, LinkError};
pub use lookup::{LookupError, ServerLookup};
pub use manager::ServerManager;
pub use scheduler::{RetryPolicy, RetryScheduler};
pub use server::Server;
pub use temp_server::{Pending, PendingClose, PendingServer, TempServer};
pub use vps::{Vps, VpsStatus};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read fleet config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse fleet config: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("invalid fleet config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported to callers opening or closing servers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FleetError {
    #[error("server type {0} not found")]
    TypeNotFound(String),

    #[error("no vps available for a server of type {0}")]
    Full(String),

    #[error("vps {0} is not connected")]
    NotConnected(String),

    #[error("unknown error")]
    Unknown,
}

/// Tunables shared by every node of the fleet.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Period of the per-node reconciliation loop.
    pub reconcile_interval: Duration,
    /// Maximum number of start commands one reconciliation tick may issue.
    pub max_starts_per_tick: usize,
    /// Upper bound on a registry lookup after a node reports a new server.
    pub lookup_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(10),
            max_starts_per_tick: 5,
            lookup_timeout: Duration::from_secs(10),
        }
    }
}
