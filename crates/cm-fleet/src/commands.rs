//! Dispatch of frames a node sends over its control link.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::link::Link;
use crate::manager::ServerManager;
use crate::protocol::InboundCommand;
use crate::vps::Vps;

/// What happened to an inbound frame.
#[derive(Debug)]
pub enum Handled {
    /// Processed synchronously.
    Done,
    /// Processing continues on the returned task.
    Spawned(JoinHandle<()>),
    /// Dropped: unauthenticated link or malformed frame.
    Ignored,
}

/// Handle one frame `vps` sent over `link`.
pub fn handle(manager: &ServerManager, vps: &Arc<Vps>, link: &dyn Link, frame: &str) -> Handled {
    if !link.is_authenticated() {
        tracing::warn!(vps_id = %vps.id(), "frame on unauthenticated link");
        return Handled::Ignored;
    }

    let command = match InboundCommand::parse(frame) {
        Ok(command) => command,
        Err(e) => {
            tracing::warn!(vps_id = %vps.id(), error = %e, frame, "invalid command");
            return Handled::Ignored;
        }
    };
    tracing::debug!(vps_id = %vps.id(), channel = command.channel(), "received command");

    match command {
        InboundCommand::Register {
            correlation_id,
            server_id,
        } => {
            let vps = Arc::clone(vps);
            Handled::Spawned(tokio::spawn(async move {
                vps.on_register(correlation_id, server_id).await;
            }))
        }
        InboundCommand::Error { correlation_id } => {
            let matched = manager
                .get_vps()
                .iter()
                .filter(|node| node.error(correlation_id))
                .count();
            if matched == 0 {
                tracing::debug!(vps_id = %vps.id(), %correlation_id, "error for unknown correlation id");
            }
            Handled::Done
        }
        InboundCommand::Unregister {
            server_id,
            server_type,
        } => {
            vps.on_unregister(&server_id, &server_type);
            Handled::Done
        }
    }
}
