//! Text commands exchanged over a control link.
//!
//! A frame is `"<channel> <payload>"`. The plane sends `start`, `stop` and
//! the `register`/`unregister` announcements; nodes report `register`,
//! `unregister` and `error`.

use uuid::Uuid;

pub const START: &str = "start";
pub const STOP: &str = "stop";
pub const REGISTER: &str = "register";
pub const UNREGISTER: &str = "unregister";
pub const ERROR: &str = "error";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,

    #[error("unknown channel {0:?}")]
    UnknownChannel(String),

    #[error("invalid {channel:?} command, got {payload:?}")]
    Malformed { channel: &'static str, payload: String },

    #[error("{0:?} is not a valid correlation id")]
    InvalidCorrelationId(String),
}

/// A command a node sent to the plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundCommand {
    /// `register <correlationId> <serverId>`
    Register { correlation_id: Uuid, server_id: String },
    /// `error <correlationId>`
    Error { correlation_id: Uuid },
    /// `unregister <serverId> <type>`
    Unregister { server_id: String, server_type: String },
}

impl InboundCommand {
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        let (channel, payload) = split_frame(frame)?;
        match channel {
            REGISTER => {
                let [correlation_id, server_id] = args::<2>(REGISTER, payload)?;
                Ok(Self::Register {
                    correlation_id: parse_correlation_id(correlation_id)?,
                    server_id: server_id.to_string(),
                })
            }
            ERROR => {
                let [correlation_id] = args::<1>(ERROR, payload)?;
                Ok(Self::Error {
                    correlation_id: parse_correlation_id(correlation_id)?,
                })
            }
            UNREGISTER => {
                let [server_id, server_type] = args::<2>(UNREGISTER, payload)?;
                Ok(Self::Unregister {
                    server_id: server_id.to_string(),
                    server_type: server_type.to_string(),
                })
            }
            other => Err(ProtocolError::UnknownChannel(other.to_string())),
        }
    }

    pub fn channel(&self) -> &'static str {
        match self {
            Self::Register { .. } => REGISTER,
            Self::Error { .. } => ERROR,
            Self::Unregister { .. } => UNREGISTER,
        }
    }
}

/// Split a frame into its channel and (possibly empty) payload.
pub fn split_frame(frame: &str) -> Result<(&str, &str), ProtocolError> {
    let frame = frame.trim();
    if frame.is_empty() {
        return Err(ProtocolError::Empty);
    }
    Ok(match frame.split_once(' ') {
        Some((channel, payload)) => (channel, payload.trim()),
        None => (frame, ""),
    })
}

pub fn frame(channel: &str, payload: &str) -> String {
    format!("{channel} {payload}")
}

pub fn start_payload(correlation_id: Uuid, server_type: &str) -> String {
    format!("{correlation_id} {server_type}")
}

/// Payload of the `register`/`unregister` announcements sent to nodes.
pub fn announce_payload(server_id: &str, server_type: &str) -> String {
    format!("{server_id} {server_type}")
}

fn args<'a, const N: usize>(
    channel: &'static str,
    payload: &'a str,
) -> Result<[&'a str; N], ProtocolError> {
    let parts: Vec<&str> = payload.split(' ').filter(|p| !p.is_empty()).collect();
    parts.try_into().map_err(|_| ProtocolError::Malformed {
        channel,
        payload: payload.to_string(),
    })
}

fn parse_correlation_id(raw: &str) -> Result<Uuid, ProtocolError> {
    Uuid::parse_str(raw).map_err(|_| ProtocolError::InvalidCorrelationId(raw.to_string()))
}
