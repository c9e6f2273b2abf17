use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use cm_fleet::{AttachError, Link, LinkError, ServerManager, commands, protocol};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::auth::bearer_token;
use crate::error::ApiError;
use crate::state::AppState;

const OUTBOUND_QUEUE: usize = 64;

// ── Link ────────────────────────────────────────────────────────────

/// Control link over a node's WebSocket.
///
/// Outbound frames go through a bounded queue drained by the socket writer
/// task, so [`Link::send`] never waits on the network.
pub struct WsLink {
    vps_id: String,
    outbound: mpsc::Sender<Message>,
    connected: AtomicBool,
    authenticated: AtomicBool,
}

impl WsLink {
    pub(crate) fn new(vps_id: impl Into<String>, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            vps_id: vps_id.into(),
            outbound,
            connected: AtomicBool::new(true),
            authenticated: AtomicBool::new(false),
        }
    }

    pub(crate) fn authenticate(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
    }

    fn mark_closed(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl Link for WsLink {
    fn send(&self, channel: &str, payload: &str) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::Closed);
        }
        let frame = protocol::frame(channel, payload);
        match self.outbound.try_send(Message::Text(frame.into())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(LinkError::Backpressure),
            Err(TrySendError::Closed(_)) => {
                self.mark_closed();
                Err(LinkError::Closed)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    fn disconnect(&self, reason: &str) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!(vps_id = %self.vps_id, reason, "disconnecting link");
        let _ = self.outbound.try_send(close_message(reason));
    }
}

fn close_message(reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: close_code::POLICY,
        reason: reason.to_string().into(),
    }))
}

// ── WebSocket endpoint ──────────────────────────────────────────────

/// `GET /link`: a node opens its control link, authenticating with its token.
pub async fn link_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(token) = bearer_token(&headers).map(str::to_string) else {
        return ApiError::Unauthorized.into_response();
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let manager = state.manager.clone();

    ws.on_upgrade(move |socket| serve_link(socket, manager, token))
}

async fn reject(mut socket: WebSocket, reason: &str) {
    tracing::warn!(reason, "rejecting link");
    let _ = socket.send(close_message(reason)).await;
}

fn close_reason(error: &AttachError) -> &'static str {
    match error {
        AttachError::InvalidToken => "Invalid token",
        AttachError::UnknownVps(_) | AttachError::Unloaded(_) => "Vps doesn't exist",
        AttachError::AlreadyLinked(_) => "Vps already connected",
    }
}

async fn serve_link(socket: WebSocket, manager: Arc<ServerManager>, token: String) {
    let vps = match manager.vps_for_token(&token) {
        Ok(vps) => vps,
        Err(e) => return reject(socket, close_reason(&e)).await,
    };
    let vps_id = vps.id().to_string();

    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let link = Arc::new(WsLink::new(vps_id.clone(), tx));
    link.authenticate();
    let handle: Arc<dyn Link> = link.clone();

    if let Err(e) = vps.attach_link(handle.clone()) {
        return reject(socket, close_reason(&e)).await;
    }

    let (mut sink, mut stream) = socket.split();

    // Writer: drains the outbound queue until a close frame or a dead socket
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        if !link.is_connected() {
            break;
        }
        commands::handle(&manager, &vps, &*link, text.as_str());
    }

    link.mark_closed();
    vps.detach_link(&handle);
    writer.abort();
    tracing::info!(vps_id = %vps_id, "link closed");
}
