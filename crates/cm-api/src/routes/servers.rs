use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use cm_fleet::Server;

use crate::dto::{CloseServerResponse, OpenServerRequest};
use crate::error::ApiError;
use crate::state::AppState;

/// How long `POST /servers` waits for the node to register the new server.
const OPEN_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn open_server(
    State(state): State<AppState>,
    Json(req): Json<OpenServerRequest>,
) -> Result<(StatusCode, Json<Server>), ApiError> {
    let pending = state.manager.open_server(&req.server_type)?;
    let vps_id = pending.vps_id().to_string();

    let server = tokio::time::timeout(OPEN_TIMEOUT, pending.wait())
        .await
        .map_err(|_| {
            tracing::warn!(%vps_id, server_type = %req.server_type, "timed out waiting for server");
            ApiError::Timeout
        })??;

    Ok((StatusCode::CREATED, Json(Server::clone(&server))))
}

pub async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Server>, ApiError> {
    let server = state.manager.get_server(&id).ok_or(ApiError::NotFound)?;
    Ok(Json(Server::clone(&server)))
}

pub async fn close_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<CloseServerResponse>), ApiError> {
    let pending = state.manager.close_server(&id).ok_or(ApiError::NotFound)?;
    let response = CloseServerResponse {
        id: id.clone(),
        vps_id: pending.vps_id().to_string(),
    };

    tokio::spawn(async move {
        if let Err(e) = pending.wait().await {
            tracing::warn!(server_id = %id, error = %e, "failed to stop server");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(response)))
}
