use axum::Json;
use axum::extract::State;
use cm_fleet::VpsStatus;

use crate::dto::ReloadResponse;
use crate::error::ApiError;
use crate::state::AppState;

pub async fn list_vps(State(state): State<AppState>) -> Json<Vec<VpsStatus>> {
    let nodes = state
        .manager
        .get_vps()
        .iter()
        .map(|vps| vps.status())
        .collect();
    Json(nodes)
}

/// Re-read the fleet config. Every node is rebuilt and its link has to reconnect.
pub async fn reload(State(state): State<AppState>) -> Result<Json<ReloadResponse>, ApiError> {
    state.manager.reload()?;

    let config = state.manager.config();
    Ok(Json(ReloadResponse {
        nodes: config.nodes.len(),
        server_types: config.server_types.clone(),
    }))
}
