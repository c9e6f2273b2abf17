pub mod servers;
pub mod vps;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};

use crate::auth::auth_middleware;
use crate::link::link_handler;
use crate::state::AppState;

pub fn api_router(state: AppState) -> Router {
    let authed = Router::new()
        // Servers
        .route("/servers", post(servers::open_server))
        .route(
            "/servers/{id}",
            get(servers::get_server).delete(servers::close_server),
        )
        // Fleet
        .route("/vps", get(vps::list_vps))
        .route("/reload", post(vps::reload))
        // Auth middleware
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Nodes authenticate with their own token
    let link = Router::new().route("/link", get(link_handler));

    Router::new()
        .merge(authed)
        .merge(link)
        .with_state(state)
}
