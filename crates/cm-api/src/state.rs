use std::sync::Arc;

use cm_fleet::ServerManager;

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ServerManager>,
    pub config: AppConfig,
}
