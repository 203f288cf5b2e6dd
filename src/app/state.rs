//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::room::RoomManager;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub room_manager: Arc<RoomManager>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let room_manager = Arc::new(RoomManager::new(config.room_count, &config.battle));
        Self {
            config: Arc::new(config),
            room_manager,
        }
    }
}
