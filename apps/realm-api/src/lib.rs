pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod routes;

use std::sync::Arc;

use auth::tokens::TokenService;
use config::Config;
use db::kv::KeyValueStore;
use gateway::HubHandle;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub tokens: Arc<TokenService>,
    pub hub: HubHandle,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config, kv: Arc<dyn KeyValueStore>, hub: HubHandle) -> Self {
        let tokens = Arc::new(TokenService::from_config(&config, kv));
        Self {
            tokens,
            hub,
            config: Arc::new(config),
        }
    }
}
