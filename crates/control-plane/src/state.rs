// Shared application state for the HTTP layer

use std::sync::Arc;

use foreman_core::{Config, EventBus};
use foreman_forge::Forge;
use foreman_sandbox::Sandbox;
use foreman_storage::Storage;

use crate::engine::Engine;

/// State handed to every route
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<dyn Engine>,
    pub storage: Arc<dyn Storage>,
    pub forge: Arc<dyn Forge>,
    pub sandbox: Arc<dyn Sandbox>,
    pub bus: Arc<EventBus>,
    pub config: Arc<Config>,
}
