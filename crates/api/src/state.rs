//! Application state

use edugate_entitlements::EntitlementEngine;
use std::sync::Arc;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<EntitlementEngine>,
    pub config: Config,
}

impl AppState {
    pub fn new(engine: EntitlementEngine, config: Config) -> Self {
        Self {
            engine: Arc::new(engine),
            config,
        }
    }
}
