//! Shared application state
//!
//! Everything the HTTP handlers need, bundled into one cheap-to-clone
//! handle. Construction happens once, in `main`; nothing in here is a
//! global.

use std::sync::Arc;

use crate::config::Config;
use crate::pipeline::Pipeline;

/// Handler-facing state: configuration plus the pipeline handle
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(config: Arc<Config>, pipeline: Arc<Pipeline>) -> Self {
        Self { config, pipeline }
    }
}
