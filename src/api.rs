//! HTTP API
//!
//! `POST /api/agent` streams a session as SSE; thread inspection and
//! cancellation are plain JSON.

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;
pub use types::*;

use crate::runtime::ProductionOrchestrator;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ProductionOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<ProductionOrchestrator>) -> Self {
        Self { orchestrator }
    }
}
