//! HTTP transport adapter
//!
//! Accepts inbound events, exposes per-user state and flow statistics, and
//! streams every outbound prompt over SSE.

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::runtime::RuntimeManager;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeManager>,
}

impl AppState {
    pub fn new(runtime: Arc<RuntimeManager>) -> Self {
        Self { runtime }
    }
}
