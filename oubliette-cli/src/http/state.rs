//! Application state shared across every HTTP handler.

use std::sync::Arc;

use oubliette_core::BollardRuntime;
use oubliette_mcp::Dispatcher;

/// Cloned per request; everything behind it is already `Arc`'d.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher<BollardRuntime>>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher<BollardRuntime>>) -> Self {
        Self { dispatcher }
    }
}
