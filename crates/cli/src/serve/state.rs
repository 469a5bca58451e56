//! Shared application state handed to every route.

use std::sync::Arc;

use fabric_state::StateService;
use fabric_tools::{ToolExecutor, ToolRegistry};
use tokio::sync::Mutex;

pub(crate) struct AppState {
    /// Name of the scenario hosting this server.
    pub(crate) scenario: String,
    pub(crate) states: StateService,
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) executor: Arc<ToolExecutor>,
    /// Serializes refresh + sync so two refreshes never interleave their
    /// handler bindings.
    pub(crate) refresh_lock: Mutex<()>,
}

impl AppState {
    pub(crate) fn new(
        scenario: String,
        states: StateService,
        registry: Arc<ToolRegistry>,
        executor: Arc<ToolExecutor>,
    ) -> Self {
        Self {
            scenario,
            states,
            registry,
            executor,
            refresh_lock: Mutex::new(()),
        }
    }
}
