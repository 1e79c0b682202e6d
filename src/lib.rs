pub mod agent;
pub mod config;
pub mod handler;
pub mod heartbeat;
pub mod model;
pub mod reporter;
pub mod retry;
pub mod state;
pub mod store;
pub mod trigger;

use std::sync::Arc;

use config::NodeConfig;
use state::NodeState;
use store::TaskInstanceStore;

// Re-exports so an embedder can wire an in-process handler without spelling
// out module paths.
pub use agent::{Agent, AgentError};
pub use handler::{Handler, HttpHandler};

/// Shared agent state handed to the handler at init time and to anything else
/// that needs identity or the current assignments.
#[derive(Clone)]
pub struct AgentContext {
    pub config: Arc<NodeConfig>,
    pub state: Arc<NodeState>,
    pub store: Arc<TaskInstanceStore>,
}
