//! Inbound probe handling. A probe is how the authority (or its gateway)
//! discovers this node and, crucially, how the node first learns the address
//! results and heartbeats should go to. The HTTP surface that receives the
//! probe is the embedder's concern; this module owns the semantics.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::model::{
    HeartbeatInfo, NodeInfo, ProbeDetails, ProbeRequest, ProbeResponse, SystemInfo,
};
use crate::state::NodeState;

pub struct ProbeHandler {
    state: Arc<NodeState>,
    heartbeat_interval: Duration,
}

impl ProbeHandler {
    pub fn new(state: Arc<NodeState>, heartbeat_interval: Duration) -> Self {
        Self {
            state,
            heartbeat_interval,
        }
    }

    /// Adopts whatever the probe teaches (node id from the environment if
    /// still unset, authority address if supplied), then answers with a
    /// status snapshot.
    pub fn handle(&self, probe: &ProbeRequest) -> ProbeResponse {
        if self.state.node_id().is_empty() {
            self.state.init_node_id_from_env();
        }
        self.state.set_authority(&probe.server_ip, probe.server_port);

        let (node_id, version) = self.state.identity();
        info!(
            node_id = %node_id,
            action = %probe.action,
            request_id = %probe.request_id,
            "probe handled"
        );

        let (authority_host, authority_port) = self
            .state
            .authority()
            .unwrap_or_else(|| (String::new(), 0));

        let mut sys = sysinfo::System::new();
        sys.refresh_memory();

        ProbeResponse {
            node_id: node_id.clone(),
            state: "running".to_string(),
            timestamp: chrono::Utc::now(),
            details: ProbeDetails {
                node_info: NodeInfo {
                    node_id,
                    node_type: "noded".to_string(),
                    version,
                },
                system_info: SystemInfo {
                    os: std::env::consts::OS.to_string(),
                    arch: std::env::consts::ARCH.to_string(),
                    num_cpus: std::thread::available_parallelism()
                        .map(|n| n.get())
                        .unwrap_or(1),
                    memory_used_mb: sys.used_memory() / (1024 * 1024),
                },
                heartbeat_info: HeartbeatInfo {
                    interval: format!("{}s", self.heartbeat_interval.as_secs()),
                    server_ip: authority_host,
                    server_port: authority_port,
                },
            },
        }
    }
}
