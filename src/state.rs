//! Process-wide node identity: node id, local version, and the authority
//! address reports go to. One record behind one lock, passed by reference to
//! every component that reports anywhere.

use std::sync::{PoisonError, RwLock};

use tracing::info;

/// Primary environment variable naming this node.
pub const NODE_ID_ENV: &str = "NODED_NODE_ID";
/// Fallback when the primary variable is unset.
const HOSTNAME_ENV: &str = "HOSTNAME";

#[derive(Debug, Default)]
struct Inner {
    node_id: String,
    version: String,
    authority_host: String,
    authority_port: u16,
}

/// Reads vastly outnumber writes here (every trigger and report reads, only
/// startup and probe/heartbeat corrections write), hence a single RwLock over
/// the whole record rather than finer-grained cells.
#[derive(Debug)]
pub struct NodeState {
    inner: RwLock<Inner>,
}

impl NodeState {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                version: version.into(),
                ..Inner::default()
            }),
        }
    }

    /// Resolves the node id from the environment (`NODED_NODE_ID`, then
    /// `HOSTNAME`) and stores it when found. Returns the id in effect
    /// afterwards; empty means the environment named nothing and heartbeats
    /// will keep skipping until a probe corrects it.
    pub fn init_node_id_from_env(&self) -> String {
        let resolved = std::env::var(NODE_ID_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| std::env::var(HOSTNAME_ENV).ok().filter(|v| !v.is_empty()));

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = resolved {
            if inner.node_id != id {
                info!(node_id = %id, "node id resolved from environment");
            }
            inner.node_id = id;
        }
        inner.node_id.clone()
    }

    pub fn node_id(&self) -> String {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.node_id.clone()
    }

    pub fn version(&self) -> String {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.version.clone()
    }

    /// Node id and version under one lock acquisition, for stamping events.
    pub fn identity(&self) -> (String, String) {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        (inner.node_id.clone(), inner.version.clone())
    }

    /// Authority address, or `None` while it is still unknown. Reporting
    /// paths skip quietly on `None` instead of erroring.
    pub fn authority(&self) -> Option<(String, u16)> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        if inner.authority_host.is_empty() || inner.authority_port == 0 {
            None
        } else {
            Some((inner.authority_host.clone(), inner.authority_port))
        }
    }

    /// Adopts a corrected authority address. Empty host / zero port never
    /// overwrite a known value, so a sparse probe cannot blank the address.
    pub fn set_authority(&self, host: &str, port: u16) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut changed = false;
        if !host.is_empty() && inner.authority_host != host {
            inner.authority_host = host.to_string();
            changed = true;
        }
        if port != 0 && inner.authority_port != port {
            inner.authority_port = port;
            changed = true;
        }
        if changed {
            info!(
                host = %inner.authority_host,
                port = inner.authority_port,
                "authority address updated"
            );
        }
    }
}
