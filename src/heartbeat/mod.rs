//! Heartbeat: the periodic state sync with the authority. Every round pushes
//! node identity plus the current task-list hash; the authority answers with
//! a full replacement list only when its hash disagrees, so the common case
//! stays a small fixed-size exchange.
//!
//! One condition is deliberately fatal: a `package_version` in the response
//! that differs from the local version means this node is running stale code,
//! and the loop unwinds so the supervising platform restarts it on the
//! expected build. Everything else is logged and retried next round.

pub mod probe;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handler::Handler;
use crate::model::{SyncData, SyncEnvelope};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::state::NodeState;
use crate::store::TaskInstanceStore;

const HEARTBEAT_PATH: &str = "/gateway/cloudnode/ReportHeartbeatInner";
/// Node type tag the authority uses to group agents.
const NODE_TYPE: &str = "noded";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("authority returned {0}")]
    Status(reqwest::StatusCode),
    #[error("local version '{local}' does not match authority package version '{remote}'")]
    VersionMismatch { local: String, remote: String },
}

/// What one heartbeat round did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Identity or authority address still unknown; nothing was sent.
    Skipped,
    /// Hash matched; assignments untouched.
    Unchanged,
    /// Store replaced with this many instances.
    Replaced(usize),
}

pub struct SyncReporter {
    state: Arc<NodeState>,
    store: Arc<TaskInstanceStore>,
    handler: Arc<dyn Handler>,
    client: reqwest::Client,
    retry: RetryConfig,
    interval: Duration,
}

impl SyncReporter {
    pub fn new(
        state: Arc<NodeState>,
        store: Arc<TaskInstanceStore>,
        handler: Arc<dyn Handler>,
        interval: Duration,
    ) -> Self {
        Self {
            state,
            store,
            handler,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            retry: RetryConfig::heartbeat(),
            interval,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Heartbeat loop. Returns `Ok` on shutdown; the only `Err` is the fatal
    /// version mismatch, raised at most once, after which no further round
    /// runs. The first round fires immediately so a restarted node resyncs
    /// without waiting a full interval.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SyncError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            match self.report_once().await {
                Ok(_) => {}
                Err(SyncError::VersionMismatch { local, remote }) => {
                    error!(
                        %local,
                        %remote,
                        "authority expects a different package version, terminating for redeploy"
                    );
                    return Err(SyncError::VersionMismatch { local, remote });
                }
                Err(e) => {
                    // Already warned per attempt; the next cycle is the retry.
                    warn!(err = %e, "heartbeat round failed");
                }
            }
        }
    }

    /// One full round: build payload, POST with retries, parse leniently,
    /// apply the response.
    pub async fn report_once(&self) -> Result<SyncOutcome, SyncError> {
        let (node_id, version) = self.state.identity();
        if node_id.is_empty() {
            warn!("node id unknown, skipping heartbeat");
            return Ok(SyncOutcome::Skipped);
        }
        let Some((host, port)) = self.state.authority() else {
            debug!("authority address unknown, skipping heartbeat");
            return Ok(SyncOutcome::Skipped);
        };

        let url = format!("http://{host}:{port}{HEARTBEAT_PATH}");
        let payload = self.build_payload(&node_id, &version);
        let data = self.exchange(&url, &payload).await?;
        self.apply(data, &version)
    }

    /// Handler extras first (dynamic over static), base fields last so an
    /// extra can never clobber `node_id` or `tasks_md5`.
    fn build_payload(&self, node_id: &str, version: &str) -> Value {
        let mut payload = Map::new();
        if let Some(extra) = self.handler.heartbeat_extra() {
            payload.extend(extra);
        }
        if let Some(extra) = self.handler.dynamic_heartbeat_extra() {
            payload.extend(extra);
        }
        payload.insert("node_id".into(), node_id.into());
        payload.insert("node_type".into(), NODE_TYPE.into());
        payload.insert(
            "timestamp".into(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        payload.insert(
            "metadata".into(),
            serde_json::json!({
                "version": version,
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
            }),
        );
        payload.insert("tasks_md5".into(), self.store.current_hash().into());
        Value::Object(payload)
    }

    /// POST with bounded retries. Only transport failures and non-2xx
    /// statuses burn attempts; a 2xx with an unusable body is handled
    /// leniently downstream.
    async fn exchange(&self, url: &str, payload: &Value) -> Result<SyncData, SyncError> {
        let body = retry_with_backoff("heartbeat", &self.retry, || async {
            let resp = self.client.post(url).json(payload).send().await?;
            if !resp.status().is_success() {
                return Err(SyncError::Status(resp.status()));
            }
            Ok(resp.bytes().await?)
        })
        .await?;
        Ok(self.parse_response(&body))
    }

    /// A malformed body or an application-level error code is a warning and
    /// an empty result, never a retry: the next scheduled round will ask
    /// again anyway.
    fn parse_response(&self, body: &[u8]) -> SyncData {
        let envelope: SyncEnvelope = match serde_json::from_slice(body) {
            Ok(env) => env,
            Err(e) => {
                warn!(err = %e, "unparseable heartbeat response, ignoring");
                return SyncData::default();
            }
        };
        if envelope.code != 200 {
            warn!(
                code = envelope.code,
                message = %envelope.message,
                "authority rejected heartbeat"
            );
            return SyncData::default();
        }
        let Some(first) = envelope.data.into_iter().next() else {
            debug!("heartbeat response carried no data");
            return SyncData::default();
        };
        match serde_json::from_value(first) {
            Ok(data) => data,
            Err(e) => {
                warn!(err = %e, "malformed heartbeat data, ignoring");
                SyncData::default()
            }
        }
    }

    fn apply(&self, data: SyncData, local_version: &str) -> Result<SyncOutcome, SyncError> {
        if let Some(remote) = data.package_version.as_deref() {
            if !remote.is_empty() && remote != local_version {
                return Err(SyncError::VersionMismatch {
                    local: local_version.to_string(),
                    remote: remote.to_string(),
                });
            }
        }

        if data.server_ip.is_some() || data.server_port.is_some() {
            self.state.set_authority(
                data.server_ip.as_deref().unwrap_or(""),
                data.server_port.unwrap_or(0),
            );
        }

        match data.task_instances {
            Some(tasks) if !tasks.is_empty() => {
                let count = tasks.len();
                self.store.replace(tasks);
                info!(
                    count,
                    hash = %self.store.current_hash(),
                    "task assignments replaced"
                );
                Ok(SyncOutcome::Replaced(count))
            }
            _ => {
                debug!("task hash matched, no assignment update");
                Ok(SyncOutcome::Unchanged)
            }
        }
    }
}
