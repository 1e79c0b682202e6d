//! The pluggable business-logic boundary. The core never interprets task
//! parameters or payloads; it hands every trigger event to a [`Handler`] and
//! forwards whatever task results come back. Two variants exist: any
//! in-process implementation of the trait, and [`HttpHandler`] bridging to an
//! out-of-process sidecar over HTTP.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::HandlerConfig;
use crate::model::{TriggerEvent, TriggerResponse};
use crate::AgentContext;

/// Business-logic boundary. `on_trigger` must tolerate concurrent calls from
/// different trigger sources.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    /// Called once at startup, before any trigger is armed.
    async fn init(&self, ctx: &AgentContext) -> Result<()>;

    /// Called once per dispatched event.
    async fn on_trigger(&self, event: TriggerEvent) -> Result<TriggerResponse>;

    /// Fixed extra fields merged into every heartbeat payload.
    fn heartbeat_extra(&self) -> Option<Map<String, Value>> {
        None
    }

    /// Extra fields recomputed for each heartbeat; merged after (and over)
    /// the fixed ones.
    fn dynamic_heartbeat_extra(&self) -> Option<Map<String, Value>> {
        None
    }
}

type ExtraFn = Box<dyn Fn() -> Map<String, Value> + Send + Sync>;

/// Remote handler bridge: the sidecar exposes `GET /health` and
/// `POST /on-trigger`, and the agent treats it as opaque business logic.
pub struct HttpHandler {
    name: String,
    base_url: String,
    client: reqwest::Client,
    ready_timeout: Duration,
    extra: Option<Map<String, Value>>,
    extra_fn: Option<ExtraFn>,
}

impl HttpHandler {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            name: name.into(),
            base_url,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            ready_timeout: Duration::from_secs(30),
            extra: None,
            extra_fn: None,
        }
    }

    pub fn from_config(cfg: &HandlerConfig) -> Self {
        Self::new(cfg.name.clone(), cfg.base_url.clone())
            .with_ready_timeout(Duration::from_secs(cfg.ready_timeout_secs))
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_heartbeat_extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = Some(extra);
        self
    }

    pub fn with_heartbeat_extra_fn(
        mut self,
        f: impl Fn() -> Map<String, Value> + Send + Sync + 'static,
    ) -> Self {
        self.extra_fn = Some(Box::new(f));
        self
    }

    /// Event as the sidecar sees it. Payload bytes that parse as JSON are
    /// embedded as-is; anything else is forwarded as a JSON string.
    fn wire_event(event: &TriggerEvent) -> Value {
        let payload = if event.payload.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&event.payload).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&event.payload).into_owned())
            })
        };
        serde_json::json!({
            "type": event.kind,
            "name": event.name,
            "payload": payload,
            "metadata": event.metadata,
        })
    }
}

#[async_trait]
impl Handler for HttpHandler {
    fn name(&self) -> &str {
        &self.name
    }

    /// Polls the sidecar's health endpoint once a second until it answers
    /// 200 or the ready timeout elapses. Startup fails on timeout: arming
    /// triggers against a handler that was never up only produces a stream
    /// of dispatch errors.
    async fn init(&self, _ctx: &AgentContext) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            match self
                .client
                .get(&url)
                .timeout(Duration::from_secs(2))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    info!(handler = %self.name, url = %self.base_url, "handler sidecar ready");
                    return Ok(());
                }
                Ok(resp) => {
                    debug!(handler = %self.name, status = %resp.status(), "handler not ready yet");
                }
                Err(e) => {
                    debug!(handler = %self.name, err = %e, "handler not reachable yet");
                }
            }
            if Instant::now() >= deadline {
                bail!(
                    "handler '{}' at {} not ready within {:?}",
                    self.name,
                    self.base_url,
                    self.ready_timeout
                );
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn on_trigger(&self, event: TriggerEvent) -> Result<TriggerResponse> {
        let url = format!("{}/on-trigger", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&Self::wire_event(&event))
            .send()
            .await
            .with_context(|| format!("handler '{}' unreachable at {url}", self.name))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("handler '{}' returned {status}: {body}", self.name);
        }

        let body = resp.bytes().await.unwrap_or_default();
        if body.is_empty() {
            return Ok(TriggerResponse::default());
        }
        match serde_json::from_slice(&body) {
            Ok(parsed) => Ok(parsed),
            Err(e) => {
                debug!(handler = %self.name, err = %e, "unparseable trigger response, treating as empty");
                Ok(TriggerResponse::default())
            }
        }
    }

    fn heartbeat_extra(&self) -> Option<Map<String, Value>> {
        self.extra.clone()
    }

    fn dynamic_heartbeat_extra(&self) -> Option<Map<String, Value>> {
        self.extra_fn.as_ref().map(|f| f())
    }
}
