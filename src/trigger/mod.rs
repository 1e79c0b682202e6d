//! Trigger sources and the dispatch funnel. Every firing, whatever its
//! source, passes through [`Dispatcher::dispatch`] on its way to the handler,
//! which is the one place node identity is stamped, task snapshots are
//! injected, and task results are forwarded.

pub mod stream;
pub mod timer;

use std::sync::Arc;

use anyhow::Context as _;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::TriggerConfig;
use crate::handler::Handler;
use crate::model::{TriggerEvent, TriggerPayload};
use crate::reporter::ResultReporter;
use crate::state::NodeState;
use crate::store::TaskInstanceStore;

use self::stream::StreamTrigger;
use self::timer::TimerTrigger;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(transparent)]
    Timer(#[from] timer::TimerError),
    #[error("stream trigger '{name}': {source}")]
    Stream {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// The single path between triggers and the handler.
pub struct Dispatcher {
    handler: Arc<dyn Handler>,
    state: Arc<NodeState>,
    store: Arc<TaskInstanceStore>,
    reporter: ResultReporter,
}

impl Dispatcher {
    pub fn new(
        handler: Arc<dyn Handler>,
        state: Arc<NodeState>,
        store: Arc<TaskInstanceStore>,
        reporter: ResultReporter,
    ) -> Self {
        Self {
            handler,
            state,
            store,
            reporter,
        }
    }

    /// Runs one event through the handler.
    ///
    /// Before the handler sees the event, its metadata is stamped with this
    /// node's identity and an empty payload is replaced by the current task
    /// snapshot, hash included, so an out-of-process handler always receives
    /// complete context. The handler runs on its own task: cancelling or
    /// dropping the future returned here never aborts an invocation already
    /// under way.
    ///
    /// Task results in the response are forwarded fire-and-forget. Handler
    /// errors are returned verbatim so the calling trigger decides what
    /// failure means (a nak, a log line); nothing here turns one into a
    /// silent success.
    pub async fn dispatch(&self, mut event: TriggerEvent) -> anyhow::Result<()> {
        let (node_id, version) = self.state.identity();
        event.metadata.insert("nodeID".to_string(), node_id);
        event.metadata.insert("version".to_string(), version);

        if event.payload.is_empty() {
            let (tasks, tasks_md5) = self.store.snapshot();
            let snapshot = TriggerPayload { tasks, tasks_md5 };
            event.payload =
                serde_json::to_vec(&snapshot).context("failed to encode task snapshot")?;
        }

        debug!(
            trigger = %event.name,
            kind = %event.kind,
            payload_bytes = event.payload.len(),
            "dispatching event"
        );

        let trigger = event.name.clone();
        let handler = Arc::clone(&self.handler);
        let response = tokio::spawn(async move { handler.on_trigger(event).await })
            .await
            .context("handler task aborted")?;

        match response {
            Ok(response) => {
                for result in response.task_results {
                    self.reporter.report_async(result);
                }
                Ok(())
            }
            Err(e) => {
                error!(trigger = %trigger, "handler failed: {e:#}");
                Err(e)
            }
        }
    }
}

/// Owns every configured trigger and its lifecycle.
pub struct TriggerManager {
    dispatcher: Arc<Dispatcher>,
    timer: Arc<TimerTrigger>,
    streams: Vec<StreamTrigger>,
}

impl TriggerManager {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let timer = Arc::new(TimerTrigger::new(Arc::clone(&dispatcher)));
        Self {
            dispatcher,
            timer,
            streams: Vec::new(),
        }
    }

    /// Builds triggers from configuration, failing on the first bad
    /// definition so a typo'd cron expression never leaves the agent
    /// partially armed.
    pub fn register(&mut self, configs: &[TriggerConfig]) -> Result<(), TriggerError> {
        for config in configs {
            match config {
                TriggerConfig::Timer { name, settings } => {
                    let granularity = self.timer.add_entry(name, &settings.cron)?;
                    info!(
                        trigger = %name,
                        cron = %settings.cron,
                        granularity = %granularity,
                        "registered timer trigger"
                    );
                }
                TriggerConfig::Stream { name, settings } => {
                    self.streams.push(StreamTrigger::new(
                        name,
                        settings.clone(),
                        Arc::clone(&self.dispatcher),
                    ));
                    info!(
                        trigger = %name,
                        stream = %settings.stream,
                        subject = %settings.subject,
                        "registered stream trigger"
                    );
                }
            }
        }
        Ok(())
    }

    /// Starts every stream consumer. Timer entries need no start step, an
    /// external clock drives them through [`TimerTrigger::tick`].
    pub async fn start(&mut self, shutdown: &CancellationToken) -> Result<(), TriggerError> {
        for stream in &mut self.streams {
            stream.start(shutdown.clone()).await?;
        }
        Ok(())
    }

    pub async fn stop(&mut self) {
        for stream in &mut self.streams {
            stream.stop().await;
        }
    }

    pub fn timer(&self) -> Arc<TimerTrigger> {
        Arc::clone(&self.timer)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}
