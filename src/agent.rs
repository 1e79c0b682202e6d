//! Agent assembly: builds the shared state, initializes the handler, arms the
//! configured triggers, and runs the heartbeat loop in the foreground until
//! shutdown or a fatal version mismatch.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::handler::Handler;
use crate::heartbeat::{SyncError, SyncReporter};
use crate::reporter::ResultReporter;
use crate::state::NodeState;
use crate::store::TaskInstanceStore;
use crate::trigger::{Dispatcher, TriggerError, TriggerManager};
use crate::AgentContext;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("handler init failed: {0:#}")]
    HandlerInit(anyhow::Error),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// One node agent. Construct it with a [`Handler`] implementation, then call
/// [`Agent::run`]; everything else is driven by configuration.
pub struct Agent {
    config: Arc<NodeConfig>,
    state: Arc<NodeState>,
    store: Arc<TaskInstanceStore>,
    handler: Arc<dyn Handler>,
}

impl Agent {
    pub fn new(config: NodeConfig, handler: Arc<dyn Handler>) -> Self {
        let state = Arc::new(NodeState::new(config.system.version.clone()));
        Self {
            config: Arc::new(config),
            state,
            store: Arc::new(TaskInstanceStore::new()),
            handler,
        }
    }

    pub fn context(&self) -> AgentContext {
        AgentContext {
            config: Arc::clone(&self.config),
            state: Arc::clone(&self.state),
            store: Arc::clone(&self.store),
        }
    }

    pub fn state(&self) -> Arc<NodeState> {
        Arc::clone(&self.state)
    }

    pub fn store(&self) -> Arc<TaskInstanceStore> {
        Arc::clone(&self.store)
    }

    /// Runs until `shutdown` is cancelled or the authority reports a version
    /// mismatch. In the mismatch case every trigger is stopped before the
    /// error is returned, so the process exits cleanly for its restart.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let node_id = self.state.init_node_id_from_env();
        if node_id.is_empty() {
            warn!("no node id in environment, heartbeats wait for a probe");
        }
        self.state.set_authority(
            &self.config.heartbeat.authority_host,
            self.config.heartbeat.authority_port,
        );

        let ctx = self.context();
        self.handler
            .init(&ctx)
            .await
            .map_err(AgentError::HandlerInit)?;
        info!(handler = %self.handler.name(), "handler initialized");

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.handler),
            Arc::clone(&self.state),
            Arc::clone(&self.store),
            ResultReporter::new(Arc::clone(&self.state)),
        ));
        let mut manager = TriggerManager::new(dispatcher);
        manager.register(&self.config.triggers)?;
        manager.start(&shutdown).await?;

        // One ticker per granularity actually in use; an agent with only
        // hourly entries never wakes once a second.
        let timer = manager.timer();
        let mut tickers = Vec::new();
        for granularity in timer.granularities() {
            let timer = Arc::clone(&timer);
            let token = shutdown.child_token();
            tickers.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(granularity.tick_period());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    timer.tick(granularity, chrono::Utc::now()).await;
                }
            }));
        }

        info!(
            timers = timer.entry_count(),
            streams = manager.stream_count(),
            "agent started"
        );

        let sync = SyncReporter::new(
            Arc::clone(&self.state),
            Arc::clone(&self.store),
            Arc::clone(&self.handler),
            Duration::from_secs(self.config.heartbeat.interval_secs.max(1)),
        );
        let outcome = sync.run(shutdown.clone()).await;
        if outcome.is_err() {
            shutdown.cancel();
        }

        manager.stop().await;
        for ticker in tickers {
            let _ = ticker.await;
        }
        info!("agent stopped");
        outcome?;
        Ok(())
    }
}
