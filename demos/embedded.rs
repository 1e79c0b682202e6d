// SPDX-License-Identifier: MIT
//! Minimal embedder: runs the agent in-process with a logging handler
//! instead of the HTTP sidecar bridge.
//!
//! Every 10 seconds the timer fires, the handler receives the current task
//! snapshot, and each valid assigned task is acknowledged as successful.
//! Without an authority configured the heartbeat skips quietly, so this runs
//! standalone.
//!
//! Run with: cargo run --example embedded

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use noded::config::{NodeConfig, TimerSettings, TriggerConfig};
use noded::model::{TaskResult, TaskStatus, TriggerEvent, TriggerPayload, TriggerResponse};
use noded::{Agent, AgentContext, Handler};

struct LoggingHandler;

#[async_trait]
impl Handler for LoggingHandler {
    fn name(&self) -> &str {
        "logging"
    }

    async fn init(&self, ctx: &AgentContext) -> anyhow::Result<()> {
        info!(version = %ctx.state.version(), "logging handler ready");
        Ok(())
    }

    async fn on_trigger(&self, event: TriggerEvent) -> anyhow::Result<TriggerResponse> {
        let snapshot: TriggerPayload = serde_json::from_slice(&event.payload)?;
        info!(
            trigger = %event.name,
            tasks = snapshot.tasks.len(),
            hash = %snapshot.tasks_md5,
            "trigger fired"
        );

        let task_results = snapshot
            .tasks
            .iter()
            .filter(|t| !t.invalid)
            .map(|t| TaskResult {
                task_id: t.task_id.clone(),
                status: TaskStatus::Success,
                result: String::new(),
            })
            .collect();
        Ok(TriggerResponse { task_results })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut config = NodeConfig::default();
    config.system.version = "0.1.0".to_string();
    config.triggers.push(TriggerConfig::Timer {
        name: "demo-sweep".to_string(),
        settings: TimerSettings {
            cron: "*/10 * * * * *".to_string(),
        },
    });

    let agent = Agent::new(config, Arc::new(LoggingHandler));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        signal_token.cancel();
    });

    agent.run(shutdown).await?;
    Ok(())
}
