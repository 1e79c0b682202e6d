// SPDX-License-Identifier: MIT
//! Fire-and-forget delivery of task outcomes to the authority. Reporting is
//! best-effort: it never blocks or fails the dispatch that produced the
//! result, and a lost report surfaces on the authority's side as a task that
//! never completed.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::TaskResult;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::state::NodeState;

const REPORT_PATH: &str = "/gateway/collectmgr/ReportTaskStatus";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("authority returned {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Serialize)]
struct ReportRequest<'a> {
    id: &'a str,
    node_id: &'a str,
    status: u8,
    result: &'a str,
}

#[derive(Clone)]
pub struct ResultReporter {
    state: Arc<NodeState>,
    client: reqwest::Client,
    retry: RetryConfig,
}

impl ResultReporter {
    pub fn new(state: Arc<NodeState>) -> Self {
        Self {
            state,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            retry: RetryConfig::result_report(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Detaches immediately; the caller never learns the outcome. Failures
    /// after retry exhaustion are logged and dropped.
    pub fn report_async(&self, result: TaskResult) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.report(&result).await {
                warn!(task_id = %result.task_id, err = %e, "task result report failed");
            }
        });
    }

    /// One report with bounded retries. Skips quietly (returning `Ok`) while
    /// the authority address is still unknown; there is nowhere to send the
    /// result and the task itself already ran.
    pub async fn report(&self, result: &TaskResult) -> Result<(), ReportError> {
        let Some((host, port)) = self.state.authority() else {
            warn!(task_id = %result.task_id, "authority address unknown, skipping result report");
            return Ok(());
        };
        let url = format!("http://{host}:{port}{REPORT_PATH}");
        let node_id = self.state.node_id();
        let body = ReportRequest {
            id: &result.task_id,
            node_id: &node_id,
            status: result.status.code(),
            result: &result.result,
        };

        retry_with_backoff("result_report", &self.retry, || async {
            let resp = self.client.post(&url).json(&body).send().await?;
            if resp.status().is_success() {
                Ok(())
            } else {
                Err(ReportError::Status(resp.status()))
            }
        })
        .await?;

        info!(
            task_id = %result.task_id,
            status = result.status.code(),
            "task result reported"
        );
        Ok(())
    }
}
