//! REST companion to the event stream: trigger, fetch, history, cancel,
//! resume. The stream keeps a run's state current; this client is how a
//! run comes into existence and how historical runs are read back.

use crate::error::{ClientError, Result};
use crate::run::{JsonMap, Run};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Serialize)]
struct TriggerRequest<'a> {
    trigger_payload: &'a JsonMap,
}

#[derive(Deserialize)]
struct TriggerResponse {
    run_id: String,
}

/// HTTP client for the workflow engine's run endpoints.
#[derive(Clone)]
pub struct RunsApi {
    base_url: String,
    http_client: Client,
}

impl RunsApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url,
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Start a run of `workflow_id`; returns the new run id, which is what
    /// a stream subscription wants next.
    pub async fn trigger(&self, workflow_id: &str, trigger_payload: &JsonMap) -> Result<String> {
        let url = format!("{}/runs/workflow/{}/trigger", self.base_url, workflow_id);
        debug!(%workflow_id, "triggering workflow run");
        let response = self
            .http_client
            .post(&url)
            .json(&TriggerRequest { trigger_payload })
            .send()
            .await?;
        let body = check(response).await?.json::<TriggerResponse>().await?;
        Ok(body.run_id)
    }

    /// Fetch one run with its step runs.
    pub async fn get_run(&self, run_id: &str) -> Result<Run> {
        let url = format!("{}/runs/{}", self.base_url, run_id);
        let response = self.http_client.get(&url).send().await?;
        Ok(check(response).await?.json::<Run>().await?)
    }

    /// Run history for a workflow, newest first.
    pub async fn history(&self, workflow_id: &str) -> Result<Vec<Run>> {
        let url = format!("{}/runs/workflow/{}", self.base_url, workflow_id);
        let response = self.http_client.get(&url).send().await?;
        Ok(check(response).await?.json::<Vec<Run>>().await?)
    }

    pub async fn cancel(&self, run_id: &str) -> Result<()> {
        let url = format!("{}/runs/{}/cancel", self.base_url, run_id);
        debug!(%run_id, "cancelling run");
        let response = self.http_client.post(&url).send().await?;
        check(response).await?;
        Ok(())
    }

    /// Resume a run paused on an approval step.
    pub async fn resume(&self, run_id: &str) -> Result<()> {
        let url = format!("{}/runs/{}/resume", self.base_url, run_id);
        debug!(%run_id, "resuming run");
        let response = self.http_client.post(&url).send().await?;
        check(response).await?;
        Ok(())
    }
}

/// Map non-2xx responses to [`ClientError::Api`] carrying status and body.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}
