use super::{GateError, JobStatusSource};
use crate::domain::JobStatus;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_GATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads job states from `GET {base}/api/v1/jobs/{id}/status`.
#[derive(Debug, Clone)]
pub struct HttpJobStatusClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpJobStatusClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build job status client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn status_url(&self, job_id: &str) -> String {
        format!("{}/api/v1/jobs/{}/status", self.base_url, job_id)
    }
}

#[async_trait]
impl JobStatusSource for HttpJobStatusClient {
    async fn status(&self, job_id: &str) -> Result<JobStatus, GateError> {
        let response = self
            .client
            .get(self.status_url(job_id))
            .send()
            .await
            .map_err(|err| GateError::Unreachable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GateError::UnexpectedStatus {
                code: status.as_u16(),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|err| GateError::Unreachable(err.to_string()))?;
        parse_status(&text)
    }
}

/// Accepts a bare word, a JSON string, or an object with a `status` field.
fn parse_status(text: &str) -> Result<JobStatus, GateError> {
    let state = match serde_json::from_str::<Value>(text) {
        Ok(Value::String(state)) => state,
        Ok(Value::Object(map)) => match map.get("status") {
            Some(Value::String(state)) => state.clone(),
            _ => return Err(GateError::UnknownState(text.trim().to_string())),
        },
        _ => text.trim().to_string(),
    };
    state.parse().map_err(|_| GateError::UnknownState(state))
}
