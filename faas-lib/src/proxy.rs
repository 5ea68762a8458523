//! Invocation proxy for live workers.

use faas_common::{ExecutionError, Result};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[derive(Serialize)]
struct WorkerRequest<'a> {
    payload: &'a str,
}

#[derive(Deserialize)]
struct WorkerResponse {
    result: Box<RawValue>,
}

/// HTTP client speaking the worker protocol.
#[derive(Debug, Clone, Default)]
pub struct WorkerClient {
    http: reqwest::Client,
    /// Per-invocation limit; `None` waits for the worker indefinitely
    timeout: Option<Duration>,
}

impl WorkerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http, timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Send `payload` to the worker at `endpoint` and return its `result`
    /// exactly as the worker encoded it.
    #[instrument(skip(self, payload), fields(payload_len = payload.len()))]
    pub async fn invoke(&self, endpoint: &str, payload: &str) -> Result<Box<RawValue>> {
        let url = worker_url(endpoint);
        let mut request = self.http.post(&url).json(&WorkerRequest { payload });
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;

        if status != reqwest::StatusCode::OK {
            warn!(%url, status = status.as_u16(), "Worker rejected invocation");
            return Err(ExecutionError::UpstreamStatus {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let parsed: WorkerResponse = serde_json::from_str(&body)
            .map_err(|e| ExecutionError::MalformedResponse(e.to_string()))?;
        debug!(%url, result_len = parsed.result.get().len(), "Worker invocation succeeded");
        Ok(parsed.result)
    }
}

fn worker_url(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}
