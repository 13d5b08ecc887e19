//! Client for the sandboxed Python executor service. One binding per
//! session; a single call API returning combined stdout+stderr.

use crate::config::ExecutorConfig;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Executes analysis code in a per-session sandbox
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    /// Run code bound to a session; returns combined stdout+stderr
    async fn execute(&self, session_id: Uuid, code: &str) -> Result<String>;

    /// Release the session's sandbox binding
    async fn cleanup(&self, session_id: Uuid) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    session_id: &'a str,
    code: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    output: String,
}

/// HTTP implementation against the executor microservice
pub struct HttpCodeExecutor {
    client: reqwest::Client,
    config: ExecutorConfig,
}

impl HttpCodeExecutor {
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.exec_timeout_secs))
            .build()
            .map_err(|e| EngineError::Executor(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }
}

#[async_trait]
impl CodeExecutor for HttpCodeExecutor {
    async fn execute(&self, session_id: Uuid, code: &str) -> Result<String> {
        debug!("Executing {} bytes of code for session {session_id}", code.len());

        let request = ExecuteRequest { session_id: &session_id.to_string(), code };
        let response = self
            .client
            .post(self.url("execute"))
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::Executor(e.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Executor(body));
        }

        let parsed: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Executor(e.to_string()))?;
        Ok(parsed.output)
    }

    async fn cleanup(&self, session_id: Uuid) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("cleanup/{session_id}")))
            .send()
            .await
            .map_err(|e| EngineError::Executor(e.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Executor(body));
        }
        Ok(())
    }
}
