use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{ReportedAgent, ReportedAgents};

/// The HTTP status endpoint every agent container serves on its mapped port.
#[async_trait]
pub trait AgentEndpoint: Send + Sync {
    /// Poll until the endpoint answers 2xx. Returns `false` when `timeout`
    /// passes or `cancel` fires first.
    async fn wait_ready(&self, port: u16, timeout: Duration, cancel: &CancellationToken) -> bool;

    /// Agents the container reports about itself.
    async fn list_agents(&self, port: u16) -> Result<Vec<ReportedAgent>>;
}

pub struct HttpAgentEndpoint {
    client: reqwest::Client,
    host: String,
    interval: Duration,
}

impl HttpAgentEndpoint {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            host: "127.0.0.1".to_string(),
            interval: Duration::from_secs(1),
        })
    }

    #[cfg(test)]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn url(&self, port: u16) -> String {
        format!("http://{}:{}/agents", self.host, port)
    }
}

#[async_trait]
impl AgentEndpoint for HttpAgentEndpoint {
    async fn wait_ready(&self, port: u16, timeout: Duration, cancel: &CancellationToken) -> bool {
        let deadline = Instant::now() + timeout;
        let url = self.url(port);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(port, attempt, "Agent endpoint ready");
                    return true;
                }
                Ok(resp) => debug!(port, attempt, status = %resp.status(), "Agent endpoint not ready"),
                Err(e) => debug!(port, attempt, "Agent endpoint not reachable: {}", e),
            }

            if Instant::now() + self.interval > deadline {
                return false;
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    async fn list_agents(&self, port: u16) -> Result<Vec<ReportedAgent>> {
        let url = self.url(port);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?
            .error_for_status()
            .with_context(|| format!("Agent endpoint {} returned an error", url))?;

        let body: ReportedAgents = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse agents from {}", url))?;
        Ok(body.agents)
    }
}
