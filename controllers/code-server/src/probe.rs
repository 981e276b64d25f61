//! Liveness probes against the exporter sidecar.

use crate::error::ControllerError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    /// Anything other than a 2xx answer within the timeout
    Unhealthy(String),
}

impl ProbeOutcome {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, endpoint: &str) -> ProbeOutcome;
}

/// HTTP GET prober; success means a 2xx status.
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self, ControllerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ControllerError::Probe(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, endpoint: &str) -> ProbeOutcome {
        match self.client.get(endpoint).send().await {
            Ok(response) if response.status().is_success() => ProbeOutcome::Healthy,
            Ok(response) => {
                debug!("Probe {} answered {}", endpoint, response.status());
                ProbeOutcome::Unhealthy(format!("status {}", response.status()))
            }
            Err(e) if e.is_timeout() => ProbeOutcome::Unhealthy("timed out".to_string()),
            Err(e) => ProbeOutcome::Unhealthy(e.to_string()),
        }
    }
}
