//! LXD API client
//!
//! Talks to an LXD server over HTTPS with client-certificate authentication.
//! Mutating calls return background operations; the client waits for them so
//! callers observe a finished state.

use crate::error::LxdError;
use crate::lxd_trait::LxdClientTrait;
use crate::models::{CreateInstanceRequest, Instance, InstanceState, LxdResponse, Operation};
use reqwest::{Client, Identity, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Seconds LXD is asked to wait for a background operation.
const OPERATION_WAIT_SECONDS: u64 = 60;

/// LXD REST API client
pub struct LxdClient {
    client: Client,
    base_url: String,
}

impl LxdClient {
    /// Create a new LXD client
    ///
    /// # Arguments
    /// * `base_url` - LXD endpoint (e.g., "https://lxd.internal:8443")
    /// * `cert_pem` - client certificate trusted by the server
    /// * `key_pem` - private key of the client certificate
    /// * `accept_invalid_certs` - skip server certificate verification (self-signed servers)
    pub fn new(
        base_url: String,
        cert_pem: &[u8],
        key_pem: &[u8],
        accept_invalid_certs: bool,
    ) -> Result<Self, LxdError> {
        let mut pem = Vec::with_capacity(cert_pem.len() + key_pem.len() + 1);
        pem.extend_from_slice(cert_pem);
        pem.push(b'\n');
        pem.extend_from_slice(key_pem);
        let identity = Identity::from_pem(&pem).map_err(|e| LxdError::Credentials(e.to_string()))?;

        let client = Client::builder()
            .identity(identity)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .timeout(Duration::from_secs(OPERATION_WAIT_SECONDS + 30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and unwrap the LXD envelope, turning error envelopes into `LxdError::Api`.
    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<LxdResponse<T>, LxdError> {
        let response = request.header("Accept", "application/json").send().await?;
        let status = response.status();
        let body = response.text().await?;

        let envelope: LxdResponse<T> = serde_json::from_str(&body).map_err(|e| LxdError::Api {
            code: status.as_u16(),
            message: format!(
                "{} returned an undecodable body ({}): {}",
                what,
                e,
                body.chars().take(500).collect::<String>()
            ),
        })?;

        if envelope.response_type == "error" || !status.is_success() {
            return Err(LxdError::Api {
                code: envelope.error_code.unwrap_or_else(|| status.as_u16()),
                message: envelope.error.unwrap_or_else(|| format!("{} failed: {}", what, status)),
            });
        }

        Ok(envelope)
    }

    /// Wait for the background operation referenced by an async response.
    async fn wait<T>(&self, envelope: LxdResponse<T>, what: &str) -> Result<(), LxdError> {
        let Some(operation) = envelope.operation else {
            return Ok(());
        };
        debug!("Waiting for LXD operation {} ({})", operation, what);

        let url = self.url(&format!("{}/wait?timeout={}", operation, OPERATION_WAIT_SECONDS));
        let done: LxdResponse<Operation> = self.send(self.client.get(url), what).await?;
        match done.metadata {
            Some(op) if op.status == "Success" => Ok(()),
            Some(op) => Err(LxdError::Operation(format!("{} ({}): {} {}", what, op.id, op.status, op.err))),
            None => Err(LxdError::Operation(format!("{}: operation vanished", what))),
        }
    }

    async fn change_state(&self, name: &str, action: &str, force: bool) -> Result<(), LxdError> {
        let body = serde_json::json!({
            "action": action,
            "timeout": 30,
            "force": force,
        });
        let what = format!("{} instance {}", action, name);
        let request = self.client.put(self.url(&format!("/1.0/instances/{}/state", name))).json(&body);
        let envelope: LxdResponse<serde_json::Value> = self.send(request, &what).await?;
        self.wait(envelope, &what).await
    }
}

fn is_not_found(err: &LxdError) -> bool {
    matches!(err, LxdError::Api { code: 404, .. })
}

#[async_trait::async_trait]
impl LxdClientTrait for LxdClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_instance(&self, name: &str) -> Result<Option<Instance>, LxdError> {
        debug!("GET instance {}", name);
        let request = self.client.get(self.url(&format!("/1.0/instances/{}", name)));
        match self.send::<Instance>(request, "get instance").await {
            Ok(envelope) => Ok(envelope.metadata),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_instance(&self, request: &CreateInstanceRequest) -> Result<(), LxdError> {
        debug!("Creating instance {} from {}", request.name, request.source.alias);
        let what = format!("create instance {}", request.name);
        let http = self.client.post(self.url("/1.0/instances")).json(request);
        let envelope: LxdResponse<serde_json::Value> = self.send(http, &what).await?;
        self.wait(envelope, &what).await
    }

    async fn start_instance(&self, name: &str) -> Result<(), LxdError> {
        self.change_state(name, "start", false).await
    }

    async fn stop_instance(&self, name: &str, force: bool) -> Result<(), LxdError> {
        self.change_state(name, "stop", force).await
    }

    async fn delete_instance(&self, name: &str) -> Result<bool, LxdError> {
        let Some(instance) = self.get_instance(name).await? else {
            return Ok(false);
        };
        if instance.is_running() {
            self.stop_instance(name, true).await?;
        }

        let what = format!("delete instance {}", name);
        let request = self.client.delete(self.url(&format!("/1.0/instances/{}", name)));
        match self.send::<serde_json::Value>(request, &what).await {
            Ok(envelope) => {
                self.wait(envelope, &what).await?;
                Ok(true)
            }
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn instance_address(&self, name: &str) -> Result<Option<String>, LxdError> {
        let request = self.client.get(self.url(&format!("/1.0/instances/{}/state", name)));
        match self.send::<InstanceState>(request, "get instance state").await {
            Ok(envelope) => Ok(envelope.metadata.and_then(|state| state.ipv4_address())),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
