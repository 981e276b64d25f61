//! Mock LxdClient for unit testing
//!
//! Keeps instances in memory so controller tests can exercise the LXD backend
//! path without a running LXD server.

use crate::error::LxdError;
use crate::lxd_trait::LxdClientTrait;
use crate::models::{CreateInstanceRequest, Instance};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Mock LxdClient for testing
#[derive(Clone, Default)]
pub struct MockLxdClient {
    pub(crate) instances: Arc<Mutex<HashMap<String, Instance>>>,
    pub(crate) addresses: Arc<Mutex<HashMap<String, String>>>,
    /// Every mutating call, e.g. "create alice", "delete alice"
    pub(crate) calls: Arc<Mutex<Vec<String>>>,
    /// When set, every call fails with an API error carrying this code
    pub(crate) fail_with: Arc<Mutex<Option<u16>>>,
}

impl MockLxdClient {
    /// Create a new mock client
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance to the mock store (for test setup)
    pub fn add_instance(&self, instance: Instance) {
        self.instances.lock().unwrap().insert(instance.name.clone(), instance);
    }

    /// Address reported for a running instance (for test setup)
    pub fn set_address(&self, name: &str, address: &str) {
        self.addresses.lock().unwrap().insert(name.to_string(), address.to_string());
    }

    /// Make every subsequent call fail with the given API status code
    pub fn fail_with(&self, code: Option<u16>) {
        *self.fail_with.lock().unwrap() = code;
    }

    /// Mutating calls recorded so far
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Current instance by name
    pub fn instance(&self, name: &str) -> Option<Instance> {
        self.instances.lock().unwrap().get(name).cloned()
    }

    fn check_failure(&self) -> Result<(), LxdError> {
        match *self.fail_with.lock().unwrap() {
            Some(code) => Err(LxdError::Api {
                code,
                message: "injected failure".to_string(),
            }),
            None => Ok(()),
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn set_status(&self, name: &str, status: &str) -> Result<(), LxdError> {
        let mut instances = self.instances.lock().unwrap();
        let instance = instances.get_mut(name).ok_or_else(|| LxdError::Api {
            code: 404,
            message: format!("Instance {} not found", name),
        })?;
        instance.status = status.to_string();
        Ok(())
    }
}

#[async_trait::async_trait]
impl LxdClientTrait for MockLxdClient {
    fn base_url(&self) -> &str {
        "https://mock-lxd:8443"
    }

    async fn get_instance(&self, name: &str) -> Result<Option<Instance>, LxdError> {
        self.check_failure()?;
        Ok(self.instance(name))
    }

    async fn create_instance(&self, request: &CreateInstanceRequest) -> Result<(), LxdError> {
        self.check_failure()?;
        self.record(format!("create {}", request.name));
        let mut instances = self.instances.lock().unwrap();
        if instances.contains_key(&request.name) {
            return Err(LxdError::Api {
                code: 409,
                message: format!("Instance {} already exists", request.name),
            });
        }
        instances.insert(
            request.name.clone(),
            Instance {
                name: request.name.clone(),
                status: if request.start { "Running" } else { "Stopped" }.to_string(),
                profiles: request.profiles.clone(),
                config: request.config.clone(),
            },
        );
        Ok(())
    }

    async fn start_instance(&self, name: &str) -> Result<(), LxdError> {
        self.check_failure()?;
        self.record(format!("start {}", name));
        self.set_status(name, "Running")
    }

    async fn stop_instance(&self, name: &str, _force: bool) -> Result<(), LxdError> {
        self.check_failure()?;
        self.record(format!("stop {}", name));
        self.set_status(name, "Stopped")
    }

    async fn delete_instance(&self, name: &str) -> Result<bool, LxdError> {
        self.check_failure()?;
        let removed = self.instances.lock().unwrap().remove(name).is_some();
        if removed {
            self.record(format!("delete {}", name));
        }
        Ok(removed)
    }

    async fn instance_address(&self, name: &str) -> Result<Option<String>, LxdError> {
        self.check_failure()?;
        let running = self.instance(name).is_some_and(|i| i.is_running());
        if !running {
            return Ok(None);
        }
        Ok(self.addresses.lock().unwrap().get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_lifecycle() {
        let client = MockLxdClient::new();
        client.set_address("alice", "10.0.0.5");

        assert!(client.get_instance("alice").await.unwrap().is_none());
        client
            .create_instance(&CreateInstanceRequest::from_image("alice", "ubuntu/22.04"))
            .await
            .unwrap();
        assert_eq!(client.instance_address("alice").await.unwrap().as_deref(), Some("10.0.0.5"));

        client.stop_instance("alice", false).await.unwrap();
        assert_eq!(client.instance_address("alice").await.unwrap(), None);

        assert!(client.delete_instance("alice").await.unwrap());
        assert!(!client.delete_instance("alice").await.unwrap());
        assert_eq!(client.calls(), vec!["create alice", "stop alice", "delete alice"]);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let client = MockLxdClient::new();
        client.fail_with(Some(503));
        let err = client.get_instance("alice").await.unwrap_err();
        assert!(err.is_transient());
    }
}
