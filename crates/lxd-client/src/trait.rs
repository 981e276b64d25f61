//! LxdClient trait for mocking
//!
//! The concrete `LxdClient` implements this trait; the controller depends on
//! the trait so unit tests can swap in `MockLxdClient`.

use crate::error::LxdError;
use crate::models::{CreateInstanceRequest, Instance};

/// Instance operations the controller performs against an LXD server.
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait LxdClientTrait: Send + Sync {
    /// Get the base URL
    fn base_url(&self) -> &str;

    /// Fetch an instance; `Ok(None)` when it does not exist.
    async fn get_instance(&self, name: &str) -> Result<Option<Instance>, LxdError>;

    /// Create an instance and wait for the creation operation to finish.
    async fn create_instance(&self, request: &CreateInstanceRequest) -> Result<(), LxdError>;

    /// Start a stopped instance.
    async fn start_instance(&self, name: &str) -> Result<(), LxdError>;

    /// Stop a running instance.
    async fn stop_instance(&self, name: &str, force: bool) -> Result<(), LxdError>;

    /// Delete an instance. Returns `false` when it was already gone.
    async fn delete_instance(&self, name: &str) -> Result<bool, LxdError>;

    /// Global IPv4 address of a running instance.
    async fn instance_address(&self, name: &str) -> Result<Option<String>, LxdError>;
}
