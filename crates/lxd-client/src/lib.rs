//! LXD REST API Client
//!
//! A small client for the parts of the LXD REST API (`/1.0/instances`) the
//! code-server controller needs to run instances outside the cluster.
//!
//! # Example
//!
//! ```no_run
//! use lxd_client::{LxdClient, LxdClientTrait, CreateInstanceRequest};
//!
//! # async fn example(cert: &[u8], key: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
//! let client = LxdClient::new("https://lxd.internal:8443".to_string(), cert, key, false)?;
//!
//! if client.get_instance("alice").await?.is_none() {
//!     let request = CreateInstanceRequest::from_image("alice", "ubuntu/22.04");
//!     client.create_instance(&request).await?;
//! }
//! let address = client.instance_address("alice").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod lxd_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::LxdClient;
pub use error::LxdError;
pub use models::*;
pub use lxd_trait::LxdClientTrait;
#[cfg(feature = "test-util")]
pub use mock::MockLxdClient;
