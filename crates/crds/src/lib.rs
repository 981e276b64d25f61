//! CodeServer CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the code-server operator.

pub mod code_server;

pub use code_server::*;
