//! CodeServer Controller
//!
//! Provisions browser IDE instances from `CodeServer` resources, either as
//! in-cluster workloads or as LXD instances, and tracks their liveness.
//!
//! Instances whose exporter stops answering for `MAX_PROBE_RETRY`
//! consecutive probes are marked `Inactive`. The workload keeps running and
//! probing continues, so the first successful answer marks it `Active` again.

mod backoff;
mod config;
mod controller;
mod dispatcher;
mod error;
mod events;
mod probe;
mod reconciler;
mod request;
mod resources;
mod shutdown;
mod store;
#[cfg(test)]
mod test_utils;
mod watcher;
mod worker;
mod workqueue;

use crate::config::Options;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting CodeServer Controller");

    // Load configuration from environment variables
    let options = Options::from_env()?;

    info!("Configuration:");
    info!("  Domain: {}", options.domain_name);
    info!("  Exporter image: {}", options.exporter_image);
    info!(
        "  Probe: every {:?}, timeout {:?}, threshold {}",
        options.probe_interval, options.probe_timeout, options.max_probe_retry
    );
    info!("  User ingress: {}", options.enable_user_ingress);
    info!("  Workers: {}", options.max_concurrency);
    info!(
        "  Namespace: {}",
        options.watch_namespace.as_deref().unwrap_or("all namespaces")
    );
    info!(
        "  LXD backend: {}",
        options.lxd_server_url.as_deref().unwrap_or("disabled")
    );

    // Initialize and run controller
    let controller = Controller::new(options).await?;
    controller.run().await?;

    Ok(())
}
