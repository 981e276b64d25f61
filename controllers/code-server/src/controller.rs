//! Main controller implementation.
//!
//! Wires the event sources, the liveness watcher, the dispatcher and the
//! worker pool together and runs them until a termination signal arrives.

use crate::config::Options;
use crate::dispatcher;
use crate::error::ControllerError;
use crate::events::EventSource;
use crate::probe::{HttpProber, Prober};
use crate::reconciler::Reconciler;
use crate::request::request_channel;
use crate::shutdown;
use crate::store::{ClusterStore, KubeStore};
use crate::watcher::Watcher;
use crate::worker::{RequestQueue, WorkerPool};
use k8s_openapi::api::core::v1::Secret;
use kube::Client;
use lxd_client::{LxdClient, LxdClientTrait};
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Main controller for CodeServer management.
pub struct Controller {
    client: Client,
    store: Arc<dyn ClusterStore>,
    prober: Arc<dyn Prober>,
    reconciler: Arc<Reconciler>,
    options: Arc<Options>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(options: Options) -> Result<Self, ControllerError> {
        info!("Initializing CodeServer Controller");
        let options = Arc::new(options);

        let client = Client::try_default().await?;
        let store: Arc<dyn ClusterStore> =
            Arc::new(KubeStore::new(client.clone(), options.watch_namespace.clone()));
        let prober: Arc<dyn Prober> = Arc::new(HttpProber::new(options.probe_timeout)?);
        let lxd = lxd_backend(store.as_ref(), &options).await?;

        let reconciler = Arc::new(Reconciler::new(Arc::clone(&store), lxd, Arc::clone(&options)));

        Ok(Self {
            client,
            store,
            prober,
            reconciler,
            options,
        })
    }

    /// Runs the controller until SIGINT/SIGTERM or until an event source fails.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("CodeServer Controller running");

        let (trigger, stop) = shutdown::channel();
        let queue = Arc::new(RequestQueue::new());
        let (sender, rx) = request_channel();

        let events = Arc::new(EventSource::new(
            self.client.clone(),
            self.options.watch_namespace.clone(),
            Arc::clone(&queue),
        ));
        let mut sources = JoinSet::new();
        {
            let events = Arc::clone(&events);
            let stop = stop.clone();
            sources.spawn(async move { events.watch_code_servers(stop).await });
        }
        {
            let events = Arc::clone(&events);
            let stop = stop.clone();
            sources.spawn(async move { events.watch_deployments(stop).await });
        }

        let dispatcher = tokio::spawn(dispatcher::run(rx, Arc::clone(&queue), stop.clone()));

        let mut watcher = Watcher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.prober),
            sender,
            Arc::clone(&self.options),
        );
        let probe_interval = self.options.probe_interval;
        let watcher_stop = stop.clone();
        let watcher = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(probe_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            watcher.run(&mut ticker, watcher_stop).await;
        });

        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&self.reconciler),
            Arc::clone(&self.options),
        ));
        let workers = tokio::spawn(pool.run());

        let result = tokio::select! {
            _ = termination_signal() => Ok(()),
            Some(joined) = sources.join_next() => flatten(joined),
        };
        if let Err(e) = &result {
            error!("Event source failed, shutting down: {}", e);
        }

        info!("Stopping CodeServer Controller");
        trigger.fire();
        queue.shutdown();

        while let Some(joined) = sources.join_next().await {
            if let Err(e) = flatten(joined) {
                warn!("Event source stopped with error: {}", e);
            }
        }
        for (name, handle) in [("dispatcher", dispatcher), ("watcher", watcher), ("worker pool", workers)] {
            if let Err(e) = handle.await {
                warn!("{} task failed: {}", name, e);
            }
        }

        info!("CodeServer Controller stopped");
        result
    }
}

fn flatten(joined: Result<Result<(), ControllerError>, JoinError>) -> Result<(), ControllerError> {
    joined.map_err(|e| ControllerError::Watch(format!("Event source panicked: {}", e)))?
}

/// Resolves on Ctrl-C or SIGTERM.
async fn termination_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Build the LXD client from the certificate secret in the operator namespace.
async fn lxd_backend(
    store: &dyn ClusterStore,
    options: &Options,
) -> Result<Option<Arc<dyn LxdClientTrait>>, ControllerError> {
    let Some(url) = options.lxd_server_url.clone() else {
        info!("LXD backend disabled");
        return Ok(None);
    };

    let secret = store
        .get_secret(&options.operator_namespace, &options.lxd_client_secret_name)
        .await?
        .ok_or_else(|| {
            ControllerError::InvalidConfig(format!(
                "LXD client secret {}/{} not found",
                options.operator_namespace, options.lxd_client_secret_name
            ))
        })?;
    let cert = secret_entry(&secret, "tls.crt")?;
    let key = secret_entry(&secret, "tls.key")?;

    info!("LXD backend: {}", url);
    let client = LxdClient::new(url, cert, key, options.lxd_accept_invalid_certs)?;
    Ok(Some(Arc::new(client)))
}

fn secret_entry<'a>(secret: &'a Secret, entry: &str) -> Result<&'a [u8], ControllerError> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(entry))
        .map(|bytes| bytes.0.as_slice())
        .filter(|bytes| !bytes.is_empty())
        .ok_or_else(|| {
            ControllerError::InvalidConfig(format!(
                "secret {} has no {} entry",
                secret.metadata.name.as_deref().unwrap_or("<unnamed>"),
                entry
            ))
        })
}
