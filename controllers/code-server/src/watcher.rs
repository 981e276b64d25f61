//! Liveness watcher.
//!
//! On every tick the watcher lists the probed `CodeServer`s, probes each
//! exporter endpoint and keeps a per-instance count of consecutive failures.
//! Threshold crossings and recoveries become reconcile requests on the
//! bounded request channel. The counters are owned by this struct alone and
//! are reseeded from `status.probeFailureCount` after a restart.

use crate::config::Options;
use crate::probe::{ProbeOutcome, Prober};
use crate::request::{ReconcileRequest, RequestSender, ResourceKey};
use crate::resources::service_probe_endpoint;
use crate::shutdown::Shutdown;
use crate::store::ClusterStore;
use chrono::{DateTime, Utc};
use crds::{CodeServer, Phase, Runtime};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Interval;
use tracing::{debug, info, warn};

/// One instance to probe in this pass.
#[derive(Debug, Clone)]
struct Target {
    key: ResourceKey,
    phase: Phase,
    endpoint: String,
    stored_failures: u32,
}

impl Target {
    fn from_resource(cs: &CodeServer, options: &Options) -> Option<Self> {
        let status = cs.status.as_ref()?;
        if !status.phase.is_probed() || cs.metadata.deletion_timestamp.is_some() {
            return None;
        }
        let key = ResourceKey::from_resource(cs)?;
        let endpoint = match (&status.probe_endpoint, cs.spec.runtime) {
            (Some(endpoint), _) => endpoint.clone(),
            (None, Runtime::Kubernetes) => service_probe_endpoint(&key, options),
            // An LXD instance without an address has nothing to probe
            (None, Runtime::Lxd) => return None,
        };
        Some(Self {
            key,
            phase: status.phase,
            endpoint,
            stored_failures: status.probe_failure_count,
        })
    }
}

/// Probes running instances and signals threshold crossings.
pub struct Watcher {
    store: Arc<dyn ClusterStore>,
    prober: Arc<dyn Prober>,
    sender: RequestSender,
    options: Arc<Options>,
    /// Consecutive probe failures per instance
    failures: HashMap<ResourceKey, u32>,
}

impl Watcher {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        prober: Arc<dyn Prober>,
        sender: RequestSender,
        options: Arc<Options>,
    ) -> Self {
        Self {
            store,
            prober,
            sender,
            options,
            failures: HashMap::new(),
        }
    }

    /// Consecutive failures currently counted for `key`.
    pub fn failure_count(&self, key: &ResourceKey) -> Option<u32> {
        self.failures.get(key).copied()
    }

    /// Probe on every tick until `shutdown` fires. A pass in progress is abandoned.
    pub async fn run(&mut self, ticker: &mut Interval, mut shutdown: Shutdown) {
        info!(
            "Liveness watcher started (every {:?}, threshold {})",
            self.options.probe_interval, self.options.max_probe_retry
        );
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    debug!("Abandoning probe pass on shutdown");
                    break;
                }
                _ = self.probe_pass() => {}
            }
        }
        info!("Liveness watcher stopped");
    }

    /// List, probe and update counters once.
    pub async fn probe_pass(&mut self) {
        let resources = match self.store.list_code_servers().await {
            Ok(resources) => resources,
            Err(e) => {
                warn!("Skipping probe pass, listing CodeServers failed: {}", e);
                return;
            }
        };

        let targets: Vec<Target> = resources
            .iter()
            .filter_map(|cs| Target::from_resource(cs, &self.options))
            .collect();

        let listed: HashSet<&ResourceKey> = targets.iter().map(|t| &t.key).collect();
        self.failures.retain(|key, _| listed.contains(key));
        for target in &targets {
            self.failures
                .entry(target.key.clone())
                .or_insert(target.stored_failures);
        }

        let prober = Arc::clone(&self.prober);
        let timeout = self.options.probe_timeout;
        let outcomes: Vec<(Target, ProbeOutcome)> = stream::iter(targets)
            .map(|target| {
                let prober = Arc::clone(&prober);
                async move {
                    let outcome = tokio::time::timeout(timeout, prober.probe(&target.endpoint))
                        .await
                        .unwrap_or_else(|_| ProbeOutcome::Unhealthy("timed out".to_string()));
                    (target, outcome)
                }
            })
            .buffer_unordered(self.options.probe_fanout)
            .collect()
            .await;

        let probed_at = Utc::now();
        for (target, outcome) in outcomes {
            self.observe(&target, &outcome, probed_at);
        }
    }

    /// Update the counter for one probe and signal when the listed state disagrees with it.
    ///
    /// Signals are derived from the phase listed on this pass, so a request
    /// that was dropped or whose reconcile failed is sent again next tick.
    fn observe(&mut self, target: &Target, outcome: &ProbeOutcome, probed_at: DateTime<Utc>) {
        let failures = self.failures.entry(target.key.clone()).or_default();

        if let ProbeOutcome::Unhealthy(reason) = outcome {
            *failures = failures.saturating_add(1);
            debug!(
                "Probe of {} failed ({}/{}): {}",
                target.key, failures, self.options.max_probe_retry, reason
            );
            if *failures >= self.options.max_probe_retry && target.phase != Phase::Inactive {
                warn!(
                    "CodeServer {} failed {} consecutive probes",
                    target.key, failures
                );
                self.sender.offer(ReconcileRequest::threshold_reached(
                    target.key.clone(),
                    *failures,
                    probed_at,
                ));
            }
            return;
        }

        if *failures > 0 || target.stored_failures > 0 || target.phase == Phase::Inactive {
            info!(
                "CodeServer {} answered its probe after {} failures",
                target.key, failures
            );
            *failures = 0;
            self.sender
                .offer(ReconcileRequest::recovered(target.key.clone(), probed_at));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{request_channel, ReconcileReason, REQUEST_CHANNEL_CAPACITY};
    use crate::shutdown;
    use crate::test_utils::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::{interval, Instant, MissedTickBehavior};

    const ALICE_ENDPOINT: &str = "http://alice.dev.svc:8000/metrics";

    fn watcher(
        options: Options,
        store: Arc<InMemoryStore>,
        prober: Arc<FakeProber>,
    ) -> (Watcher, mpsc::Receiver<ReconcileRequest>) {
        let (sender, rx) = request_channel();
        (Watcher::new(store, prober, sender, Arc::new(options)), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<ReconcileRequest>) -> Vec<ReconcileRequest> {
        let mut out = Vec::new();
        while let Ok(request) = rx.try_recv() {
            out.push(request);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_failure_reaches_threshold_in_time() {
        let store = Arc::new(InMemoryStore::new());
        let key = store.insert(create_test_code_server_with_status("dev", "alice", Phase::Active, 0));
        let prober = Arc::new(FakeProber::new());
        prober.set_healthy(ALICE_ENDPOINT, false);
        let options = test_options();
        let (mut watcher, mut rx) = watcher(options.clone(), store.clone(), prober);
        let (trigger, stop) = shutdown::channel();

        let onset = Instant::now();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(options.probe_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            watcher.run(&mut ticker, stop).await;
            watcher
        });

        let request = rx.recv().await.unwrap();
        let elapsed = onset.elapsed();
        assert_eq!(request.key, key);
        assert_eq!(request.reason, ReconcileReason::ProbeFailureThresholdReached);
        assert_eq!(request.probe.map(|p| p.failure_count), Some(10));
        assert!(
            elapsed >= Duration::from_secs(180) && elapsed <= Duration::from_secs(220),
            "threshold after {:?}",
            elapsed
        );

        // The reconcile records Inactive; no further signals for this run of failures
        store.insert(create_test_code_server_with_status("dev", "alice", Phase::Inactive, 10));
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert!(drain(&mut rx).is_empty());

        trigger.fire();
        let watcher = handle.await.unwrap();
        assert_eq!(watcher.failure_count(&key), Some(12));
    }

    #[tokio::test]
    async fn test_success_resets_and_signals_recovery() {
        let store = Arc::new(InMemoryStore::new());
        let key = store.insert(create_test_code_server_with_status("dev", "alice", Phase::Active, 0));
        let prober = Arc::new(FakeProber::new());
        let (mut watcher, mut rx) = watcher(test_options(), store, prober.clone());

        prober.set_healthy(ALICE_ENDPOINT, false);
        for _ in 0..9 {
            watcher.probe_pass().await;
        }
        assert_eq!(watcher.failure_count(&key), Some(9));
        assert!(drain(&mut rx).is_empty(), "nine failures stay below the threshold");

        prober.set_healthy(ALICE_ENDPOINT, true);
        watcher.probe_pass().await;
        assert_eq!(watcher.failure_count(&key), Some(0));
        let requests = drain(&mut rx);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].reason, ReconcileReason::ProbeRecovered);

        // Healthy and already at zero: nothing to say
        watcher.probe_pass().await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_counter_seeded_from_status() {
        let store = Arc::new(InMemoryStore::new());
        let key = store.insert(create_test_code_server_with_status("dev", "alice", Phase::Inactive, 10));
        let prober = Arc::new(FakeProber::new());
        prober.set_healthy(ALICE_ENDPOINT, false);
        let (mut watcher, mut rx) = watcher(test_options(), store, prober.clone());

        watcher.probe_pass().await;
        assert_eq!(watcher.failure_count(&key), Some(11));
        assert!(drain(&mut rx).is_empty(), "already Inactive, no second threshold signal");

        prober.set_healthy(ALICE_ENDPOINT, true);
        watcher.probe_pass().await;
        let requests = drain(&mut rx);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].reason, ReconcileReason::ProbeRecovered);
        assert_eq!(requests[0].probe.map(|p| p.failure_count), Some(0));
    }

    #[tokio::test]
    async fn test_signals_repeat_until_the_phase_follows() {
        let store = Arc::new(InMemoryStore::new());
        let key = store.insert(create_test_code_server_with_status("dev", "alice", Phase::Active, 0));
        let prober = Arc::new(FakeProber::new());
        prober.set_healthy(ALICE_ENDPOINT, false);
        let options = Options {
            max_probe_retry: 2,
            ..test_options()
        };
        let (mut watcher, mut rx) = watcher(options, store.clone(), prober.clone());

        watcher.probe_pass().await;
        assert!(drain(&mut rx).is_empty());
        watcher.probe_pass().await;
        let crossing = drain(&mut rx);
        assert_eq!(crossing.len(), 1);
        assert_eq!(crossing[0].reason, ReconcileReason::ProbeFailureThresholdReached);

        // That reconcile never landed: the resource is still listed Active
        watcher.probe_pass().await;
        let again = drain(&mut rx);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].reason, ReconcileReason::ProbeFailureThresholdReached);
        assert_eq!(again[0].probe.map(|p| p.failure_count), Some(3));

        store.insert(create_test_code_server_with_status("dev", "alice", Phase::Inactive, 3));
        watcher.probe_pass().await;
        assert!(drain(&mut rx).is_empty());

        // Recovery is repeated the same way until the phase leaves Inactive
        prober.set_healthy(ALICE_ENDPOINT, true);
        for _ in 0..2 {
            watcher.probe_pass().await;
            let recovered = drain(&mut rx);
            assert_eq!(recovered.len(), 1);
            assert_eq!(recovered[0].reason, ReconcileReason::ProbeRecovered);
        }
        assert_eq!(watcher.failure_count(&key), Some(0));

        store.insert(create_test_code_server_with_status("dev", "alice", Phase::Active, 0));
        watcher.probe_pass().await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_only_probed_phases_are_probed_and_gone_keys_pruned() {
        let store = Arc::new(InMemoryStore::new());
        let alice = store.insert(create_test_code_server_with_status("dev", "alice", Phase::Active, 0));
        store.insert(create_test_code_server_with_status("dev", "bob", Phase::Provisioning, 0));
        store.insert(create_test_code_server_with_status("dev", "carol", Phase::Failed, 0));
        let prober = Arc::new(FakeProber::new());
        prober.set_healthy(ALICE_ENDPOINT, false);
        let (mut watcher, _rx) = watcher(test_options(), store.clone(), prober.clone());

        watcher.probe_pass().await;
        assert_eq!(prober.calls(), 1);
        assert_eq!(watcher.failure_count(&alice), Some(1));

        store.request_delete(&alice);
        watcher.probe_pass().await;
        assert_eq!(watcher.failure_count(&alice), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_counts_as_failure() {
        let store = Arc::new(InMemoryStore::new());
        let key = store.insert(create_test_code_server_with_status("dev", "alice", Phase::Active, 0));
        let prober = Arc::new(FakeProber::new());
        prober.hang(ALICE_ENDPOINT);
        let (mut watcher, _rx) = watcher(test_options(), store, prober);

        let started = Instant::now();
        watcher.probe_pass().await;
        assert_eq!(watcher.failure_count(&key), Some(1));
        assert!(started.elapsed() <= Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_full_channel_drops_and_reemits_next_tick() {
        let store = Arc::new(InMemoryStore::new());
        let prober = Arc::new(FakeProber::new());
        let burst = REQUEST_CHANNEL_CAPACITY + 5;
        for i in 0..burst {
            let name = format!("user-{}", i);
            store.insert(create_test_code_server_with_status("dev", &name, Phase::Active, 0));
            prober.set_healthy(&format!("http://{}.dev.svc:8000/metrics", name), false);
        }
        let options = Options {
            max_probe_retry: 1,
            ..test_options()
        };
        let (mut watcher, mut rx) = watcher(options, store.clone(), prober);

        // A full channel never blocks the pass
        tokio::time::timeout(Duration::from_secs(5), watcher.probe_pass())
            .await
            .expect("probe pass must not block on a full channel");
        let first = drain(&mut rx);
        assert_eq!(first.len(), REQUEST_CHANNEL_CAPACITY);
        for request in &first {
            store.insert(create_test_code_server_with_status("dev", &request.key.name, Phase::Inactive, 1));
        }

        watcher.probe_pass().await;
        let second = drain(&mut rx);
        assert_eq!(second.len(), 5, "the dropped requests are re-emitted");

        let mut keys: Vec<_> = first.iter().chain(second.iter()).map(|r| r.key.clone()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), burst);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_run() {
        let store = Arc::new(InMemoryStore::new());
        let (mut watcher, _rx) = watcher(test_options(), store, Arc::new(FakeProber::new()));
        let (trigger, stop) = shutdown::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(20));
            watcher.run(&mut ticker, stop).await;
        });
        tokio::time::sleep(Duration::from_secs(45)).await;
        trigger.fire();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("watcher should stop")
            .unwrap();
    }
}
