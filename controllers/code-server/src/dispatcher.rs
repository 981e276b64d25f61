//! Moves watcher requests from the request channel into the work queue.

use crate::shutdown::Shutdown;
use crate::worker::RequestQueue;
use crate::request::ReconcileRequest;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Drain `rx` into `queue` until the channel closes or `shutdown` fires.
pub async fn run(mut rx: mpsc::Receiver<ReconcileRequest>, queue: Arc<RequestQueue>, mut shutdown: Shutdown) {
    info!("Dispatcher started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            request = rx.recv() => match request {
                Some(request) => {
                    debug!("Dispatching {} for {}", request.reason, request.key);
                    queue.add(request.key.clone(), request);
                }
                None => break,
            },
        }
    }
    info!("Dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{request_channel, ReconcileReason, ResourceKey};
    use crate::shutdown;
    use chrono::Utc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_requests_reach_the_queue_coalesced() {
        let (sender, rx) = request_channel();
        let queue = Arc::new(RequestQueue::new());
        let (trigger, stop) = shutdown::channel();
        let task = tokio::spawn(run(rx, queue.clone(), stop));

        let key = ResourceKey::new("dev", "alice");
        sender.offer(ReconcileRequest::threshold_reached(key.clone(), 10, Utc::now()));
        sender.offer(ReconcileRequest::new(key.clone(), ReconcileReason::SpecChanged));

        let (got_key, request) = tokio::time::timeout(Duration::from_secs(1), queue.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got_key, key);
        // The probe signal survives coalescing with a later request
        assert_eq!(request.probe.map(|p| p.failure_count), Some(10));

        trigger.fire();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stops_when_channel_closes() {
        let (sender, rx) = request_channel();
        let (_trigger, stop) = shutdown::channel();
        let task = tokio::spawn(run(rx, Arc::new(RequestQueue::new()), stop));
        drop(sender);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("dispatcher should exit")
            .unwrap();
    }
}
