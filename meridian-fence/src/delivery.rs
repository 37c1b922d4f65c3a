//! Webhook delivery workers.
//!
//! One worker task per hook, each holding a single in-flight request, so
//! per-hook delivery order matches queue order. Failures back off
//! exponentially from one second to five minutes and retry until the hook
//! is deleted; the queue entry is only acked (and fsynced) after a 2xx.

use crate::hook::Hook;
use crate::queue::OutboundQueue;
use parking_lot::Mutex;
use reqwest::Client;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct Worker {
    endpoint: String,
    notify: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Owns the delivery workers and the shared HTTP client.
pub struct DeliveryHub {
    queue: Arc<Mutex<OutboundQueue>>,
    client: Client,
    workers: Mutex<FxHashMap<String, Worker>>,
}

impl DeliveryHub {
    pub fn new(queue: Arc<Mutex<OutboundQueue>>) -> Arc<DeliveryHub> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Arc::new(DeliveryHub {
            queue,
            client,
            workers: Mutex::new(FxHashMap::default()),
        })
    }

    /// Make sure a worker is running for this hook, respawning when the
    /// endpoint changed. Called on SETHOOK and once per hook at startup.
    pub fn ensure_worker(self: &Arc<Self>, hook: &Hook) {
        let mut workers = self.workers.lock();
        if let Some(existing) = workers.get(&hook.name) {
            if existing.endpoint == hook.endpoint {
                existing.notify.notify_one();
                return;
            }
            existing.task.abort();
            workers.remove(&hook.name);
        }
        let notify = Arc::new(Notify::new());
        let task = tokio::spawn(deliver_loop(
            hook.name.clone(),
            hook.endpoint.clone(),
            self.queue.clone(),
            self.client.clone(),
            notify.clone(),
        ));
        workers.insert(
            hook.name.clone(),
            Worker {
                endpoint: hook.endpoint.clone(),
                notify,
                task,
            },
        );
    }

    /// Wake a hook's worker after new events were enqueued.
    pub fn notify(&self, name: &str) {
        if let Some(worker) = self.workers.lock().get(name) {
            worker.notify.notify_one();
        }
    }

    /// Stop the worker and drop the hook's pending events.
    pub fn remove(&self, name: &str) {
        if let Some(worker) = self.workers.lock().remove(name) {
            worker.task.abort();
        }
        if let Err(e) = self.queue.lock().purge_hook(name) {
            warn!(hook = name, error = %e, "failed to purge hook queue");
        }
    }

    /// Events still awaiting delivery for a hook; a hook with pending
    /// events reports itself active.
    pub fn pending(&self, name: &str) -> usize {
        self.queue.lock().pending(name)
    }

    /// Abort every worker. Queues are not drained; they resume on restart.
    pub fn shutdown(&self) {
        for (_, worker) in self.workers.lock().drain() {
            worker.task.abort();
        }
    }
}

async fn deliver_loop(
    name: String,
    endpoint: String,
    queue: Arc<Mutex<OutboundQueue>>,
    client: Client,
    notify: Arc<Notify>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let head = queue.lock().peek(&name);
        let Some(event) = head else {
            notify.notified().await;
            continue;
        };

        let sent = client
            .post(&endpoint)
            .header("content-type", "application/json")
            .body(event.payload.clone())
            .send()
            .await;

        match sent {
            Ok(resp) if resp.status().is_success() => {
                backoff = INITIAL_BACKOFF;
                if let Err(e) = queue.lock().ack(&name, event.seq) {
                    warn!(hook = %name, error = %e, "failed to ack delivered event");
                }
                debug!(hook = %name, seq = event.seq, "event delivered");
            }
            Ok(resp) => {
                warn!(hook = %name, status = %resp.status(), "endpoint rejected event, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(e) => {
                warn!(hook = %name, error = %e, "delivery failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}
