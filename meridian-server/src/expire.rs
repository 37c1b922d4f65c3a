//! Probabilistic TTL reaping.
//!
//! Wakes every ~100 ms, samples up to K random TTL-holding items per
//! collection, and reaps the expired ones by synthesizing a DEL through
//! the dispatcher, so the AOF, the fence engine and replication all see an
//! ordinary deletion. Followers skip the scan; their leader's DELs arrive
//! on the replication stream.

use crate::dispatch::synthesize_del;
use crate::state::AppState;
use rand::seq::IteratorRandom;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::warn;

const SCAN_INTERVAL: Duration = Duration::from_millis(100);
const SAMPLE_PER_COLLECTION: usize = 20;

pub async fn run_scanner(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(SCAN_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = interval.tick() => {}
        }
        if state.is_following() {
            continue;
        }
        let expired = {
            let store = state.read_store();
            let now = Instant::now();
            let mut rng = rand::thread_rng();
            let mut out: Vec<(String, String)> = Vec::new();
            for (key, collection) in store.catalog.iter() {
                let sample = collection
                    .ttl_ids()
                    .choose_multiple(&mut rng, SAMPLE_PER_COLLECTION);
                for id in sample {
                    if collection.is_expired(id, now) {
                        out.push((key.clone(), id.to_string()));
                    }
                }
            }
            out
        };
        for (key, id) in expired {
            if let Err(e) = synthesize_del(&state, &key, &id) {
                warn!(key, id, error = %e, "failed to reap expired item");
            }
        }
    }
}
