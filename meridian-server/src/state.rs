//! Shared server state.
//!
//! All process-wide mutable state (catalog, hooks, AOF writer, runtime
//! config) lives in one [`Store`] behind a reader-writer lock: one writer
//! at a time, unbounded readers. Guards are never held across await
//! points; the blocking work under the write guard is the in-memory apply
//! plus the AOF append (and fsync, policy permitting), which is exactly
//! the durability contract.

use crate::config::{RuntimeConfig, ServerConfig};
use meridian_aof::Aof;
use meridian_core::{glob, Catalog, QueryOpts};
use meridian_fence::{DeliveryHub, HookRegistry, MutationNotice, OutboundQueue, RoamView};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};

pub struct Store {
    pub catalog: Catalog,
    pub hooks: HookRegistry,
    /// None when appendonly is disabled.
    pub aof: Option<Aof>,
    pub runtime: RuntimeConfig,
}

pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<RwLock<Store>>,
    pub queue: Arc<Mutex<OutboundQueue>>,
    pub hub: Arc<DeliveryHub>,
    pub fence_tx: mpsc::UnboundedSender<MutationNotice>,
    pub follow_tx: watch::Sender<Option<(String, u16)>>,
    pub started_at: Instant,
    pub server_id: String,
    pub followers: AtomicUsize,
    pub caught_up: AtomicBool,
    pub caught_up_once: AtomicBool,
    pub total_commands: AtomicU64,
}

impl AppState {
    pub fn read_store(&self) -> RwLockReadGuard<'_, Store> {
        self.store.read()
    }

    /// Acquire the write half. In spinlock mode the writer busy-spins
    /// instead of parking; durability semantics are unchanged.
    pub fn write_store(&self) -> RwLockWriteGuard<'_, Store> {
        if self.config.spinlock {
            loop {
                if let Some(guard) = self.store.try_write() {
                    return guard;
                }
                std::hint::spin_loop();
            }
        } else {
            self.store.write()
        }
    }

    pub fn is_following(&self) -> bool {
        self.follow_tx.borrow().is_some()
    }

    pub fn following(&self) -> Option<(String, u16)> {
        self.follow_tx.borrow().clone()
    }
}

/// Random 20-hex-char server id, regenerated each boot.
pub fn new_server_id() -> String {
    let mut rng = rand::thread_rng();
    (0..20)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect()
}

/// Read-side view handed to the fence engine for roaming fences. Holds the
/// store lock, not the whole server, which keeps the fence crate free of
/// server types and breaks the reference cycle.
pub struct StoreView {
    store: Arc<RwLock<Store>>,
}

impl StoreView {
    pub fn new(store: Arc<RwLock<Store>>) -> StoreView {
        StoreView { store }
    }
}

impl RoamView for StoreView {
    fn roam_nearby(
        &self,
        key: &str,
        pattern: &str,
        meters: f64,
        origin: (f64, f64),
        exclude_id: &str,
    ) -> Vec<String> {
        let store = self.store.read();
        let Some(collection) = store.catalog.get(key) else {
            return Vec::new();
        };
        let page = collection.nearby(
            origin.0,
            origin.1,
            Some(meters),
            Instant::now(),
            &QueryOpts::default(),
        );
        page.hits
            .iter()
            .filter(|hit| hit.id.as_ref() != exclude_id && glob::matches(pattern, &hit.id))
            .map(|hit| hit.id.to_string())
            .collect()
    }
}
