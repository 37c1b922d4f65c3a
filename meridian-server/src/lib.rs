//! Meridian server.
//!
//! Wires the collection engine, wire protocol, append-only log and fence
//! engine into a network server: dual-protocol ingress, the command
//! dispatcher, leader/follower replication, and the background tasks
//! (expiry scanner, fsync tick, webhook delivery).

pub mod config;
pub mod dispatch;
pub mod error;
mod expire;
mod http;
mod ingress;
mod records;
mod render;
pub mod repl;
pub mod state;

pub use config::{RuntimeConfig, ServerConfig};
pub use dispatch::{dispatch, Outcome, Session, Source};
pub use error::{Result, ServerError};
pub use state::AppState;

use bytes::Bytes;
use meridian_aof::{Aof, FsyncPolicy};
use meridian_core::Catalog;
use meridian_fence::{spawn_engine, DeliveryHub, Hook, HookRegistry, OutboundQueue};
use meridian_protocol::Command;
use parking_lot::{Mutex, RwLock};
use state::{new_server_id, Store, StoreView};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long in-flight commands get to finish after shutdown is signalled.
const DRAIN_DEADLINE: Duration = Duration::from_millis(500);

pub struct MeridianServer {
    state: Arc<AppState>,
    listener: TcpListener,
    engine: JoinHandle<()>,
}

impl MeridianServer {
    /// Open on-disk state, replay the AOF, and bind the listen socket.
    /// Failure here is fatal to the process.
    pub async fn bind(config: ServerConfig) -> Result<MeridianServer> {
        std::fs::create_dir_all(&config.dir)?;
        let runtime = RuntimeConfig::load(&config.config_path(), &config);

        let queue = Arc::new(Mutex::new(OutboundQueue::open(config.queue_path())?));
        let hub = DeliveryHub::new(queue.clone());

        let mut store = Store {
            catalog: Catalog::new(),
            hooks: HookRegistry::new(),
            aof: None,
            runtime,
        };

        let aof = if config.appendonly {
            let replay_start = Instant::now();
            let mut replayed = 0u64;
            let aof = Aof::open(config.aof_path(), config.appendfsync, |args| {
                let args: Vec<Bytes> = args.into_iter().map(Bytes::from).collect();
                match Command::parse(&args) {
                    Ok(cmd) if cmd.desc().mutation => {
                        if let Err(e) = dispatch::apply_mutation(&mut store, &cmd, replay_start) {
                            warn!(error = %e, "skipping unreplayable aof record");
                        } else {
                            replayed += 1;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "skipping unparseable aof record"),
                }
            })?;
            info!(
                records = replayed,
                elapsed = ?replay_start.elapsed(),
                "aof replay complete"
            );
            Some(aof)
        } else {
            None
        };
        store.aof = aof;

        // Replay inserted incrementally; repack every index now that the
        // full item set is known.
        for (_, collection) in store.catalog.iter_mut() {
            collection.rebuild_index();
        }

        let hooks: Vec<Arc<Hook>> = store.hooks.iter().cloned().collect();
        let follow = store
            .runtime
            .follow
            .clone()
            .map(|t| (t.host, t.port));

        let store = Arc::new(RwLock::new(store));
        let (fence_tx, fence_rx) = mpsc::unbounded_channel();
        let engine = spawn_engine(
            fence_rx,
            queue.clone(),
            hub.clone(),
            Arc::new(StoreView::new(store.clone())),
        );
        let (follow_tx, _) = watch::channel(follow);

        let state = Arc::new(AppState {
            config: config.clone(),
            store,
            queue,
            hub,
            fence_tx,
            follow_tx,
            started_at: Instant::now(),
            server_id: new_server_id(),
            followers: AtomicUsize::new(0),
            caught_up: AtomicBool::new(false),
            caught_up_once: AtomicBool::new(false),
            total_commands: AtomicU64::new(0),
        });

        for hook in &hooks {
            state.hub.ensure_worker(hook);
        }

        let listener = TcpListener::bind(config.listen_addr()).await?;
        info!(
            addr = %listener.local_addr()?,
            dir = %config.dir.display(),
            appendonly = config.appendonly,
            server_id = %state.server_id,
            "meridian server ready"
        );
        Ok(MeridianServer {
            state,
            listener,
            engine,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Serve until `shutdown` flips. On the way out: stop accepting, give
    /// in-flight commands a bounded drain window, stop background tasks,
    /// and fsync the AOF regardless of policy. Outbound queues are not
    /// drained; they resume on restart.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let MeridianServer {
            state,
            listener,
            engine,
        } = self;
        let router = http::build_router(state.clone());

        let scanner = tokio::spawn(expire::run_scanner(state.clone(), shutdown.clone()));
        let follower = tokio::spawn(repl::run_follower(state.clone(), shutdown.clone()));
        let sync_task = if state.config.appendonly
            && state.config.appendfsync == FsyncPolicy::EverySecond
        {
            Some(tokio::spawn(fsync_tick(state.clone(), shutdown.clone())))
        } else {
            None
        };

        ingress::serve(state.clone(), listener, router, shutdown).await;

        tokio::time::sleep(DRAIN_DEADLINE).await;
        scanner.abort();
        follower.abort();
        if let Some(task) = sync_task {
            task.abort();
        }
        engine.abort();
        state.hub.shutdown();

        let mut store = state.write_store();
        if let Some(aof) = store.aof.as_mut() {
            if let Err(e) = aof.sync() {
                error!(error = %e, "final aof fsync failed");
            }
        }
        info!("shutdown complete");
        Ok(())
    }
}

/// Once-per-second fsync for the every-second policy.
async fn fsync_tick(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = interval.tick() => {
                let mut store = state.write_store();
                if let Some(aof) = store.aof.as_mut() {
                    if let Err(e) = aof.sync() {
                        error!(error = %e, "aof fsync failed");
                    }
                }
            }
        }
    }
}
