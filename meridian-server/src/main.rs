//! Meridian server binary.
//!
//! Signal contract: SIGHUP exits 1 (unless --nohup), SIGINT exits 2,
//! SIGQUIT exits 3, SIGTERM performs a graceful shutdown and exits 0.

use clap::Parser;
use meridian_server::{MeridianServer, ServerConfig};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::warn;
use tracing_subscriber::EnvFilter;

fn init_logging(config: &ServerConfig) {
    let level = if config.quiet {
        "off"
    } else {
        match config.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.log_encoding == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    let config = ServerConfig::parse();
    init_logging(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.host,
        port = config.port,
        dir = %config.dir.display(),
        pid = std::process::id(),
        "starting meridian server"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let nohup = config.nohup;
    tokio::spawn(async move {
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGHUP handler");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGINT handler");
                return;
            }
        };
        let mut quit = match signal(SignalKind::quit()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGQUIT handler");
                return;
            }
        };
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = hup.recv() => {
                    if nohup {
                        continue;
                    }
                    warn!("signal: SIGHUP");
                    std::process::exit(1);
                }
                _ = int.recv() => {
                    warn!("signal: SIGINT");
                    std::process::exit(2);
                }
                _ = quit.recv() => {
                    warn!("signal: SIGQUIT");
                    std::process::exit(3);
                }
                _ = term.recv() => {
                    warn!("signal: SIGTERM, shutting down");
                    let _ = shutdown_tx.send(true);
                }
            }
        }
    });

    let server = match MeridianServer::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("meridian-server: fatal: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run(shutdown_rx).await {
        eprintln!("meridian-server: {e}");
        std::process::exit(1);
    }
}
