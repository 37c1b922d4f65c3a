//! Server configuration.
//!
//! Startup options come from CLI flags with `MERIDIAN_*` environment
//! fallbacks. A handful of parameters are settable at runtime (CONFIG SET,
//! FOLLOW); those persist as JSON in `<dir>/config` and, once set, take
//! precedence over the CLI value on later boots.

use crate::error::{Result, ServerError};
use clap::Parser;
use meridian_aof::FsyncPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

fn parse_yes_no(s: &str) -> std::result::Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(format!("expected 'yes' or 'no', got '{s}'")),
    }
}

fn parse_fsync(s: &str) -> std::result::Result<FsyncPolicy, String> {
    FsyncPolicy::parse(s).ok_or_else(|| format!("expected always, everysec or never, got '{s}'"))
}

#[derive(Parser, Debug, Clone)]
#[command(name = "meridian-server", version, about = "In-memory geospatial database")]
pub struct ServerConfig {
    /// Listening host.
    #[arg(long, env = "MERIDIAN_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Listening port.
    #[arg(short = 'p', long, env = "MERIDIAN_PORT", default_value_t = 9851)]
    pub port: u16,

    /// Data directory.
    #[arg(short = 'd', long, env = "MERIDIAN_DIR", default_value = "data")]
    pub dir: PathBuf,

    /// AOF persistence (yes/no).
    #[arg(long, env = "MERIDIAN_APPENDONLY", value_parser = parse_yes_no, default_value = "yes")]
    pub appendonly: bool,

    /// Custom AOF path (default: <dir>/appendonly.aof).
    #[arg(long, env = "MERIDIAN_APPENDFILENAME")]
    pub appendfilename: Option<PathBuf>,

    /// Custom outbound queue path (default: <dir>/queue.db).
    #[arg(long, env = "MERIDIAN_QUEUEFILENAME")]
    pub queuefilename: Option<PathBuf>,

    /// AOF fsync policy: always, everysec or never.
    #[arg(long, value_parser = parse_fsync, default_value = "everysec")]
    pub appendfsync: FsyncPolicy,

    /// Authentication password.
    #[arg(long, env = "MERIDIAN_REQUIREPASS")]
    pub requirepass: Option<String>,

    /// Maximum memory soft cap, e.g. 1gb or 512mb.
    #[arg(long, env = "MERIDIAN_MAXMEMORY")]
    pub maxmemory: Option<String>,

    /// Refuse non-loopback connections when no password is set (yes/no).
    #[arg(long, env = "MERIDIAN_PROTECTED_MODE", value_parser = parse_yes_no, default_value = "yes")]
    pub protected_mode: bool,

    /// Serve HTTP on the same port (yes/no).
    #[arg(long, value_parser = parse_yes_no, default_value = "yes")]
    pub http_transport: bool,

    /// Do not exit on SIGHUP.
    #[arg(long)]
    pub nohup: bool,

    /// Busy-spin the writer instead of parking. For very write-heavy loads.
    #[arg(long)]
    pub spinlock: bool,

    /// Default client output dialect: resp or json.
    #[arg(short = 'o', long, default_value = "resp")]
    pub output: String,

    /// Log encoding: text or json.
    #[arg(short = 'l', long, default_value = "text")]
    pub log_encoding: String,

    /// Verbose logging.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Totally silent output.
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn aof_path(&self) -> PathBuf {
        self.appendfilename
            .clone()
            .unwrap_or_else(|| self.dir.join("appendonly.aof"))
    }

    pub fn queue_path(&self) -> PathBuf {
        self.queuefilename
            .clone()
            .unwrap_or_else(|| self.dir.join("queue.db"))
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join("config")
    }
}

/// Parse a human memory size: plain bytes, or kb/mb/gb suffixes.
pub fn parse_memory(s: &str) -> Result<u64> {
    let s = s.trim().to_ascii_lowercase();
    let (digits, scale) = if let Some(v) = s.strip_suffix("gb") {
        (v, 1024 * 1024 * 1024)
    } else if let Some(v) = s.strip_suffix("mb") {
        (v, 1024 * 1024)
    } else if let Some(v) = s.strip_suffix("kb") {
        (v, 1024)
    } else {
        (s.as_str(), 1)
    };
    digits
        .trim()
        .parse::<u64>()
        .map(|n| n * scale)
        .map_err(|_| ServerError::InvalidConfigValue(s.clone()))
}

pub fn format_memory(bytes: u64) -> String {
    const GB: u64 = 1024 * 1024 * 1024;
    const MB: u64 = 1024 * 1024;
    const KB: u64 = 1024;
    if bytes >= GB && bytes % GB == 0 {
        format!("{}gb", bytes / GB)
    } else if bytes >= MB && bytes % MB == 0 {
        format!("{}mb", bytes / MB)
    } else if bytes >= KB && bytes % KB == 0 {
        format!("{}kb", bytes / KB)
    } else {
        bytes.to_string()
    }
}

/// Replication target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowTarget {
    pub host: String,
    pub port: u16,
}

/// Runtime-settable configuration, persisted to `<dir>/config` as JSON.
/// Every field is optional: absence means "never set at runtime", in which
/// case the CLI value applies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirepass: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxmemory: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub protected_mode: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow: Option<FollowTarget>,
}

impl RuntimeConfig {
    /// Load the config file, seeding unset values from CLI flags.
    pub fn load(path: &Path, cli: &ServerConfig) -> RuntimeConfig {
        let mut cfg = match std::fs::read(path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "ignoring malformed config file");
                RuntimeConfig::default()
            }),
            Err(_) => RuntimeConfig::default(),
        };
        if cfg.requirepass.is_none() {
            cfg.requirepass = cli.requirepass.clone();
        }
        if cfg.maxmemory.is_none() {
            cfg.maxmemory = cli
                .maxmemory
                .as_deref()
                .and_then(|s| parse_memory(s).ok())
                .filter(|n| *n > 0);
        }
        if cfg.protected_mode.is_none() {
            cfg.protected_mode = Some(cli.protected_mode);
        }
        cfg
    }

    /// Persist atomically (write-then-rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| ServerError::InvalidConfigValue(e.to_string()))?;
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn protected(&self) -> bool {
        self.protected_mode.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sizes() {
        assert_eq!(parse_memory("1mb").unwrap(), 1024 * 1024);
        assert_eq!(parse_memory("2GB").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("512").unwrap(), 512);
        assert!(parse_memory("lots").is_err());
        assert_eq!(format_memory(1024 * 1024), "1mb");
        assert_eq!(format_memory(1500), "1500");
    }

    #[test]
    fn runtime_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        let cfg = RuntimeConfig {
            requirepass: Some("sekrit".into()),
            maxmemory: Some(1024 * 1024),
            protected_mode: Some(false),
            follow: Some(FollowTarget {
                host: "127.0.0.1".into(),
                port: 9852,
            }),
        };
        cfg.save(&path).unwrap();

        let cli = ServerConfig::parse_from(["meridian-server"]);
        let loaded = RuntimeConfig::load(&path, &cli);
        assert_eq!(loaded.requirepass.as_deref(), Some("sekrit"));
        assert_eq!(loaded.maxmemory, Some(1024 * 1024));
        assert_eq!(loaded.follow.unwrap().port, 9852);
    }

    #[test]
    fn cli_seeds_unset_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let cli = ServerConfig::parse_from([
            "meridian-server",
            "--requirepass",
            "fromcli",
            "--maxmemory",
            "1mb",
        ]);
        let loaded = RuntimeConfig::load(&dir.path().join("config"), &cli);
        assert_eq!(loaded.requirepass.as_deref(), Some("fromcli"));
        assert_eq!(loaded.maxmemory, Some(1024 * 1024));
        assert!(loaded.protected());
    }
}
