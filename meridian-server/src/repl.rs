//! Leader→follower replication over the RESP transport.
//!
//! A follower sends `REPLCONF offset <n>` then `SYNC`; the leader answers
//! `+CONTINUE <offset> <len>` and streams raw AOF bytes from that offset,
//! or `+FULLRESYNC <base> <len>` when the offset fell into a post-shrink
//! hole (or is unknown to this leader), in which case the follower resets
//! its state and log before applying the stream. Records are applied
//! through the same dispatcher path as live writes, with the local AOF fed
//! from the raw stream, so leader and follower logs stay byte-identical.

use crate::dispatch::apply_replicated;
use crate::error::{Result, ServerError};
use crate::state::AppState;
use bytes::{Bytes, BytesMut};
use meridian_aof::{Tail, TailReader};
use meridian_core::Catalog;
use meridian_protocol::{decode_record, encode_array, encode_resp_error, ProtocolError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// A follower within this many bytes of the leader's log reports itself
/// caught up.
const CAUGHT_UP_LAG: u64 = 16 * 1024;

// ---------------------------------------------------------------------------
// Leader side
// ---------------------------------------------------------------------------

/// Serve one follower after SYNC: pick CONTINUE or FULLRESYNC, then stream
/// the log until the connection drops or the server shuts down.
pub async fn serve_sync(
    state: &Arc<AppState>,
    stream: &mut TcpStream,
    offset: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let source = {
        let store = state.read_store();
        store
            .aof
            .as_ref()
            .map(|aof| (aof.path().to_path_buf(), aof.subscribe()))
    };
    let Some((path, rx)) = source else {
        let mut out = Vec::new();
        encode_resp_error("append-only file is disabled", &mut out);
        let _ = stream.write_all(&out).await;
        return;
    };

    let progress = *rx.borrow();
    let start = if offset < progress.base || offset > progress.len {
        let header = format!("+FULLRESYNC {} {}\r\n", progress.base, progress.len);
        if stream.write_all(header.as_bytes()).await.is_err() {
            return;
        }
        progress.base
    } else {
        let header = format!("+CONTINUE {} {}\r\n", offset, progress.len);
        if stream.write_all(header.as_bytes()).await.is_err() {
            return;
        }
        offset
    };

    info!(offset = start, "follower connected");
    state.followers.fetch_add(1, Ordering::Relaxed);
    let mut reader = TailReader::new(path, rx, start);
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            chunk = reader.read_chunk(&mut buf) => match chunk {
                Ok(Tail::Data(n)) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Ok(Tail::Hole) => {
                    // Shrunk past this follower mid-stream; drop the link so
                    // it reconnects and gets a full resync.
                    warn!(offset = reader.pos(), "follower fell into shrink hole");
                    break;
                }
                Ok(Tail::Closed) | Err(_) => break,
            }
        }
    }
    state.followers.fetch_sub(1, Ordering::Relaxed);
    info!(offset = reader.pos(), "follower disconnected");
}

// ---------------------------------------------------------------------------
// Follower side
// ---------------------------------------------------------------------------

/// Long-lived follower task: maintains a replication link whenever a
/// FOLLOW target is configured, reconnecting with a short delay.
pub async fn run_follower(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut follow_rx = state.follow_tx.subscribe();
    loop {
        let target = follow_rx.borrow_and_update().clone();
        match target {
            None => {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    changed = follow_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
            Some((host, port)) => {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    changed = follow_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    result = follow_once(&state, &host, port) => {
                        state.caught_up.store(false, Ordering::Relaxed);
                        if let Err(e) = result {
                            warn!(host, port, error = %e, "replication link lost, retrying");
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

async fn read_line(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<String> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf.split_to(pos + 2);
            return Ok(String::from_utf8_lossy(&line[..pos]).to_string());
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
    }
}

async fn follow_once(state: &Arc<AppState>, host: &str, port: u16) -> Result<()> {
    let mut stream = TcpStream::connect((host, port)).await?;
    let my_offset = {
        let store = state.read_store();
        store
            .aof
            .as_ref()
            .map(|a| a.logical_len())
            .ok_or(ServerError::AofDisabled)?
    };

    let mut buf = BytesMut::with_capacity(64 * 1024);
    stream
        .write_all(&encode_array(&[
            "REPLCONF".as_bytes(),
            b"offset",
            my_offset.to_string().as_bytes(),
        ]))
        .await?;
    let line = read_line(&mut stream, &mut buf).await?;
    if !line.starts_with("+OK") {
        return Err(ProtocolError::Framing(format!("unexpected REPLCONF reply '{line}'")).into());
    }

    stream.write_all(&encode_array(&["SYNC"])).await?;
    let line = read_line(&mut stream, &mut buf).await?;
    let leader_len = match parse_sync_header(&line)? {
        SyncHeader::Continue { offset, leader_len } => {
            info!(offset, "resuming replication");
            leader_len
        }
        SyncHeader::FullResync { base, leader_len } => {
            info!(base, "full resync: resetting local state");
            let hook_names: Vec<String> = {
                let store = state.read_store();
                store.hooks.iter().map(|h| h.name.clone()).collect()
            };
            for name in &hook_names {
                state.hub.remove(name);
            }
            let mut store = state.write_store();
            store.catalog = Catalog::new();
            for name in &hook_names {
                store.hooks.remove(name);
            }
            if let Some(aof) = store.aof.as_mut() {
                aof.reset(base)?;
            }
            leader_len
        }
    };

    loop {
        loop {
            match decode_record(&buf[..]) {
                Ok(Some((args, consumed))) => {
                    let raw = buf.split_to(consumed);
                    let args: Vec<Bytes> = args.into_iter().map(Bytes::from).collect();
                    if let Err(e) = apply_replicated(state, &raw, &args) {
                        // A record the leader wrote that we cannot apply
                        // implies corruption; continuing would diverge.
                        error!(error = %e, "fatal: failed to apply replicated record");
                        std::process::exit(1);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "fatal: corrupt replication stream");
                    std::process::exit(1);
                }
            }
        }

        let applied = {
            let store = state.read_store();
            store.aof.as_ref().map(|a| a.logical_len()).unwrap_or(0)
        };
        if applied + CAUGHT_UP_LAG >= leader_len {
            state.caught_up.store(true, Ordering::Relaxed);
            state.caught_up_once.store(true, Ordering::Relaxed);
        }

        if stream.read_buf(&mut buf).await? == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
    }
}

enum SyncHeader {
    Continue { offset: u64, leader_len: u64 },
    FullResync { base: u64, leader_len: u64 },
}

fn parse_sync_header(line: &str) -> Result<SyncHeader> {
    let mut parts = line.split_whitespace();
    let kind = parts.next().unwrap_or_default();
    let a: Option<u64> = parts.next().and_then(|s| s.parse().ok());
    let b: Option<u64> = parts.next().and_then(|s| s.parse().ok());
    match (kind, a, b) {
        ("+CONTINUE", Some(offset), Some(leader_len)) => {
            Ok(SyncHeader::Continue { offset, leader_len })
        }
        ("+FULLRESYNC", Some(base), Some(leader_len)) => {
            Ok(SyncHeader::FullResync { base, leader_len })
        }
        _ => Err(ProtocolError::Framing(format!("unexpected SYNC reply '{line}'")).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_header_parse() {
        assert!(matches!(
            parse_sync_header("+CONTINUE 100 200").unwrap(),
            SyncHeader::Continue { offset: 100, leader_len: 200 }
        ));
        assert!(matches!(
            parse_sync_header("+FULLRESYNC 0 50").unwrap(),
            SyncHeader::FullResync { base: 0, leader_len: 50 }
        ));
        assert!(parse_sync_header("-ERR nope").is_err());
    }
}
