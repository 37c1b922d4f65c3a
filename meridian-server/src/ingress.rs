//! Dual-protocol ingress.
//!
//! One TCP port serves both the line protocol and HTTP. Each accepted
//! connection is sniffed by peeking its first byte: a RESP array marker
//! (`*`) starts a line-protocol session; anything else is handed to the
//! HTTP stack for the life of the connection.
//!
//! Protected mode: with no password set, non-loopback peers are refused
//! before any command runs.

use crate::dispatch::{dispatch, Outcome, Session};
use crate::repl;
use crate::state::AppState;
use axum::Router;
use bytes::BytesMut;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::service::TowerToHyperService;
use meridian_protocol::{
    encode_json, encode_json_error, encode_resp, encode_resp_error, parse_request, Dialect, Reply,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

pub async fn serve(
    state: Arc<AppState>,
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let state = state.clone();
                let router = router.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(handle_conn(state, stream, peer, router, shutdown));
            }
        }
    }
}

async fn handle_conn(
    state: Arc<AppState>,
    mut stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    shutdown: watch::Receiver<bool>,
) {
    let refused = {
        let store = state.read_store();
        store.runtime.protected() && store.runtime.requirepass.is_none()
    } && !peer.ip().is_loopback();
    if refused {
        let mut out = Vec::new();
        encode_resp_error(
            "protected mode: only loopback connections are accepted unless a password is set",
            &mut out,
        );
        let _ = stream.write_all(&out).await;
        return;
    }

    let mut first = [0u8; 1];
    match stream.peek(&mut first).await {
        Ok(0) | Err(_) => return,
        Ok(_) => {}
    }

    if first[0] == b'*' {
        resp_session(state, stream, shutdown).await;
    } else if state.config.http_transport {
        let service = TowerToHyperService::new(router);
        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(stream), service)
            .await
        {
            debug!(peer = %peer, error = %e, "http connection ended");
        }
    }
}

fn write_reply(out: &mut Vec<u8>, dialect: Dialect, reply: &Reply, elapsed: Duration) {
    match dialect {
        Dialect::Resp => encode_resp(reply, out),
        // JSON-dialect sessions on the line protocol receive the JSON
        // document as a bulk string.
        Dialect::Json => encode_resp(&Reply::Bulk(encode_json(reply, elapsed)), out),
    }
}

fn write_error(out: &mut Vec<u8>, dialect: Dialect, msg: &str, elapsed: Duration) {
    match dialect {
        Dialect::Resp => encode_resp_error(msg, out),
        Dialect::Json => encode_resp(&Reply::Bulk(encode_json_error(msg, elapsed)), out),
    }
}

async fn resp_session(
    state: Arc<AppState>,
    mut stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut session = Session::client(false);
    if state.config.output.eq_ignore_ascii_case("json") {
        session.dialect = Dialect::Json;
    }
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let mut out: Vec<u8> = Vec::with_capacity(16 * 1024);

    loop {
        loop {
            match parse_request(&mut buf) {
                Ok(Some(args)) => {
                    let started = Instant::now();
                    match dispatch(&state, &mut session, &args) {
                        Ok(Outcome::Reply(reply)) => {
                            write_reply(&mut out, session.dialect, &reply, started.elapsed());
                        }
                        Ok(Outcome::StartSync { offset }) => {
                            if !out.is_empty() {
                                if stream.write_all(&out).await.is_err() {
                                    return;
                                }
                                out.clear();
                            }
                            repl::serve_sync(&state, &mut stream, offset, shutdown).await;
                            return;
                        }
                        Err(e) => {
                            write_error(&mut out, session.dialect, &e.to_string(), started.elapsed());
                            if e.is_framing() {
                                let _ = stream.write_all(&out).await;
                                return;
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    write_error(&mut out, session.dialect, &e.to_string(), Duration::ZERO);
                    let _ = stream.write_all(&out).await;
                    return;
                }
            }
        }

        if !out.is_empty() {
            if stream.write_all(&out).await.is_err() {
                return;
            }
            out.clear();
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            read = stream.read_buf(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }
}
