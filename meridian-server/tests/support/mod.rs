//! Test support: a minimal line-protocol client and server harness.

#![allow(dead_code)]

use bytes::{Buf, BytesMut};
use clap::Parser;
use meridian_protocol::encode_array;
use meridian_server::{MeridianServer, ServerConfig};
use std::net::SocketAddr;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A decoded line-protocol reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Resp {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(String),
    Null,
    Array(Vec<Resp>),
}

impl Resp {
    pub fn expect_int(&self) -> i64 {
        match self {
            Resp::Int(n) => *n,
            other => panic!("expected integer reply, got {other:?}"),
        }
    }

    pub fn expect_bulk(&self) -> &str {
        match self {
            Resp::Bulk(s) => s,
            other => panic!("expected bulk reply, got {other:?}"),
        }
    }

    pub fn expect_array(&self) -> &[Resp] {
        match self {
            Resp::Array(items) => items,
            other => panic!("expected array reply, got {other:?}"),
        }
    }

    pub fn expect_error(&self) -> &str {
        match self {
            Resp::Error(msg) => msg,
            other => panic!("expected error reply, got {other:?}"),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Resp::Simple(s) if s == "OK")
    }
}

fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    if from > data.len() {
        return None;
    }
    data[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

fn try_parse(data: &[u8]) -> Option<(Resp, usize)> {
    if data.is_empty() {
        return None;
    }
    let end = find_crlf(data, 1)?;
    let line = std::str::from_utf8(&data[1..end]).ok()?;
    match data[0] {
        b'+' => Some((Resp::Simple(line.to_string()), end + 2)),
        b'-' => Some((Resp::Error(line.to_string()), end + 2)),
        b':' => Some((Resp::Int(line.parse().ok()?), end + 2)),
        b'$' => {
            let len: i64 = line.parse().ok()?;
            if len < 0 {
                return Some((Resp::Null, end + 2));
            }
            let start = end + 2;
            let stop = start + len as usize;
            if data.len() < stop + 2 {
                return None;
            }
            let body = String::from_utf8_lossy(&data[start..stop]).to_string();
            Some((Resp::Bulk(body), stop + 2))
        }
        b'*' => {
            let count: usize = line.parse().ok()?;
            let mut pos = end + 2;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                let (item, used) = try_parse(&data[pos..])?;
                items.push(item);
                pos += used;
            }
            Some((Resp::Array(items), pos))
        }
        _ => panic!("unexpected reply byte {:?}", data[0] as char),
    }
}

pub struct Client {
    stream: TcpStream,
    buf: BytesMut,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Client {
            stream,
            buf: BytesMut::with_capacity(64 * 1024),
        }
    }

    pub async fn cmd(&mut self, args: &[&str]) -> Resp {
        self.stream
            .write_all(&encode_array(args))
            .await
            .expect("send command");
        loop {
            if let Some((value, used)) = try_parse(&self.buf[..]) {
                self.buf.advance(used);
                return value;
            }
            let n = self.stream.read_buf(&mut self.buf).await.expect("read reply");
            assert!(n > 0, "server closed connection");
        }
    }
}

/// A running server bound to an ephemeral loopback port.
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<meridian_server::Result<()>>,
}

impl TestServer {
    pub async fn start(dir: &Path) -> TestServer {
        Self::start_with(dir, &[]).await
    }

    pub async fn start_with(dir: &Path, extra: &[&str]) -> TestServer {
        let mut argv = vec![
            "meridian-server".to_string(),
            "--port".into(),
            "0".into(),
            "--dir".into(),
            dir.to_string_lossy().to_string(),
        ];
        argv.extend(extra.iter().map(|s| s.to_string()));
        let config = ServerConfig::try_parse_from(argv).expect("parse test config");
        let server = MeridianServer::bind(config).await.expect("bind server");
        let addr = server.local_addr().expect("local addr");
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(server.run(rx));
        TestServer {
            addr,
            shutdown,
            task,
        }
    }

    pub async fn client(&self) -> Client {
        Client::connect(self.addr).await
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}
