//! Reply model and the two response dialects.
//!
//! Handlers build a [`Reply`] tree; the session encoder renders it as RESP
//! or as a JSON document. JSON replies always carry `"ok"` and an
//! `"elapsed"` field mirroring the command's wall time, and errors become
//! `{"ok":false,"err":...}` instead of a RESP `-ERR` line.

use serde_json::Value;
use std::time::Duration;

/// A wire-agnostic response value.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `+OK`-style simple string.
    Simple(&'static str),
    Integer(i64),
    Bulk(String),
    Array(Vec<Reply>),
    Null,
    /// JSON-dialect body; the encoder wraps it with `ok` and `elapsed`.
    /// RESP sessions receive it serialized as a bulk string.
    Json(Value),
}

impl Reply {
    pub fn bulk(s: impl Into<String>) -> Reply {
        Reply::Bulk(s.into())
    }
}

fn fmt_elapsed(elapsed: Duration) -> String {
    format!("{elapsed:?}")
}

/// Encode a reply in the RESP dialect.
pub fn encode_resp(reply: &Reply, out: &mut Vec<u8>) {
    match reply {
        Reply::Simple(s) => {
            out.push(b'+');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Reply::Integer(n) => {
            out.extend_from_slice(format!(":{n}\r\n").as_bytes());
        }
        Reply::Bulk(s) => {
            out.extend_from_slice(format!("${}\r\n", s.len()).as_bytes());
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Reply::Array(items) => {
            out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                encode_resp(item, out);
            }
        }
        Reply::Null => out.extend_from_slice(b"$-1\r\n"),
        Reply::Json(v) => {
            let s = v.to_string();
            out.extend_from_slice(format!("${}\r\n", s.len()).as_bytes());
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// Encode an error in the RESP dialect.
pub fn encode_resp_error(msg: &str, out: &mut Vec<u8>) {
    out.push(b'-');
    out.extend_from_slice(b"ERR ");
    // Error text must stay on one line.
    for b in msg.bytes() {
        out.push(if b == b'\r' || b == b'\n' { b' ' } else { b });
    }
    out.extend_from_slice(b"\r\n");
}

/// Render a reply as a JSON document with `ok` and `elapsed`.
///
/// `Json` bodies are merged at the top level; other reply shapes land under
/// a generic key so every command has a JSON rendering.
pub fn encode_json(reply: &Reply, elapsed: Duration) -> String {
    let mut body = match reply {
        Reply::Json(Value::Object(map)) => Value::Object(map.clone()),
        Reply::Json(other) => serde_json::json!({ "result": other }),
        Reply::Simple(s) => serde_json::json!({ "result": s }),
        Reply::Integer(n) => serde_json::json!({ "result": n }),
        Reply::Bulk(s) => serde_json::json!({ "result": s }),
        Reply::Array(_) => serde_json::json!({}),
        Reply::Null => serde_json::json!({ "result": Value::Null }),
    };
    if let Value::Object(map) = &mut body {
        map.insert("ok".into(), Value::Bool(true));
        map.insert("elapsed".into(), Value::String(fmt_elapsed(elapsed)));
    }
    body.to_string()
}

/// Render an error as a JSON document.
pub fn encode_json_error(msg: &str, elapsed: Duration) -> String {
    serde_json::json!({
        "ok": false,
        "err": msg,
        "elapsed": fmt_elapsed(elapsed),
    })
    .to_string()
}
