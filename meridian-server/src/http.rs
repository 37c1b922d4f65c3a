//! HTTP framing for the command surface.
//!
//! `POST|GET /<command>/<arg>/<arg>/…` with percent-encoded path segments;
//! every response is a JSON document with `ok` and `elapsed`. The router
//! is served per-connection by the ingress after protocol sniffing, so
//! HTTP and the line protocol share one port.

use crate::dispatch::{dispatch, Outcome, Session};
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use meridian_protocol::{encode_json, encode_json_error};
use percent_encoding::percent_decode_str;
use std::sync::Arc;
use std::time::Instant;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new().fallback(handle).with_state(state)
}

async fn handle(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let started = Instant::now();
    let path = req.uri().path().to_string();
    let args: Vec<Bytes> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|seg| Bytes::from(percent_decode_str(seg).collect::<Vec<u8>>()))
        .collect();

    let mut session = Session::client(true);
    let body = if args.is_empty() {
        encode_json_error("empty command", started.elapsed())
    } else {
        match dispatch(&state, &mut session, &args) {
            Ok(Outcome::Reply(reply)) => encode_json(&reply, started.elapsed()),
            Ok(Outcome::StartSync { .. }) => {
                encode_json_error("command not supported over http", started.elapsed())
            }
            Err(e) => encode_json_error(&e.to_string(), started.elapsed()),
        }
    };
    ([("content-type", "application/json")], body).into_response()
}
