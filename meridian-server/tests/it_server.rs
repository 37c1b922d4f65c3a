//! End-to-end command tests over the line protocol.

mod support;

use meridian_protocol::decode_record;
use std::time::Duration;
use support::{Resp, TestServer};
use tempfile::tempdir;

#[tokio::test]
async fn set_then_nearby_returns_item_at_zero_distance() {
    let dir = tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;
    let mut c = server.client().await;

    let reply = c
        .cmd(&["SET", "fleet", "bus1", "POINT", "33.5", "-115.5"])
        .await;
    assert_eq!(reply.expect_int(), 0);

    let reply = c
        .cmd(&["NEARBY", "fleet", "POINT", "33.5", "-115.5", "1000"])
        .await;
    let outer = reply.expect_array();
    assert_eq!(outer[0].expect_int(), 0, "exhausted cursor");
    let hits = outer[1].expect_array();
    assert_eq!(hits.len(), 1);
    let hit = hits[0].expect_array();
    assert_eq!(hit[0].expect_bulk(), "bus1");
    assert_eq!(hit.last().unwrap().expect_bulk(), "0", "distance in meters");

    server.stop().await;
}

#[tokio::test]
async fn get_formats() {
    let dir = tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;
    let mut c = server.client().await;

    c.cmd(&["SET", "fleet", "bus1", "POINT", "33.5", "-115.5"])
        .await;

    let obj = c.cmd(&["GET", "fleet", "bus1"]).await;
    let json: serde_json::Value = obj.expect_bulk().parse().unwrap();
    assert_eq!(json["type"], "Point");
    assert_eq!(json["coordinates"][0], -115.5);

    let point = c.cmd(&["GET", "fleet", "bus1", "POINT"]).await;
    let parts = point.expect_array();
    assert_eq!(parts[0].expect_bulk(), "33.5");
    assert_eq!(parts[1].expect_bulk(), "-115.5");

    let hash = c.cmd(&["GET", "fleet", "bus1", "HASH", "9"]).await;
    assert_eq!(hash.expect_bulk().len(), 9);

    assert_eq!(c.cmd(&["GET", "fleet", "ghost"]).await, Resp::Null);

    server.stop().await;
}

#[tokio::test]
async fn where_filters_and_fields_roundtrip() {
    let dir = tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;
    let mut c = server.client().await;

    c.cmd(&[
        "SET", "fleet", "slow", "FIELD", "speed", "10", "POINT", "33.5", "-115.5",
    ])
    .await;
    c.cmd(&[
        "SET", "fleet", "fast", "FIELD", "speed", "90", "POINT", "33.5", "-115.5",
    ])
    .await;

    let reply = c
        .cmd(&["SCAN", "fleet", "WHERE", "speed", ">", "50", "IDS"])
        .await;
    let ids = reply.expect_array()[1].expect_array();
    assert_eq!(ids.len(), 1);
    assert_eq!(ids[0].expect_bulk(), "fast");

    assert_eq!(c.cmd(&["FSET", "fleet", "slow", "speed", "60"]).await.expect_int(), 1);
    let reply = c
        .cmd(&["SCAN", "fleet", "WHERE", "speed", ">", "50", "COUNT"])
        .await;
    assert_eq!(reply.expect_int(), 2);

    server.stop().await;
}

#[tokio::test]
async fn expired_items_vanish_and_leave_dels_in_the_aof() {
    let dir = tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;
    let mut c = server.client().await;

    for id in ["k1", "k2", "k3"] {
        let reply = c
            .cmd(&["SET", "a", id, "EX", "1", "POINT", "10", "10"])
            .await;
        assert_eq!(reply.expect_int(), 0);
    }

    // Readers stop seeing the items the moment the TTL lapses; the scanner
    // then reaps them with synthetic DELs.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let reply = c.cmd(&["SCAN", "a"]).await;
    match reply {
        // Collection dropped once its last item was reaped.
        Resp::Error(msg) => assert_eq!(msg, "ERR key not found"),
        other => {
            let hits = other.expect_array()[1].expect_array();
            assert!(hits.is_empty(), "expired items visible: {hits:?}");
        }
    }

    server.stop().await;

    let data = std::fs::read(dir.path().join("appendonly.aof")).unwrap();
    let mut sets = 0;
    let mut dels = 0;
    let mut pos = 0;
    while let Ok(Some((args, n))) = decode_record(&data[pos..]) {
        match args[0].as_slice() {
            b"SET" => sets += 1,
            b"DEL" => dels += 1,
            _ => {}
        }
        pos += n;
    }
    assert_eq!(sets, 3);
    assert_eq!(dels, 3);
}

#[tokio::test]
async fn aof_replay_restores_state_across_restart() {
    let dir = tempdir().unwrap();
    {
        let server = TestServer::start(dir.path()).await;
        let mut c = server.client().await;
        c.cmd(&[
            "SET", "fleet", "bus1", "FIELD", "speed", "40", "POINT", "33.5", "-115.5",
        ])
        .await;
        c.cmd(&["SET", "fleet", "bus2", "STRING", "out of service"])
            .await;
        c.cmd(&[
            "SETHOOK", "warehouse", "http://localhost:1/sink", "NEARBY", "fleet", "FENCE",
            "POINT", "33.5", "-115.5", "1000",
        ])
        .await;
        server.stop().await;
    }

    let server = TestServer::start(dir.path()).await;
    let mut c = server.client().await;

    let obj = c.cmd(&["GET", "fleet", "bus1"]).await;
    let json: serde_json::Value = obj.expect_bulk().parse().unwrap();
    assert_eq!(json["coordinates"][1], 33.5);

    let s = c.cmd(&["GET", "fleet", "bus2"]).await;
    assert_eq!(s.expect_bulk(), "out of service");

    let reply = c
        .cmd(&["SCAN", "fleet", "WHERE", "speed", "==", "40", "IDS"])
        .await;
    assert_eq!(reply.expect_array()[1].expect_array().len(), 1);

    let hooks = c.cmd(&["HOOKS", "*"]).await;
    assert_eq!(hooks.expect_array().len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn shrink_compacts_overwrites_and_preserves_state() {
    let dir = tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;
    let mut c = server.client().await;

    for i in 0..500 {
        let lat = format!("{}", 33.0 + (i as f64) * 0.001);
        c.cmd(&["SET", "fleet", "bus1", "POINT", &lat, "-115.5"])
            .await;
    }
    let before = std::fs::metadata(dir.path().join("appendonly.aof"))
        .unwrap()
        .len();

    assert!(c.cmd(&["AOFSHRINK"]).await.is_ok());
    let after = std::fs::metadata(dir.path().join("appendonly.aof"))
        .unwrap()
        .len();
    assert!(after < before / 10, "shrink {before} -> {after}");

    // State identical, and still identical after a restart replays the
    // shrunken log.
    let obj = c.cmd(&["GET", "fleet", "bus1"]).await;
    let json: serde_json::Value = obj.expect_bulk().parse().unwrap();
    assert_eq!(json["coordinates"][1], 33.0 + 499.0 * 0.001);
    server.stop().await;

    let server = TestServer::start(dir.path()).await;
    let mut c = server.client().await;
    let obj = c.cmd(&["GET", "fleet", "bus1"]).await;
    let json: serde_json::Value = obj.expect_bulk().parse().unwrap();
    assert_eq!(json["coordinates"][1], 33.0 + 499.0 * 0.001);
    server.stop().await;
}

#[tokio::test]
async fn maxmemory_rejects_growth_but_allows_deletes() {
    let dir = tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;
    let mut c = server.client().await;

    c.cmd(&["SET", "junk", "keep", "STRING", "small"]).await;
    assert!(c.cmd(&["CONFIG", "SET", "maxmemory", "1kb"]).await.is_ok());

    let big = "x".repeat(4096);
    let reply = c.cmd(&["SET", "junk", "big", "STRING", &big]).await;
    assert_eq!(reply.expect_error(), "ERR out of memory");

    // Preceding items unaffected; deletes always succeed.
    assert_eq!(c.cmd(&["GET", "junk", "keep"]).await.expect_bulk(), "small");
    assert_eq!(c.cmd(&["DEL", "junk", "keep"]).await.expect_int(), 1);

    server.stop().await;
}

#[tokio::test]
async fn auth_gates_commands_when_password_set() {
    let dir = tempdir().unwrap();
    let server = TestServer::start_with(dir.path(), &["--requirepass", "sekrit"]).await;
    let mut c = server.client().await;

    let err = c.cmd(&["PING"]).await;
    assert_eq!(err.expect_error(), "ERR authentication required");

    let err = c.cmd(&["AUTH", "wrong"]).await;
    assert_eq!(err.expect_error(), "ERR invalid password");

    assert!(c.cmd(&["AUTH", "sekrit"]).await.is_ok());
    assert_eq!(c.cmd(&["PING"]).await, Resp::Simple("PONG".into()));

    server.stop().await;
}

#[tokio::test]
async fn output_json_switches_dialect() {
    let dir = tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;
    let mut c = server.client().await;

    assert!(c.cmd(&["OUTPUT", "json"]).await.expect_bulk().contains("\"ok\":true"));
    let pong = c.cmd(&["PING"]).await;
    let json: serde_json::Value = pong.expect_bulk().parse().unwrap();
    assert_eq!(json["ok"], true);
    assert_eq!(json["ping"], "pong");
    assert!(json["elapsed"].is_string());

    server.stop().await;
}

#[tokio::test]
async fn within_region_queries() {
    let dir = tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;
    let mut c = server.client().await;

    c.cmd(&["SET", "fleet", "in", "POINT", "33.5", "-115.5"]).await;
    c.cmd(&["SET", "fleet", "out", "POINT", "34.5", "-114.0"]).await;

    let reply = c
        .cmd(&[
            "WITHIN", "fleet", "IDS", "BOUNDS", "33", "-116", "34", "-115",
        ])
        .await;
    let ids = reply.expect_array()[1].expect_array();
    assert_eq!(ids.len(), 1);
    assert_eq!(ids[0].expect_bulk(), "in");

    // Region by reference to a stored object.
    c.cmd(&[
        "SET", "zones", "downtown", "OBJECT",
        r#"{"type":"Polygon","coordinates":[[[-116,33],[-115,33],[-115,34],[-116,34],[-116,33]]]}"#,
    ])
    .await;
    let reply = c
        .cmd(&["WITHIN", "fleet", "IDS", "GET", "zones", "downtown"])
        .await;
    let ids = reply.expect_array()[1].expect_array();
    assert_eq!(ids.len(), 1);
    assert_eq!(ids[0].expect_bulk(), "in");

    server.stop().await;
}
