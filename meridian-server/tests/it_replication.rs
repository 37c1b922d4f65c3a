//! Leader→follower replication tests over real sockets.

mod support;

use std::time::Duration;
use support::{Client, Resp, TestServer};
use tempfile::tempdir;

async fn get_object(c: &mut Client, key: &str, id: &str) -> Resp {
    c.cmd(&["GET", key, id]).await
}

/// Poll until an id becomes visible on a server, or panic after ~10s.
async fn wait_until_present(server: &TestServer, key: &str, id: &str) {
    for _ in 0..200 {
        let mut c = server.client().await;
        if get_object(&mut c, key, id).await != Resp::Null {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {key}/{id} to replicate");
}

#[tokio::test]
async fn follower_converges_and_rejects_writes() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    let a = TestServer::start(dir_a.path()).await;
    let b = TestServer::start(dir_b.path()).await;

    let mut ca = a.client().await;
    for i in 0..200 {
        let lat = format!("{}", 33.0 + (i % 50) as f64 * 0.01);
        let lon = format!("{}", -115.0 - (i % 40) as f64 * 0.01);
        ca.cmd(&["SET", "fleet", &format!("bus{i}"), "POINT", &lat, &lon])
            .await;
    }

    let mut cb = b.client().await;
    assert!(cb
        .cmd(&["FOLLOW", "127.0.0.1", &a.addr.port().to_string()])
        .await
        .is_ok());

    // Converged: every id resolves to the same geometry on both sides.
    wait_until_present(&b, "fleet", "bus199").await;

    let mut cb = b.client().await;
    for i in (0..200).step_by(17) {
        let id = format!("bus{i}");
        let on_a = get_object(&mut ca, "fleet", &id).await;
        let on_b = get_object(&mut cb, "fleet", &id).await;
        assert_eq!(on_a, on_b, "{id} diverged");
    }

    // New leader mutations keep flowing.
    ca.cmd(&["SET", "fleet", "late", "POINT", "35", "-110"]).await;
    wait_until_present(&b, "fleet", "late").await;

    // Followers reject client mutations.
    let err = cb.cmd(&["SET", "fleet", "rogue", "POINT", "1", "1"]).await;
    assert_eq!(err.expect_error(), "ERR follower is read only");

    // caught_up surfaces in SERVER stats.
    let stats = cb.cmd(&["SERVER"]).await;
    let pairs = stats.expect_array();
    let caught_up = pairs
        .chunks(2)
        .find(|kv| kv[0].expect_bulk() == "caught_up_once")
        .map(|kv| kv[1].expect_bulk().to_string());
    assert_eq!(caught_up.as_deref(), Some("true"));

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn follower_resumes_after_leader_shrink() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    let a = TestServer::start(dir_a.path()).await;

    let mut ca = a.client().await;
    for i in 0..300 {
        ca.cmd(&["SET", "fleet", "bus1", "POINT", &format!("{}", 33.0 + i as f64 * 0.001), "-115.5"])
            .await;
    }
    assert!(ca.cmd(&["AOFSHRINK"]).await.is_ok());

    // A follower starting from offset zero lands in the shrink hole and is
    // served a full state dump instead.
    let b = TestServer::start(dir_b.path()).await;
    let mut cb = b.client().await;
    assert!(cb
        .cmd(&["FOLLOW", "127.0.0.1", &a.addr.port().to_string()])
        .await
        .is_ok());

    wait_until_present(&b, "fleet", "bus1").await;

    let mut cb = b.client().await;
    assert_eq!(
        get_object(&mut ca, "fleet", "bus1").await,
        get_object(&mut cb, "fleet", "bus1").await
    );

    b.stop().await;
    a.stop().await;
}
