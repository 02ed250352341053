//! Multi-client delivery through the broadcast manager.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use feedcast_server::websocket::broadcast::BroadcastManager;
use feedcast_server::websocket::connection::ClientConnection;
use feedcast_server::websocket::frame::read_frame;
use feedcast_server::websocket::message::MessageIndex;
use feedcast_settings::BroadcasterSettings;
use serde_json::{Value, json};
use tokio::io::DuplexStream;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);
const CLIENT_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

async fn next_seq(client: &mut DuplexStream) -> u64 {
    let frame = timeout(TIMEOUT, read_frame(client, 1 << 20))
        .await
        .expect("timed out waiting for frame")
        .unwrap();
    let body: Value = serde_json::from_slice(frame.payload()).unwrap();
    body["sequenceNumber"].as_u64().unwrap()
}

fn feed_message(seq: u64) -> Value {
    json!({"version": 1, "sequenceNumber": seq})
}

#[tokio::test]
async fn every_client_sees_the_full_feed_in_order() {
    let bm = BroadcastManager::new(BroadcasterSettings::default(), CancellationToken::new());
    let mut clients = Vec::new();
    for _ in 0..4 {
        let (server, client) = tokio::io::duplex(64 * 1024);
        let _ = bm.accept(server, MessageIndex(0), CLIENT_IP, false).await.unwrap();
        clients.push(client);
    }

    for seq in 0..50 {
        assert_eq!(bm.broadcast(&feed_message(seq)).await, 4);
        tokio::task::yield_now().await;
    }
    for client in &mut clients {
        for seq in 0..50 {
            assert_eq!(next_seq(client).await, seq);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn delayed_client_does_not_hold_back_others() {
    let bm = BroadcastManager::new(BroadcasterSettings::default(), CancellationToken::new());

    let (fast_server, mut fast) = tokio::io::duplex(64 * 1024);
    let _ = bm.accept(fast_server, MessageIndex(0), CLIENT_IP, false).await.unwrap();

    let (slow_server, mut slow) = tokio::io::duplex(64 * 1024);
    let delayed = ClientConnection::new(
        slow_server,
        &bm,
        MessageIndex(0),
        CLIENT_IP,
        false,
        Duration::from_secs(2),
        0.5,
    )
    .unwrap();
    bm.add(Arc::clone(&delayed)).await.unwrap();

    let start = Instant::now();
    for seq in 0..3 {
        let _ = bm.broadcast(&feed_message(seq)).await;
    }

    for seq in 0..3 {
        assert_eq!(next_seq(&mut fast).await, seq);
    }
    assert!(start.elapsed() < Duration::from_millis(10));

    assert_eq!(next_seq(&mut slow).await, 0);
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(next_seq(&mut slow).await, 1);
    assert!(start.elapsed() >= Duration::from_secs(3));
    assert_eq!(next_seq(&mut slow).await, 2);
    assert!(start.elapsed() >= Duration::from_millis(3500));
}

#[tokio::test]
async fn broken_client_removed_while_others_continue() {
    let bm = BroadcastManager::new(BroadcasterSettings::default(), CancellationToken::new());
    let (good_server, mut good) = tokio::io::duplex(64 * 1024);
    let _ = bm.accept(good_server, MessageIndex(0), CLIENT_IP, false).await.unwrap();
    let (bad_server, bad) = tokio::io::duplex(64 * 1024);
    let broken = bm.accept(bad_server, MessageIndex(0), CLIENT_IP, false).await.unwrap();
    drop(bad);

    let _ = bm.broadcast(&feed_message(1)).await;
    timeout(TIMEOUT, broken.closed()).await.unwrap();
    assert_eq!(bm.connection_count().await, 1);

    let _ = bm.broadcast(&feed_message(2)).await;
    assert_eq!(next_seq(&mut good).await, 1);
    assert_eq!(next_seq(&mut good).await, 2);
}

#[tokio::test]
async fn parent_token_shutdown_is_bounded() {
    let token = CancellationToken::new();
    let bm = BroadcastManager::new(
        BroadcasterSettings {
            client_delay_ms: 60_000,
            ..BroadcasterSettings::default()
        },
        token.clone(),
    );
    let mut conns = Vec::new();
    let mut pipes = Vec::new();
    for _ in 0..3 {
        let (server, client) = tokio::io::duplex(64 * 1024);
        conns.push(bm.accept(server, MessageIndex(0), CLIENT_IP, false).await.unwrap());
        pipes.push(client);
    }
    let _ = bm.broadcast(&feed_message(0)).await;

    let begin = std::time::Instant::now();
    assert!(bm.shutdown(Duration::from_secs(2)).await);
    assert!(begin.elapsed() < Duration::from_secs(2));
    assert!(token.is_cancelled());
    for conn in &conns {
        assert!(conn.is_closed());
    }
    assert_eq!(bm.connection_count().await, 0);
}
