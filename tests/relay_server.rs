//! End-to-end tests against a real relay on an ephemeral port.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use signal_relay::config::RelayConfig;
use signal_relay::relay::{
    ConnectionId, Relay, RelayError, RelayMessage, RelayServer, RoomId, WriteFailure,
};

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn test_config() -> RelayConfig {
    RelayConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ping_interval_ms: 0,
        ..RelayConfig::default()
    }
}

async fn start_server() -> (SocketAddr, Relay) {
    start_server_with(test_config()).await
}

async fn start_server_with(config: RelayConfig) -> (SocketAddr, Relay) {
    let server = RelayServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let relay = server.relay();
    tokio::spawn(server.run());
    (addr, relay)
}

async fn connect(addr: SocketAddr, room: &str) -> WsStream {
    let url = format!("ws://{}/?room={}", addr, room);
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

/// Sessions join their room after registering, so wait on the room itself.
async fn wait_for_members(relay: &Relay, room: &str, expected: usize) {
    let room = RoomId::parse(room).unwrap();
    wait_until(|| relay.rooms().members_of(&room).len() == expected).await;
}

/// Deregistration is the last cleanup step.
async fn wait_for_connections(relay: &Relay, expected: usize) {
    wait_until(|| relay.stats().connections == expected).await;
}

async fn recv(ws: &mut WsStream) -> Message {
    timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(msg)) => return msg,
                other => panic!("stream ended: {:?}", other),
            }
        }
    })
    .await
    .unwrap()
}

fn failed_with(failures: &[RelayError], peer: ConnectionId, reason: WriteFailure) -> bool {
    failures.iter().any(|e| {
        matches!(e, RelayError::TransportWrite { peer: p, reason: r } if *p == peer && *r == reason)
    })
}

async fn assert_silent(ws: &mut WsStream) {
    assert!(timeout(QUIET, ws.next()).await.is_err(), "unexpected message");
}

#[tokio::test]
async fn offer_candidate_scenario() {
    let (addr, relay) = start_server().await;
    let mut a = connect(addr, "x").await;
    let mut b = connect(addr, "x").await;
    let mut c = connect(addr, "x").await;
    wait_for_members(&relay, "x", 3).await;

    let offer = r#"{"type":"offer","sdp":"foo"}"#;
    a.send(Message::text(offer)).await.unwrap();
    assert_eq!(recv(&mut b).await, Message::text(offer));
    assert_eq!(recv(&mut c).await, Message::text(offer));
    assert_silent(&mut a).await;

    b.close(None).await.unwrap();
    drop(b);
    wait_for_connections(&relay, 2).await;

    let candidate = r#"{"type":"candidate","c":"bar"}"#;
    c.send(Message::text(candidate)).await.unwrap();
    assert_eq!(recv(&mut a).await, Message::text(candidate));
    assert_silent(&mut c).await;

    assert_eq!(relay.stats().rooms, 1);
}

#[tokio::test]
async fn rooms_do_not_leak_into_each_other() {
    let (addr, relay) = start_server().await;
    let mut a = connect(addr, "x").await;
    let mut b = connect(addr, "x").await;
    let mut d = connect(addr, "y").await;
    let mut e = connect(addr, "y").await;
    wait_for_members(&relay, "x", 2).await;
    wait_for_members(&relay, "y", 2).await;
    assert_eq!(relay.stats().rooms, 2);

    d.send(Message::text(r#"{"type":"answer"}"#)).await.unwrap();

    assert_eq!(recv(&mut e).await, Message::text(r#"{"type":"answer"}"#));
    assert_silent(&mut a).await;
    assert_silent(&mut b).await;
    assert_silent(&mut d).await;
}

#[tokio::test]
async fn binary_frames_keep_their_kind() {
    let (addr, relay) = start_server().await;
    let mut a = connect(addr, "bin").await;
    let mut b = connect(addr, "bin").await;
    wait_for_members(&relay, "bin", 2).await;

    let payload = vec![0u8, 0xff, 0x10, 0x7b];
    a.send(Message::binary(payload.clone())).await.unwrap();

    assert_eq!(recv(&mut b).await, Message::binary(payload));
}

#[tokio::test]
async fn missing_room_is_rejected_before_registration() {
    let (addr, relay) = start_server().await;

    for url in [
        format!("ws://{}/", addr),
        format!("ws://{}/?room=", addr),
        format!("ws://{}/?user=1", addr),
    ] {
        match connect_async(url.as_str()).await {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), 400, "{}", url);
            }
            other => panic!("expected rejection for {}, got {:?}", url, other.map(|_| ())),
        }
    }

    assert_eq!(relay.stats().connections, 0);
    assert_eq!(relay.stats().rooms, 0);
}

#[tokio::test]
async fn last_leave_removes_room() {
    let (addr, relay) = start_server().await;
    let mut a = connect(addr, "ephemeral").await;
    wait_for_members(&relay, "ephemeral", 1).await;
    assert_eq!(relay.stats().rooms, 1);

    a.close(None).await.unwrap();
    drop(a);
    wait_for_connections(&relay, 0).await;

    assert_eq!(relay.stats().rooms, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_reader_is_dropped_without_blocking_the_room() {
    let config = RelayConfig {
        outbound_capacity: 4,
        send_timeout_ms: 200,
        ..test_config()
    };
    let (addr, relay) = start_server_with(config).await;
    let room = RoomId::parse("stall").unwrap();

    // completes the handshake, then never reads again
    let _stalled = connect(addr, "stall").await;
    wait_for_members(&relay, "stall", 1).await;
    let stalled_id = relay.rooms().members_of(&room)[0];

    let mut healthy = connect(addr, "stall").await;
    wait_for_members(&relay, "stall", 2).await;

    let (texts_tx, mut texts) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(Ok(msg)) = healthy.next().await {
            if let Message::Text(text) = msg {
                let _ = texts_tx.send(text.as_str().to_owned());
            }
        }
    });

    let bulk = RelayMessage::from(vec![0u8; 1 << 20]);
    let origin = ConnectionId::from(0);
    let mut saw_backpressure = false;
    timeout(Duration::from_secs(20), async {
        loop {
            let report = relay.dispatcher().broadcast(&room, origin, &bulk);
            saw_backpressure |=
                failed_with(&report.failures, stalled_id, WriteFailure::Backpressure);
            // the writer gave up on the stalled socket and released its queue
            if failed_with(&report.failures, stalled_id, WriteFailure::Closed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(saw_backpressure);

    // let the healthy reader drain its queue before the final check
    tokio::time::sleep(QUIET).await;
    let report = relay
        .dispatcher()
        .broadcast(&room, origin, &RelayMessage::from("after".to_string()));
    assert_eq!(report.delivered, 1);
    assert!(failed_with(&report.failures, stalled_id, WriteFailure::Closed));

    let received = timeout(TIMEOUT, async {
        while let Some(text) = texts.recv().await {
            if text == "after" {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(received);
}
