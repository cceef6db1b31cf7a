#![allow(clippy::unwrap_used, clippy::expect_used)] // Integration tests use unwrap for brevity

//! Integration tests for the relay: real WebSocket clients against a relay
//! bound to an ephemeral local port.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use testcast_core::MAX_CLIENTS_REACHED;
use testcast_relay::{RelayConfig, RelayServer};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

async fn start_relay() -> (RelayServer, SocketAddr) {
    let server = RelayServer::new(RelayConfig {
        addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        reject_grace: Duration::from_millis(300),
    });
    let addr = server.start().await.unwrap();
    (server, addr)
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    ws
}

/// Connect and wait until the relay has admitted the connection.
async fn connect_admitted(server: &RelayServer, addr: SocketAddr, expected: usize) -> Ws {
    let ws = connect(addr).await;
    wait_for_count(server, expected).await;
    ws
}

async fn wait_for_count(server: &RelayServer, expected: usize) {
    for _ in 0..200 {
        if server.participant_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "participant count never reached {expected} (is {})",
        server.participant_count().await
    );
}

async fn recv_text(ws: &mut Ws) -> Option<String> {
    loop {
        match tokio::time::timeout(RECV_TIMEOUT, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Some(text),
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
            _ => return None,
        }
    }
}

/// Assert nothing arrives within a short window.
async fn assert_silent(ws: &mut Ws) {
    match tokio::time::timeout(Duration::from_millis(200), ws.next()).await {
        Err(_) => {}
        Ok(other) => panic!("expected no frame, got {other:?}"),
    }
}

fn output(message: &str, timestamp: &str) -> String {
    json!({"kind": "output", "payload": {"message": message}, "timestamp": timestamp}).to_string()
}

// =========================================================================
// Forwarding
// =========================================================================

#[tokio::test]
async fn output_is_forwarded_verbatim_to_the_other_participant() {
    let (server, addr) = start_relay().await;
    let mut p = connect_admitted(&server, addr, 1).await;
    let mut q = connect_admitted(&server, addr, 2).await;

    let sent = output("ok", "t1");
    p.send(Message::Text(sent.clone())).await.unwrap();

    assert_eq!(recv_text(&mut q).await.as_deref(), Some(sent.as_str()));
    assert_silent(&mut p).await;

    server.stop().await;
}

#[tokio::test]
async fn forwarding_works_in_both_directions() {
    let (server, addr) = start_relay().await;
    let mut p = connect_admitted(&server, addr, 1).await;
    let mut q = connect_admitted(&server, addr, 2).await;

    let status = json!({
        "kind": "status",
        "payload": {"message": "running", "test": "login"},
        "timestamp": "t2"
    })
    .to_string();
    q.send(Message::Text(status.clone())).await.unwrap();

    assert_eq!(recv_text(&mut p).await.as_deref(), Some(status.as_str()));
    assert_silent(&mut q).await;

    server.stop().await;
}

#[tokio::test]
async fn single_sender_order_is_preserved() {
    let (server, addr) = start_relay().await;
    let mut p = connect_admitted(&server, addr, 1).await;
    let mut q = connect_admitted(&server, addr, 2).await;

    for i in 0..50 {
        p.send(Message::Text(output(&format!("line {i}"), "t")))
            .await
            .unwrap();
    }
    for i in 0..50 {
        let text = recv_text(&mut q).await.unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["payload"]["message"], format!("line {i}"));
    }

    server.stop().await;
}

// =========================================================================
// Capacity
// =========================================================================

#[tokio::test]
async fn third_connection_gets_one_capacity_error_and_no_traffic() {
    let (server, addr) = start_relay().await;
    let mut p = connect_admitted(&server, addr, 1).await;
    let mut q = connect_admitted(&server, addr, 2).await;

    let mut r = connect(addr).await;
    let rejection = recv_text(&mut r).await.unwrap();
    let value: Value = serde_json::from_str(&rejection).unwrap();
    assert_eq!(value["kind"], "error");
    assert_eq!(value["payload"]["message"], MAX_CLIENTS_REACHED);
    assert!(value["timestamp"].as_str().is_some_and(|t| !t.is_empty()));
    assert_eq!(server.participant_count().await, 2);

    // P/Q traffic still flows and never reaches R
    p.send(Message::Text(output("after-reject", "t3")))
        .await
        .unwrap();
    assert!(recv_text(&mut q).await.unwrap().contains("after-reject"));

    // R's own sends are discarded
    r.send(Message::Text(output("from-r", "t4"))).await.unwrap();
    assert_silent(&mut p).await;
    assert_silent(&mut q).await;

    // The only text frame R ever saw was the rejection
    loop {
        match tokio::time::timeout(RECV_TIMEOUT, r.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => panic!("rejected client got {text}"),
            Ok(Some(Ok(Message::Close(_)) | Err(_)) | None) | Err(_) => break,
            Ok(Some(Ok(_))) => {}
        }
    }

    server.stop().await;
}

#[tokio::test]
async fn rejected_client_is_closed_after_grace_period() {
    let (server, addr) = start_relay().await;
    let _p = connect_admitted(&server, addr, 1).await;
    let _q = connect_admitted(&server, addr, 2).await;

    let mut r = connect(addr).await;
    assert!(recv_text(&mut r).await.is_some());

    let closed = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match r.next().await {
                Some(Ok(Message::Close(_)) | Err(_)) | None => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "relay never closed the rejected connection");

    server.stop().await;
}

#[tokio::test]
async fn disconnect_frees_a_slot() {
    let (server, addr) = start_relay().await;
    let mut p = connect_admitted(&server, addr, 1).await;
    let mut q = connect_admitted(&server, addr, 2).await;

    p.close(None).await.unwrap();
    wait_for_count(&server, 1).await;

    let mut r = connect_admitted(&server, addr, 2).await;
    q.send(Message::Text(output("to-r", "t5"))).await.unwrap();
    assert!(recv_text(&mut r).await.unwrap().contains("to-r"));

    server.stop().await;
}

// =========================================================================
// Local failures
// =========================================================================

#[tokio::test]
async fn sending_while_alone_does_not_crash_the_relay() {
    let (server, addr) = start_relay().await;
    let mut p = connect_admitted(&server, addr, 1).await;

    p.send(Message::Text(output("nobody-listening", "t6")))
        .await
        .unwrap();
    assert_silent(&mut p).await;
    assert!(server.is_running().await);
    assert_eq!(server.participant_count().await, 1);

    // The dropped envelope is not replayed to a late joiner
    let mut q = connect_admitted(&server, addr, 2).await;
    p.send(Message::Text(output("now-listening", "t7")))
        .await
        .unwrap();
    assert!(recv_text(&mut q).await.unwrap().contains("now-listening"));

    server.stop().await;
}

#[tokio::test]
async fn invalid_and_error_envelopes_are_never_forwarded() {
    let (server, addr) = start_relay().await;
    let mut p = connect_admitted(&server, addr, 1).await;
    let mut q = connect_admitted(&server, addr, 2).await;

    let rejected = [
        "not json".to_string(),
        json!({"payload": {"message": "x"}, "timestamp": "t"}).to_string(),
        json!({"kind": "output", "payload": {}, "timestamp": "t"}).to_string(),
        json!({"kind": "output", "payload": {"message": "x"}}).to_string(),
        json!({"kind": "test_output", "payload": {"message": "x"}, "timestamp": "t"}).to_string(),
        json!({"kind": "error", "payload": {"message": "x"}, "timestamp": "t"}).to_string(),
    ];
    for text in rejected {
        p.send(Message::Text(text)).await.unwrap();
    }
    p.send(Message::Binary(b"{}".to_vec())).await.unwrap();

    let valid = output("valid", "t8");
    p.send(Message::Text(valid.clone())).await.unwrap();

    // The first thing Q sees is the valid envelope
    assert_eq!(recv_text(&mut q).await.as_deref(), Some(valid.as_str()));
    assert_eq!(server.participant_count().await, 2);

    server.stop().await;
}

// =========================================================================
// Lifecycle
// =========================================================================

#[tokio::test]
async fn stop_closes_open_connections() {
    let (server, addr) = start_relay().await;
    let mut p = connect_admitted(&server, addr, 1).await;

    server.stop().await;

    let ended = tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            match p.next().await {
                Some(Ok(Message::Close(_)) | Err(_)) | None => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok());
    assert!(tokio_tungstenite::connect_async(format!("ws://{addr}")).await.is_err());
}

#[tokio::test]
async fn stop_sends_a_close_frame_to_every_participant() {
    let (server, addr) = start_relay().await;
    let mut p = connect_admitted(&server, addr, 1).await;
    let mut q = connect_admitted(&server, addr, 2).await;

    server.stop().await;

    for ws in [&mut p, &mut q] {
        let frame = tokio::time::timeout(RECV_TIMEOUT, ws.next()).await.unwrap();
        assert!(matches!(frame, Some(Ok(Message::Close(_)))), "got {frame:?}");
    }
    assert_eq!(server.participant_count().await, 0);
}
