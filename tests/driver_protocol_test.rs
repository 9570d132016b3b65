//! Driver-protocol framing tests: sequence echo, close sentinels, and the
//! payload size limit.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use fibp::cache::ServiceCache;
use fibp::client::ClientPool;
use fibp::discovery::RoutingTable;
use fibp::forward::ForwardManager;
use fibp::portforward::PortForwardManager;
use fibp::request_log::RequestLog;
use fibp::runtime::TaskPool;
use fibp::server::{DriverRouter, DriverServer};

async fn start_driver() -> (u16, CancellationToken) {
    let table = Arc::new(RoutingTable::new());
    let forwards = PortForwardManager::new(Arc::clone(&table), CancellationToken::new());
    let request_log = Arc::new(RequestLog::new(4096));
    let forward = ForwardManager::new(
        Arc::new(ClientPool::new()),
        table,
        Arc::new(ServiceCache::new(1024)),
        TaskPool::new(64),
        Arc::clone(&request_log),
        forwards,
    );
    let router = DriverRouter::new(forward, request_log, false);
    let cancel = CancellationToken::new();
    let server = DriverServer::bind(0, router, cancel.clone()).await.unwrap();
    let port = server.local_port();
    tokio::spawn(server.run());
    (port, cancel)
}

async fn write_frame(sock: &mut TcpStream, sequence: u32, payload: &[u8]) {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&sequence.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    sock.write_all(&frame).await.unwrap();
}

async fn read_frame(sock: &mut TcpStream) -> (u32, Vec<u8>) {
    let mut header = [0u8; 8];
    sock.read_exact(&mut header).await.unwrap();
    let sequence = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let mut payload = vec![0u8; len];
    sock.read_exact(&mut payload).await.unwrap();
    (sequence, payload)
}

#[tokio::test]
async fn response_mirrors_the_request_sequence() {
    let (port, _cancel) = start_driver().await;
    let mut sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    let payload = json!({
        "header": {"controller": "commands", "action": "check_alive"}
    });
    write_frame(&mut sock, 7, payload.to_string().as_bytes()).await;
    let (sequence, body) = read_frame(&mut sock).await;
    assert_eq!(sequence, 7);
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["echo"], "alive");
    assert_eq!(parsed["header"]["success"], true);

    // The connection stays usable for the next framed request.
    write_frame(&mut sock, 8, payload.to_string().as_bytes()).await;
    let (sequence, _) = read_frame(&mut sock).await;
    assert_eq!(sequence, 8);
}

#[tokio::test]
async fn sequence_zero_closes_the_connection() {
    let (port, _cancel) = start_driver().await;
    let mut sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    write_frame(&mut sock, 0, b"{}").await;
    let mut buf = [0u8; 1];
    let n = sock.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0, "server must close without answering");
}

#[tokio::test]
async fn oversized_payload_is_rejected() {
    let (port, _cancel) = start_driver().await;
    let mut sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    // Announce a payload above the 64 MiB cap without sending it.
    let mut frame = Vec::new();
    frame.extend_from_slice(&5u32.to_be_bytes());
    frame.extend_from_slice(&(65 * 1024 * 1024u32).to_be_bytes());
    sock.write_all(&frame).await.unwrap();

    let (sequence, body) = read_frame(&mut sock).await;
    assert_eq!(sequence, 5);
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["header"]["success"], false);
    assert_eq!(parsed["errors"][0], "Size exceeds limit.");

    // And then the connection closes.
    let mut buf = [0u8; 1];
    let n = sock.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn malformed_json_answers_an_error_and_keeps_the_connection() {
    let (port, _cancel) = start_driver().await;
    let mut sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    write_frame(&mut sock, 3, b"this is not json").await;
    let (sequence, body) = read_frame(&mut sock).await;
    assert_eq!(sequence, 3);
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["header"]["success"], false);

    write_frame(
        &mut sock,
        4,
        json!({"header": {"controller": "commands", "action": "check_alive"}})
            .to_string()
            .as_bytes(),
    )
    .await;
    let (sequence, _) = read_frame(&mut sock).await;
    assert_eq!(sequence, 4);
}
