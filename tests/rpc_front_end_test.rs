//! Msgpack-RPC front-end tests: the method table, batch calls, and the
//! single-service passthrough family.

use std::sync::Arc;

use rmpv::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use fibp::cache::ServiceCache;
use fibp::client::ClientPool;
use fibp::discovery::RoutingTable;
use fibp::forward::ForwardManager;
use fibp::portforward::PortForwardManager;
use fibp::request_log::RequestLog;
use fibp::runtime::TaskPool;
use fibp::server::RpcFrontServer;
use fibp::types::{ServiceNode, ServiceType};

async fn start_rpc_front(table: Arc<RoutingTable>) -> (u16, CancellationToken) {
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
    let cancel = CancellationToken::new();
    let server = RpcFrontServer::bind(0, forward, request_log, cancel.clone())
        .await
        .unwrap();
    let port = server.local_port();
    tokio::spawn(server.run());
    (port, cancel)
}

async fn call(sock: &mut TcpStream, msgid: u32, method: &str, params: Value) -> (Value, Value) {
    let frame = Value::Array(vec![
        Value::from(0),
        Value::from(msgid),
        Value::from(method),
        params,
    ]);
    let mut out = Vec::new();
    rmpv::encode::write_value(&mut out, &frame).unwrap();
    sock.write_all(&out).await.unwrap();

    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let mut cursor = std::io::Cursor::new(&buf[..]);
        if let Ok(value) = rmpv::decode::read_value(&mut cursor) {
            let items = value.as_array().cloned().expect("response array");
            assert_eq!(items.len(), 4);
            assert_eq!(items[0].as_u64(), Some(1), "response frame type");
            assert_eq!(items[1].as_u64(), Some(u64::from(msgid)));
            return (items[2].clone(), items[3].clone());
        }
        let n = sock.read(&mut chunk).await.unwrap();
        assert!(n > 0, "server closed before answering");
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[tokio::test]
async fn test_method_returns_true() {
    let (port, _cancel) = start_rpc_front(Arc::new(RoutingTable::new())).await;
    let mut sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (err, result) = call(&mut sock, 1, "test", Value::Array(vec![])).await;
    assert!(err.is_nil());
    assert_eq!(result.as_bool(), Some(true));
}

#[tokio::test]
async fn unknown_method_reports_no_method_error() {
    let (port, _cancel) = start_rpc_front(Arc::new(RoutingTable::new())).await;
    let mut sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (err, _result) = call(&mut sock, 2, "does_not_exist", Value::Array(vec![])).await;
    assert_eq!(err.as_str(), Some("NO_METHOD_ERROR"));
}

#[tokio::test]
async fn malformed_single_call_method_reports_argument_error() {
    let (port, _cancel) = start_rpc_front(Arc::new(RoutingTable::new())).await;
    let mut sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    // Missing the "/{service}/{api}" tail separator.
    let (err, _result) = call(
        &mut sock,
        3,
        "call_single_service_async/only-service",
        Value::Array(vec![]),
    )
    .await;
    assert_eq!(err.as_str(), Some("ARGUMENT_ERROR"));
}

#[tokio::test]
async fn batch_call_answers_rows_in_order() {
    let (port, _cancel) = start_rpc_front(Arc::new(RoutingTable::new())).await;
    let mut sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    let row = |name: &str| {
        Value::Array(vec![
            Value::from(name),
            Value::from(""),
            Value::from(3u32),
            Value::from("{}"),
            Value::from("dev"),
            Value::from(0u32),
            Value::from(false),
        ])
    };
    let params = Value::Array(vec![Value::Array(vec![Value::Array(vec![
        row("local_test"),
        row("missing-service"),
    ])])]);
    let (err, result) = call(&mut sock, 4, "call_services_async", params).await;
    assert!(err.is_nil());

    let rows = result[0].as_array().expect("rsp_list");
    assert_eq!(rows.len(), 2);
    let first = rows[0].as_array().unwrap();
    assert_eq!(first[0].as_str(), Some("local_test"));
    assert_eq!(first[2].as_str(), Some(""), "no error on the echo row");
    let second = rows[1].as_array().unwrap();
    assert_eq!(second[0].as_str(), Some("missing-service"));
    assert_eq!(second[2].as_str(), Some("Service Not Found."));
}

#[tokio::test]
async fn single_service_passthrough_forwards_params_and_unpacks_the_result() {
    // Mock RPC upstream echoing its params back as the result.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let mut cursor = std::io::Cursor::new(&buf[..]);
            if let Ok(value) = rmpv::decode::read_value(&mut cursor) {
                let consumed = cursor.position() as usize;
                buf.drain(..consumed);
                let items = value.as_array().cloned().unwrap_or_default();
                if items.len() != 4 {
                    return;
                }
                let frame = Value::Array(vec![
                    Value::from(1),
                    items[1].clone(),
                    Value::Nil,
                    Value::from("pong-from-rpc"),
                ]);
                let mut out = Vec::new();
                rmpv::encode::write_value(&mut out, &frame).unwrap();
                if sock.write_all(&out).await.is_err() {
                    return;
                }
                continue;
            }
            let Ok(n) = sock.read(&mut chunk).await else {
                return;
            };
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    });

    let table = Arc::new(RoutingTable::new());
    let mut seen = std::collections::HashSet::new();
    let mut update: fibp::discovery::NodesByType =
        (0..ServiceType::COUNT).map(|_| Default::default()).collect();
    update[ServiceType::Rpc.index()]
        .entry("calc-dev".to_string())
        .or_default()
        .insert(ServiceNode::new(
            upstream.ip().to_string(),
            upstream.port().to_string(),
        ));
    table.apply_health_update(&mut seen, update);

    let (port, _cancel) = start_rpc_front(table).await;
    let mut sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (err, result) = call(
        &mut sock,
        9,
        "call_single_service_async/calc/add",
        Value::Array(vec![Value::from(1), Value::from(2)]),
    )
    .await;
    assert!(err.is_nil(), "unexpected error: {err:?}");
    assert_eq!(result.as_str(), Some("pong-from-rpc"));
}
