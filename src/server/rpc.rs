//! Msgpack-RPC front end.
//!
//! Accepts `[0, msgid, method, params]` request frames and answers
//! `[1, msgid, err, result]`. Three methods exist: `test`,
//! `call_services_async`, and the `call_single_service_async/{service}/{api}`
//! family whose params are forwarded opaquely to the named RPC service.

use std::io::Cursor;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use rmpv::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FibpError, Result};
use crate::forward::ForwardManager;
use crate::request_log::RequestLog;
use crate::types::{HttpMethod, ServiceCallReq, ServiceCallRsp, ServiceType, DEFAULT_CLUSTER};

const RPC_REQUEST: u64 = 0;
const RPC_RESPONSE: u64 = 1;

const METHOD_TEST: &str = "test";
const METHOD_CALL_SERVICES: &str = "call_services_async";
const METHOD_CALL_SINGLE: &str = "call_single_service_async";

const ERR_ARGUMENT: &str = "ARGUMENT_ERROR";
const ERR_NO_METHOD: &str = "NO_METHOD_ERROR";
const ERR_SERVER_RETURN: &str = "SERVER_RETURN_ERROR";

const READ_CHUNK: usize = 32 * 1024;

/// The msgpack-RPC acceptor.
pub struct RpcFrontServer {
    listener: TcpListener,
    forward: Arc<ForwardManager>,
    request_log: Arc<RequestLog>,
    cancel: CancellationToken,
}

impl RpcFrontServer {
    pub async fn bind(
        port: u16,
        forward: Arc<ForwardManager>,
        request_log: Arc<RequestLog>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| FibpError::Listen { addr, source })?;
        info!(port, "rpc server listening");
        Ok(RpcFrontServer {
            listener,
            forward,
            request_log,
            cancel,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub async fn run(self) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, _peer)) => {
                    let forward = Arc::clone(&self.forward);
                    let request_log = Arc::clone(&self.request_log);
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        serve_connection(socket, forward, request_log, cancel).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "rpc accept failed");
                    break;
                }
            }
        }
        debug!("rpc accept loop exited");
    }
}

async fn serve_connection(
    socket: TcpStream,
    forward: Arc<ForwardManager>,
    request_log: Arc<RequestLog>,
    cancel: CancellationToken,
) {
    let (mut read_half, write_half) = socket.into_split();
    let writer = Arc::new(Mutex::new(write_half));
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        // Drain every complete frame already buffered.
        loop {
            if buf.is_empty() {
                break;
            }
            let mut cursor = Cursor::new(&buf[..]);
            match rmpv::decode::read_value(&mut cursor) {
                Ok(value) => {
                    let consumed = cursor.position() as usize;
                    buf.advance(consumed);
                    let Some((msgid, method, params)) = parse_request(value) else {
                        debug!("dropping connection on malformed rpc frame");
                        return;
                    };
                    let forward = Arc::clone(&forward);
                    let request_log = Arc::clone(&request_log);
                    let writer = Arc::clone(&writer);
                    tokio::spawn(async move {
                        let (err, result) =
                            handle_request(&forward, &request_log, &method, params).await;
                        write_response(&writer, msgid, err, result).await;
                    });
                }
                Err(ref e) if is_truncated(e) => break,
                Err(e) => {
                    debug!(error = %e, "malformed rpc stream");
                    return;
                }
            }
        }
        let mut chunk = [0u8; READ_CHUNK];
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = read_half.read(&mut chunk) => read,
        };
        match read {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn is_truncated(e: &rmpv::decode::Error) -> bool {
    match e {
        rmpv::decode::Error::InvalidMarkerRead(io) | rmpv::decode::Error::InvalidDataRead(io) => {
            io.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

fn parse_request(value: Value) -> Option<(u32, String, Value)> {
    let Value::Array(mut items) = value else {
        return None;
    };
    if items.len() != 4 {
        return None;
    }
    let params = items.pop().expect("length checked above");
    let method_value = items.pop().expect("length checked above");
    let method = method_value.as_str()?.to_string();
    if items[0].as_u64() != Some(RPC_REQUEST) {
        return None;
    }
    let msgid = items[1].as_u64().and_then(|v| u32::try_from(v).ok())?;
    Some((msgid, method, params))
}

async fn write_response(
    writer: &Mutex<OwnedWriteHalf>,
    msgid: u32,
    err: Option<String>,
    result: Value,
) {
    let frame = Value::Array(vec![
        Value::from(RPC_RESPONSE),
        Value::from(msgid),
        err.map(Value::from).unwrap_or(Value::Nil),
        result,
    ]);
    let mut out = Vec::new();
    if rmpv::encode::write_value(&mut out, &frame).is_err() {
        return;
    }
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write_all(&out).await {
        debug!(error = %e, "rpc response write failed");
    }
}

async fn handle_request(
    forward: &Arc<ForwardManager>,
    request_log: &Arc<RequestLog>,
    method: &str,
    params: Value,
) -> (Option<String>, Value) {
    if method == METHOD_TEST {
        return (None, Value::from(true));
    }
    if method == METHOD_CALL_SERVICES {
        let Some(reqs) = parse_services_params(&params) else {
            return (Some(ERR_ARGUMENT.to_string()), Value::Nil);
        };
        let id = request_log.start_call();
        let rsps = forward.call_services(id, reqs, false).await;
        request_log.end_call(id);
        return (None, render_services_rsp(&rsps));
    }
    if let Some(rest) = method.strip_prefix(METHOD_CALL_SINGLE) {
        let Some(rest) = rest.strip_prefix('/') else {
            return (Some(ERR_NO_METHOD.to_string()), Value::Nil);
        };
        let Some((service, api)) = rest.split_once('/') else {
            return (Some(ERR_ARGUMENT.to_string()), Value::Nil);
        };
        let mut packed = Vec::new();
        if rmpv::encode::write_value(&mut packed, &params).is_err() {
            return (Some(ERR_ARGUMENT.to_string()), Value::Nil);
        }
        let req = ServiceCallReq {
            service_name: service.to_string(),
            service_api: api.to_string(),
            service_req_data: Bytes::from(packed),
            service_cluster: DEFAULT_CLUSTER.to_string(),
            service_type: ServiceType::Rpc,
            ..Default::default()
        };
        let id = request_log.start_call();
        let rsps = forward.call_services(id, vec![req], false).await;
        request_log.end_call(id);
        if rsps.len() != 1 {
            return (Some(ERR_SERVER_RETURN.to_string()), Value::Nil);
        }
        let rsp = &rsps[0];
        if !rsp.error.is_empty() {
            return (Some(rsp.error.clone()), Value::Nil);
        }
        return match rmpv::decode::read_value(&mut &rsp.rsp[..]) {
            Ok(value) => (None, value),
            Err(e) => (Some(e.to_string()), Value::Nil),
        };
    }
    (Some(ERR_NO_METHOD.to_string()), Value::Nil)
}

/// Params of `call_services_async`: a tuple holding `RpcServicesReq`, i.e.
/// `[[row, row, …]]` where each row is
/// `[name, api, method, data, cluster, type, enable_cache]`.
fn parse_services_params(params: &Value) -> Option<Vec<ServiceCallReq>> {
    let outer = params.as_array()?;
    let req_struct = outer.first()?.as_array()?;
    let rows = req_struct.first()?.as_array()?;
    let mut reqs = Vec::with_capacity(rows.len());
    for row in rows {
        let fields = row.as_array()?;
        if fields.len() < 7 {
            return None;
        }
        let data = match &fields[3] {
            Value::String(s) => Bytes::copy_from_slice(s.as_bytes()),
            Value::Binary(b) => Bytes::copy_from_slice(b),
            _ => return None,
        };
        reqs.push(ServiceCallReq {
            service_name: fields[0].as_str()?.to_string(),
            service_api: fields[1].as_str()?.to_string(),
            method: HttpMethod::from_u32(fields[2].as_u64()? as u32),
            service_req_data: data,
            service_cluster: {
                let cluster = fields[4].as_str()?.to_string();
                if cluster.is_empty() {
                    DEFAULT_CLUSTER.to_string()
                } else {
                    cluster
                }
            },
            service_type: ServiceType::from_u32(fields[5].as_u64()? as u32)?,
            enable_cache: fields[6].as_bool()?,
        });
    }
    Some(reqs)
}

/// `RpcServicesRsp`: `[[row, row, …]]` where each row is
/// `[service_name, rsp, error, is_cached, host, port]`.
fn render_services_rsp(rsps: &[ServiceCallRsp]) -> Value {
    let rows: Vec<Value> = rsps
        .iter()
        .map(|rsp| {
            Value::Array(vec![
                Value::from(rsp.service_name.as_str()),
                Value::Binary(rsp.rsp.to_vec()),
                Value::from(rsp.error.as_str()),
                Value::from(rsp.is_cached),
                Value::from(rsp.host.as_str()),
                Value::from(rsp.port.as_str()),
            ])
        })
        .collect();
    Value::Array(vec![Value::Array(rows)])
}
