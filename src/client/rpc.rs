//! Msgpack-RPC upstream client.
//!
//! One client multiplexes any number of concurrent calls over a single
//! socket. Requests are 4-element arrays `[0, msgid, method, params]` with a
//! monotonically assigned 32-bit msgid; a single reader task (spawned on the
//! first outstanding request) decodes `[1, msgid, err, result]` frames and
//! completes the matching future. Any read or decode failure tears the
//! session down and fails every outstanding future with `can_retry` set.

use std::io::{self, Cursor};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::client::future::{CallOutcome, ClientFuture, PendingCalls};
use crate::client::session::ClientSession;

/// Error body used when a response exceeds the message ceiling.
pub const SERVER_RSP_TOO_LARGE_ERR: &str = "Server Response Too Large.";

/// Per-message ceiling for RPC responses.
const MAX_RPC_MESSAGE: usize = 10 * 1024 * 1024;

const READ_CHUNK: usize = 32 * 1024;

const RPC_REQUEST: u64 = 0;
const RPC_RESPONSE: u64 = 1;

/// Msgpack-RPC client bound to one upstream `host:port`.
pub struct RpcClient {
    session: Mutex<ClientSession>,
    next_id: AtomicU32,
    pending: Arc<PendingCalls>,
    reader_running: AtomicBool,
}

impl RpcClient {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Arc<Self> {
        Arc::new(RpcClient {
            session: Mutex::new(ClientSession::new(host, port)),
            next_id: AtomicU32::new(0),
            pending: Arc::new(PendingCalls::default()),
            reader_running: AtomicBool::new(false),
        })
    }

    /// Sends one call. `params` must already be msgpack-encoded; an empty
    /// slice is sent as nil. Returns `None` when the request could not be
    /// written (the caller treats that as a retryable send failure).
    pub async fn send_request(
        self: &Arc<Self>,
        method: &str,
        params: &[u8],
        timeout_ms: u64,
    ) -> Option<ClientFuture> {
        let msgid = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let frame = match encode_request(msgid, method, params) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "encoding rpc request failed");
                return None;
            }
        };

        let (future, tx) = ClientFuture::new(msgid, timeout_ms);
        self.pending.insert(msgid, tx);

        let mut session = self.session.lock().await;
        session.set_timeout(timeout_ms * 2, timeout_ms);
        if let Err(e) = session.send_data(&frame).await {
            debug!(error = %e, msgid, "rpc send failed");
            self.pending.remove(msgid);
            return None;
        }
        if !self.reader_running.swap(true, Ordering::AcqRel) {
            match session.take_read_half() {
                Some(read_half) => {
                    let client = Arc::clone(self);
                    tokio::spawn(async move {
                        client.run_reader(read_half).await;
                    });
                }
                None => {
                    // Session closed between write and split; fail fast.
                    self.reader_running.store(false, Ordering::Release);
                    self.pending.remove(msgid);
                    return None;
                }
            }
        }
        Some(future)
    }

    async fn run_reader(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let failure: String = 'read: loop {
            loop {
                if buf.is_empty() {
                    break;
                }
                let mut cursor = Cursor::new(&buf[..]);
                match rmpv::decode::read_value(&mut cursor) {
                    Ok(value) => {
                        let consumed = cursor.position() as usize;
                        buf.advance(consumed);
                        if let Err(msg) = self.handle_response(value) {
                            break 'read msg;
                        }
                    }
                    Err(ref e) if is_truncated(e) => break,
                    Err(e) => break 'read format!("malformed rpc response: {e}"),
                }
            }
            if buf.len() > MAX_RPC_MESSAGE {
                error!(buffered = buf.len(), "rpc message response too large");
                break SERVER_RSP_TOO_LARGE_ERR.to_string();
            }
            let mut chunk = [0u8; READ_CHUNK];
            match read_half.read(&mut chunk).await {
                Ok(0) => break "connection closed by server".to_string(),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => break e.to_string(),
            }
        };
        debug!(error = %failure, "rpc reader stopped");
        drop(read_half);
        self.session.lock().await.shutdown(true);
        self.pending.fail_all(&failure);
        self.reader_running.store(false, Ordering::Release);
    }

    /// Dispatches one decoded response frame. A malformed frame is fatal to
    /// the session.
    fn handle_response(&self, value: rmpv::Value) -> Result<(), String> {
        let rmpv::Value::Array(items) = value else {
            return Err("rpc response is not an array".to_string());
        };
        if items.len() != 4 {
            return Err(format!("rpc response has {} elements", items.len()));
        }
        let kind = items[0].as_u64();
        if kind != Some(RPC_RESPONSE) {
            return Err(format!("unexpected rpc frame type: {:?}", items[0]));
        }
        let Some(msgid) = items[1].as_u64().and_then(|v| u32::try_from(v).ok()) else {
            return Err("rpc response msgid is not a u32".to_string());
        };
        let err = &items[2];
        let outcome = if err.is_nil() {
            let mut packed = Vec::new();
            rmpv::encode::write_value(&mut packed, &items[3])
                .map_err(|e| format!("repacking rpc result failed: {e}"))?;
            CallOutcome::success(Bytes::from(packed))
        } else {
            let message = match err.as_str() {
                Some(s) => s.to_string(),
                None => err.to_string(),
            };
            CallOutcome::failure(message, false)
        };
        self.pending.complete(msgid, outcome);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

fn enc_err<E: std::fmt::Display>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

fn encode_request(msgid: u32, method: &str, params: &[u8]) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(16 + method.len() + params.len());
    rmp::encode::write_array_len(&mut buf, 4).map_err(enc_err)?;
    rmp::encode::write_uint(&mut buf, RPC_REQUEST).map_err(enc_err)?;
    rmp::encode::write_uint(&mut buf, u64::from(msgid)).map_err(enc_err)?;
    rmp::encode::write_str(&mut buf, method).map_err(enc_err)?;
    if params.is_empty() {
        rmp::encode::write_nil(&mut buf).map_err(enc_err)?;
    } else {
        buf.extend_from_slice(params);
    }
    Ok(buf)
}

/// True when the decode failed only because the buffer ends mid-value.
fn is_truncated(e: &rmpv::decode::Error) -> bool {
    match e {
        rmpv::decode::Error::InvalidMarkerRead(io) | rmpv::decode::Error::InvalidDataRead(io) => {
            io.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn encode_response(msgid: u32, err: rmpv::Value, result: rmpv::Value) -> Vec<u8> {
        let mut out = Vec::new();
        rmpv::encode::write_value(
            &mut out,
            &rmpv::Value::Array(vec![
                rmpv::Value::from(RPC_RESPONSE),
                rmpv::Value::from(msgid),
                err,
                result,
            ]),
        )
        .unwrap();
        out
    }

    /// Reads until `count` complete msgpack values have arrived.
    async fn read_requests(sock: &mut tokio::net::TcpStream, count: usize) {
        let mut buf = Vec::new();
        loop {
            let mut seen = 0;
            let mut cursor = Cursor::new(&buf[..]);
            while rmpv::decode::read_value(&mut cursor).is_ok() {
                seen += 1;
            }
            if seen >= count {
                return;
            }
            let mut chunk = [0u8; 4096];
            let n = sock.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed before sending all requests");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn matches_responses_by_msgid_out_of_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            // Consume both requests, then answer in reverse order.
            read_requests(&mut sock, 2).await;
            let mut out = encode_response(2, rmpv::Value::Nil, rmpv::Value::from("second"));
            out.extend(encode_response(1, rmpv::Value::Nil, rmpv::Value::from("first")));
            sock.write_all(&out).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });

        let client = RpcClient::new(addr.ip().to_string(), addr.port().to_string());
        let f1 = client.send_request("a", &[], 2_000).await.unwrap();
        let f2 = client.send_request("b", &[], 2_000).await.unwrap();
        assert_eq!(f1.id(), 1);
        assert_eq!(f2.id(), 2);

        let r1 = f1.wait().await;
        let r2 = f2.wait().await;
        assert!(r1.is_success && r2.is_success);
        let v1: rmpv::Value = rmpv::decode::read_value(&mut &r1.body[..]).unwrap();
        assert_eq!(v1.as_str(), Some("first"));
        let v2: rmpv::Value = rmpv::decode::read_value(&mut &r2.body[..]).unwrap();
        assert_eq!(v2.as_str(), Some("second"));
    }

    #[tokio::test]
    async fn server_error_field_fails_the_call_without_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            read_requests(&mut sock, 1).await;
            let out = encode_response(1, rmpv::Value::from("error_test_msg"), rmpv::Value::Nil);
            sock.write_all(&out).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });

        let client = RpcClient::new(addr.ip().to_string(), addr.port().to_string());
        let f = client.send_request("broken", &[], 2_000).await.unwrap();
        let out = f.wait().await;
        assert!(!out.is_success);
        assert!(!out.can_retry);
        assert_eq!(out.body.as_ref(), b"error_test_msg");
    }

    #[tokio::test]
    async fn disconnect_fails_all_outstanding_futures() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            read_requests(&mut sock, 2).await;
            // Close without answering.
            drop(sock);
        });

        let client = RpcClient::new(addr.ip().to_string(), addr.port().to_string());
        let f1 = client.send_request("x", &[], 2_000).await.unwrap();
        let f2 = client.send_request("y", &[], 2_000).await.unwrap();
        let (r1, r2) = (f1.wait().await, f2.wait().await);
        assert!(!r1.is_success && !r2.is_success);
        assert!(r1.can_retry && r2.can_retry);
        assert_eq!(client.outstanding(), 0);
    }
}
