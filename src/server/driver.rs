//! Length-framed binary front end (the driver protocol).
//!
//! Each request is an 8-byte header — 32-bit big-endian sequence, 32-bit
//! big-endian payload size — followed by a JSON payload whose `header`
//! object names the controller and action. Sequence 0 or payload size 0
//! closes the connection; an oversized payload answers "Size exceeds
//! limit." and closes. Responses mirror the request framing and sequence.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FibpError, Result};
use crate::server::router::{ControllerRequest, ControllerResponse, DriverRouter};
use crate::types::HttpMethod;

/// Payload ceiling on the driver protocol.
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 8;

/// The driver-protocol acceptor.
pub struct DriverServer {
    listener: TcpListener,
    router: Arc<DriverRouter>,
    cancel: CancellationToken,
}

impl DriverServer {
    pub async fn bind(
        port: u16,
        router: Arc<DriverRouter>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| FibpError::Listen { addr, source })?;
        info!(port, "driver server listening");
        Ok(DriverServer {
            listener,
            router,
            cancel,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Accept loop; each connection gets its own task.
    pub async fn run(self) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, _peer)) => {
                    let router = Arc::clone(&self.router);
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        serve_connection(socket, router, cancel).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "driver accept failed");
                    break;
                }
            }
        }
        debug!("driver accept loop exited");
    }
}

async fn serve_connection(
    mut socket: TcpStream,
    router: Arc<DriverRouter>,
    cancel: CancellationToken,
) {
    loop {
        let mut header = [0u8; HEADER_LEN];
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = socket.read_exact(&mut header) => read,
        };
        if read.is_err() {
            break;
        }
        let sequence = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let payload_size =
            u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if sequence == 0 || payload_size == 0 {
            info!("shutdown since received sequence 0");
            break;
        }
        if payload_size > MAX_PAYLOAD {
            let _ = write_error(&mut socket, sequence, "Size exceeds limit.").await;
            break;
        }
        let mut payload = vec![0u8; payload_size];
        if let Err(e) = socket.read_exact(&mut payload).await {
            let _ = write_error(&mut socket, sequence, &e.to_string()).await;
            break;
        }
        let rsp = handle_payload(&router, Bytes::from(payload)).await;
        let body = rsp
            .raw
            .unwrap_or_else(|| Bytes::from(rsp.value.to_string()));
        if let Err(e) = write_frame(&mut socket, sequence, &body).await {
            warn!(error = %e, "write response failed");
            break;
        }
    }
    debug!("driver connection closed");
}

async fn handle_payload(router: &DriverRouter, payload: Bytes) -> ControllerResponse {
    let parsed: Value = match serde_json::from_slice(&payload) {
        Ok(v) => v,
        Err(e) => return ControllerResponse::error(format!("malformed request: {e}")),
    };
    if !parsed.is_object() {
        return ControllerResponse::error("Malformed request: require an object as input.");
    }
    let header = parsed.get("header");
    let controller = header
        .and_then(|h| h.get("controller"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let action = header
        .and_then(|h| h.get("action"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let path = header
        .and_then(|h| h.get("path"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("/{controller}/{action}"));
    let method = header
        .and_then(|h| h.get("method"))
        .and_then(Value::as_str)
        .map(HttpMethod::from_name)
        .unwrap_or(HttpMethod::Post);
    router
        .dispatch(ControllerRequest {
            controller,
            action,
            path,
            method,
            body: payload,
        })
        .await
}

async fn write_frame(socket: &mut TcpStream, sequence: u32, body: &[u8]) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&sequence.to_be_bytes());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    socket.write_all(&frame).await
}

async fn write_error(socket: &mut TcpStream, sequence: u32, message: &str) -> std::io::Result<()> {
    let rsp = ControllerResponse::error(message);
    write_frame(socket, sequence, rsp.value.to_string().as_bytes()).await
}
