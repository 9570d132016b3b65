//! Length-framed raw upstream client.
//!
//! Wire format, both directions: 4-byte big-endian sequence, 4-byte
//! big-endian payload length, payload. Correlation and the single reader
//! task follow the same pattern as the msgpack-RPC client; there is no
//! message-size ceiling here.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::Mutex;
use tracing::debug;

use crate::client::future::{CallOutcome, ClientFuture, PendingCalls};
use crate::client::session::ClientSession;

const FRAME_HEADER: usize = 8;

/// Raw length-framed client bound to one upstream `host:port`.
pub struct RawClient {
    session: Mutex<ClientSession>,
    next_id: AtomicU32,
    pending: Arc<PendingCalls>,
    reader_running: AtomicBool,
}

impl RawClient {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Arc<Self> {
        Arc::new(RawClient {
            session: Mutex::new(ClientSession::new(host, port)),
            next_id: AtomicU32::new(0),
            pending: Arc::new(PendingCalls::default()),
            reader_running: AtomicBool::new(false),
        })
    }

    /// Frames and writes one request. Returns `None` when the write fails;
    /// the caller treats that as a retryable send failure.
    pub async fn send_request(
        self: &Arc<Self>,
        payload: &[u8],
        timeout_ms: u64,
    ) -> Option<ClientFuture> {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let mut frame = BytesMut::with_capacity(FRAME_HEADER + payload.len());
        frame.extend_from_slice(&seq.to_be_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);

        let (future, tx) = ClientFuture::new(seq, timeout_ms);
        self.pending.insert(seq, tx);

        let mut session = self.session.lock().await;
        session.set_timeout(timeout_ms * 2, timeout_ms);
        if let Err(e) = session.send_data(&frame).await {
            debug!(error = %e, seq, "raw send failed");
            self.pending.remove(seq);
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
                    self.reader_running.store(false, Ordering::Release);
                    self.pending.remove(seq);
                    return None;
                }
            }
        }
        Some(future)
    }

    async fn run_reader(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        let failure: String = loop {
            let mut header = [0u8; FRAME_HEADER];
            if let Err(e) = read_half.read_exact(&mut header).await {
                break e.to_string();
            }
            let seq = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
            let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
            let mut body = vec![0u8; len];
            if let Err(e) = read_half.read_exact(&mut body).await {
                break e.to_string();
            }
            self.pending
                .complete(seq, CallOutcome::success(Bytes::from(body)));
        };
        debug!(error = %failure, "raw reader stopped");
        drop(read_half);
        self.session.lock().await.shutdown(true);
        self.pending.fail_all(&failure);
        self.reader_running.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.pending.len()
    }
}
