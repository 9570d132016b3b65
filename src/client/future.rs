//! One-shot result slots for in-flight RPC and raw requests.
//!
//! A future is created when a request frame is written and completed exactly
//! once: either by the client's reader task matching the wire sequence, or
//! by its own deadline. The deadline result is the fixed "Server Timed Out."
//! reply with `can_retry` set.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

/// Reply body used when a future's deadline fires first.
pub const TIMEOUT_ERR: &str = "Server Timed Out.";

/// Final outcome of one outstanding request.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub body: Bytes,
    pub is_success: bool,
    pub can_retry: bool,
}

impl CallOutcome {
    pub fn success(body: Bytes) -> Self {
        CallOutcome {
            body,
            is_success: true,
            can_retry: false,
        }
    }

    pub fn failure(message: impl Into<Bytes>, can_retry: bool) -> Self {
        CallOutcome {
            body: message.into(),
            is_success: false,
            can_retry,
        }
    }

    fn timed_out() -> Self {
        CallOutcome {
            body: Bytes::from_static(TIMEOUT_ERR.as_bytes()),
            is_success: false,
            can_retry: true,
        }
    }
}

/// Caller-side handle to one outstanding request.
pub struct ClientFuture {
    id: u32,
    timeout: Duration,
    rx: oneshot::Receiver<CallOutcome>,
}

impl ClientFuture {
    pub fn new(id: u32, timeout_ms: u64) -> (Self, oneshot::Sender<CallOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            ClientFuture {
                id,
                timeout: Duration::from_millis(timeout_ms),
                rx,
            },
            tx,
        )
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Waits for the result or the deadline, whichever comes first. Consumes
    /// the future; it resolves exactly once.
    pub async fn wait(self) -> CallOutcome {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without a result: the reader tore down without
            // completing us; treat like a timeout so the caller may retry.
            Ok(Err(_)) => CallOutcome::timed_out(),
            Err(_) => CallOutcome::timed_out(),
        }
    }
}

/// Wire-sequence → pending future table shared between a client's send path
/// and its reader task.
#[derive(Default)]
pub struct PendingCalls {
    inner: Mutex<HashMap<u32, oneshot::Sender<CallOutcome>>>,
}

impl PendingCalls {
    pub fn insert(&self, id: u32, tx: oneshot::Sender<CallOutcome>) {
        self.inner.lock().expect("pending table poisoned").insert(id, tx);
    }

    pub fn remove(&self, id: u32) {
        self.inner.lock().expect("pending table poisoned").remove(&id);
    }

    /// Completes the future registered under `id`, if any.
    pub fn complete(&self, id: u32, outcome: CallOutcome) {
        let tx = self.inner.lock().expect("pending table poisoned").remove(&id);
        if let Some(tx) = tx {
            let _ = tx.send(outcome);
        }
    }

    /// Completes every outstanding future with `message` and `can_retry`,
    /// draining the table. Used when the session tears down.
    pub fn fail_all(&self, message: &str) {
        let drained: Vec<_> = {
            let mut map = self.inner.lock().expect("pending table poisoned");
            map.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(CallOutcome::failure(message.to_string(), true));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_with_the_set_result() {
        let (future, tx) = ClientFuture::new(1, 1_000);
        tx.send(CallOutcome::success(Bytes::from_static(b"ok"))).unwrap();
        let out = future.wait().await;
        assert!(out.is_success);
        assert_eq!(out.body.as_ref(), b"ok");
    }

    #[tokio::test]
    async fn deadline_yields_timeout_reply() {
        let (future, _tx) = ClientFuture::new(2, 10);
        let out = future.wait().await;
        assert!(!out.is_success);
        assert!(out.can_retry);
        assert_eq!(out.body.as_ref(), TIMEOUT_ERR.as_bytes());
    }

    #[tokio::test]
    async fn fail_all_completes_every_outstanding_future() {
        let pending = PendingCalls::default();
        let (f1, t1) = ClientFuture::new(1, 1_000);
        let (f2, t2) = ClientFuture::new(2, 1_000);
        pending.insert(1, t1);
        pending.insert(2, t2);
        pending.fail_all("connection reset");
        for f in [f1, f2] {
            let out = f.wait().await;
            assert!(!out.is_success);
            assert!(out.can_retry);
            assert_eq!(out.body.as_ref(), b"connection reset");
        }
        assert!(pending.is_empty());
    }
}
