//! Two-phase confirm/cancel compensation for transactional batches.
//!
//! A peer that took part in a transaction reports its transaction id inside
//! the response body as a `"transaction_id":"…"` literal. Extraction is a
//! plain substring scan, not JSON parsing, so an id embedded inside a larger
//! string would also match; the behavior is kept wire-compatible with the
//! deployed gateways.

use tracing::info;

use crate::client::ClientPool;
use crate::types::HttpMethod;

const TRAN_KEY: &[u8] = b"\"transaction_id\"";
/// The opening quote of the value must appear within this many bytes of the
/// key.
const VALUE_SEARCH_WINDOW: usize = 10;
/// Maximum length of a transaction id.
const MAX_ID_LEN: usize = 128;

const TRANSACTION_TIMEOUT_MS: u64 = 10 * 1_000;

/// Extracts the first `"transaction_id":"…"` value from `payload`, if any.
pub fn extract_transaction_id(payload: &[u8]) -> Option<String> {
    let key_pos = find(payload, TRAN_KEY, 0)?;
    let after_key = key_pos + TRAN_KEY.len();
    let open = find_byte(payload, b'"', after_key, VALUE_SEARCH_WINDOW)?;
    let close = find_byte(payload, b'"', open + 1, MAX_ID_LEN + 1)?;
    let id = &payload[open + 1..close];
    Some(String::from_utf8_lossy(id).into_owned())
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn find_byte(haystack: &[u8], byte: u8, from: usize, window: usize) -> Option<usize> {
    let end = haystack.len().min(from.saturating_add(window));
    if from >= end {
        return None;
    }
    haystack[from..end].iter().position(|&b| b == byte).map(|p| p + from)
}

/// Issues confirm/cancel compensations against transactional peers.
#[derive(Default)]
pub struct TransactionManager;

impl TransactionManager {
    pub fn new() -> Self {
        TransactionManager
    }

    /// See [`extract_transaction_id`].
    pub fn get_transaction_id(&self, payload: &[u8]) -> Option<String> {
        extract_transaction_id(payload)
    }

    pub async fn confirm(
        &self,
        pool: &ClientPool,
        host: &str,
        port: &str,
        api: &str,
        tran_id: &str,
    ) -> bool {
        self.send_transaction_api(pool, host, port, api, tran_id, "/confirm")
            .await
    }

    pub async fn cancel(
        &self,
        pool: &ClientPool,
        host: &str,
        port: &str,
        api: &str,
        tran_id: &str,
    ) -> bool {
        self.send_transaction_api(pool, host, port, api, tran_id, "/cancel")
            .await
    }

    async fn send_transaction_api(
        &self,
        pool: &ClientPool,
        host: &str,
        port: &str,
        api: &str,
        tran_id: &str,
        action: &str,
    ) -> bool {
        let body = format!("{{\"transaction_id\":\"{tran_id}\"}}");
        let path = format!("{api}{action}");
        let client = pool
            .send_http_request(
                &path,
                HttpMethod::Post,
                host,
                port,
                body.into(),
                TRANSACTION_TIMEOUT_MS,
            )
            .await;
        let Some(client) = client else {
            info!(api, action, tran_id, "transaction message: send failed");
            return false;
        };
        let (result, _) = pool.get_http_response(client).await;
        match result {
            Ok(_) => {
                info!(api, action, tran_id, success = true, "transaction message");
                true
            }
            Err(msg) => {
                info!(api, action, tran_id, success = false, error = %msg, "transaction message");
                false
            }
        }
    }
}
