//! Per-destination client pooling.
//!
//! Keyed by `host:port`. HTTP clients are exclusive for one exchange, so the
//! pool keeps a LIFO idle stack per destination and hands one out per
//! send/receive; creation is capped at 100 clients per destination. RPC and
//! raw clients multiplex concurrent calls over one socket, so a single
//! long-lived client per destination is shared.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::client::future::ClientFuture;
use crate::client::http::HttpClient;
use crate::client::raw::RawClient;
use crate::client::rpc::RpcClient;
use crate::types::{HttpMethod, ServiceType};

/// Per-destination ceiling on created HTTP clients.
pub const MAX_CLIENTS_PER_DEST: usize = 100;

fn client_id(host: &str, port: &str) -> String {
    format!("{host}:{port}")
}

/// Process-wide client pool shared by all workers.
#[derive(Default)]
pub struct ClientPool {
    http_idle: DashMap<String, Vec<HttpClient>>,
    http_created: DashMap<String, usize>,
    rpc_clients: DashMap<String, Arc<RpcClient>>,
    raw_clients: DashMap<String, Arc<RawClient>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops an idle HTTP client for the destination or creates one under the
    /// cap. `None` means the destination is saturated.
    pub fn checkout_http(&self, host: &str, port: &str) -> Option<HttpClient> {
        let id = client_id(host, port);
        if let Some(mut idle) = self.http_idle.get_mut(&id) {
            if let Some(client) = idle.pop() {
                return Some(client);
            }
        }
        let mut created = self.http_created.entry(id.clone()).or_insert(0);
        if *created >= MAX_CLIENTS_PER_DEST {
            warn!(dest = %id, "connections to the destination exceed the limit");
            return None;
        }
        *created += 1;
        if *created > 3 {
            info!(dest = %id, connections = *created, "client created connections");
        }
        Some(HttpClient::new(host, port))
    }

    /// Returns a checked-out HTTP client to its destination's idle stack.
    pub fn return_http(&self, client: HttpClient) {
        let id = client_id(client.host(), client.port());
        self.http_idle.entry(id).or_default().push(client);
    }

    /// Checkout + send in one step. On send failure the client goes back to
    /// the pool and the caller sees `None` (a retryable send failure).
    pub async fn send_http_request(
        &self,
        path: &str,
        method: HttpMethod,
        host: &str,
        port: &str,
        body: Bytes,
        timeout_ms: u64,
    ) -> Option<HttpClient> {
        let mut client = self.checkout_http(host, port)?;
        match client.send_request(path, method, body, timeout_ms).await {
            Ok(()) => Some(client),
            Err(_) => {
                self.return_http(client);
                None
            }
        }
    }

    /// Reads the response on a checked-out client and returns the client to
    /// the pool. The bool is the client's retry verdict for failures.
    pub async fn get_http_response(&self, mut client: HttpClient) -> (Result<Bytes, String>, bool) {
        let result = client.get_response().await;
        let can_retry = client.can_retry();
        self.return_http(client);
        (result, can_retry)
    }

    /// Dispatches one RPC or raw request over the destination's shared
    /// multiplexing client. HTTP is not valid here.
    pub async fn send_request(
        &self,
        service_type: ServiceType,
        api: &str,
        host: &str,
        port: &str,
        body: &[u8],
        timeout_ms: u64,
    ) -> Option<ClientFuture> {
        let id = client_id(host, port);
        match service_type {
            ServiceType::Rpc => {
                let client = {
                    let entry = self
                        .rpc_clients
                        .entry(id)
                        .or_insert_with(|| RpcClient::new(host, port));
                    Arc::clone(entry.value())
                };
                client.send_request(api, body, timeout_ms).await
            }
            ServiceType::Raw => {
                let client = {
                    let entry = self
                        .raw_clients
                        .entry(id)
                        .or_insert_with(|| RawClient::new(host, port));
                    Arc::clone(entry.value())
                };
                client.send_request(body, timeout_ms).await
            }
            ServiceType::Http | ServiceType::Custom => {
                warn!(service_type = ?service_type, "no multiplexing client for service type");
                None
            }
        }
    }

    /// Drops every pooled client. Used on gateway stop.
    pub fn clear(&self) {
        self.http_idle.clear();
        self.http_created.clear();
        self.rpc_clients.clear();
        self.raw_clients.clear();
    }
}
