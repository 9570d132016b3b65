//! The fan-out/aggregation orchestrator.
//!
//! Receives a batch of service calls, resolves each against the routing
//! table, dispatches them concurrently through the client pool, aggregates
//! responses in request order, retries transient failures, consults the
//! response cache, and optionally runs the confirm/cancel transaction step.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::info;

use crate::cache::ServiceCache;
use crate::client::ClientPool;
use crate::discovery::RoutingTable;
use crate::portforward::PortForwardManager;
use crate::request_log::RequestLog;
use crate::runtime::TaskPool;
use crate::transaction::TransactionManager;
use crate::types::{ForwardInfo, ServiceCallReq, ServiceCallRsp, ServiceType};

const MAX_RETRY: u32 = 3;
/// Per-attempt timeout: `attempt * 5000` ms.
const RETRY_TIMEOUT_STEP_MS: u64 = 5_000;

const LOCAL_TEST: &str = "local_test";

const ERR_SERVICE_NOT_FOUND: &str = "Service Not Found.";
const ERR_SEND_FAILED: &str = "Send Service Request Failed. ";
const ERR_RSP_FAILED_PREFIX: &str = "Get Service Response Failed. ";
const ERR_TRANSACTION_REJECT: &str =
    "transaction is supported only if all services using http protocol.";

/// Orchestrates upstream calls. One instance per gateway, shared by all
/// front ends.
pub struct ForwardManager {
    pool: Arc<ClientPool>,
    table: Arc<RoutingTable>,
    cache: Arc<ServiceCache>,
    transactions: TransactionManager,
    tasks: TaskPool,
    request_log: Arc<RequestLog>,
    forwards: Arc<PortForwardManager>,
    fail_stat: DashMap<String, u64>,
}

impl ForwardManager {
    pub fn new(
        pool: Arc<ClientPool>,
        table: Arc<RoutingTable>,
        cache: Arc<ServiceCache>,
        tasks: TaskPool,
        request_log: Arc<RequestLog>,
        forwards: Arc<PortForwardManager>,
    ) -> Arc<Self> {
        Arc::new(ForwardManager {
            pool,
            table,
            cache,
            transactions: TransactionManager::new(),
            tasks,
            request_log,
            forwards,
            fail_stat: DashMap::new(),
        })
    }

    /// Calls every request in the batch. Responses come back in request
    /// order; a failed upstream never fails the batch, it fails its row.
    pub async fn call_services(
        self: &Arc<Self>,
        id: u64,
        reqs: Vec<ServiceCallReq>,
        do_transaction: bool,
    ) -> Vec<ServiceCallRsp> {
        if do_transaction {
            let all_http = reqs.iter().all(|r| r.service_type == ServiceType::Http);
            if !all_http {
                return reqs
                    .iter()
                    .map(|r| ServiceCallRsp {
                        service_name: r.service_name.clone(),
                        error: ERR_TRANSACTION_REJECT.to_string(),
                        ..Default::default()
                    })
                    .collect();
            }
        }

        let mut rsps: Vec<ServiceCallRsp>;
        if reqs.len() == 1 {
            rsps = vec![self.call_single(id, &reqs[0]).await];
        } else {
            let mut handles = Vec::with_capacity(reqs.len());
            for req in &reqs {
                let this = Arc::clone(self);
                let req = req.clone();
                handles.push(
                    self.tasks
                        .spawn(async move { this.call_single(id, &req).await })
                        .await,
                );
            }
            rsps = Vec::with_capacity(reqs.len());
            for (handle, req) in handles.into_iter().zip(&reqs) {
                let rsp = match handle {
                    Ok(handle) => handle.await.unwrap_or_else(|_| ServiceCallRsp {
                        service_name: req.service_name.clone(),
                        error: format!("{ERR_RSP_FAILED_PREFIX}dispatch task failed"),
                        ..Default::default()
                    }),
                    Err(_) => ServiceCallRsp {
                        service_name: req.service_name.clone(),
                        error: ERR_SEND_FAILED.to_string(),
                        ..Default::default()
                    },
                };
                rsps.push(rsp);
            }
        }

        if do_transaction {
            self.settle_transaction(&reqs, &rsps).await;
        }
        rsps
    }

    /// All-succeed ⇒ confirm-all, any-fail ⇒ cancel-all. Ids are extracted
    /// from the response body, or from the error text of a failed row.
    async fn settle_transaction(&self, reqs: &[ServiceCallReq], rsps: &[ServiceCallRsp]) {
        let mut need_cancel = false;
        let mut tran_ids: Vec<Option<String>> = Vec::with_capacity(rsps.len());
        for rsp in rsps {
            if !rsp.error.is_empty() {
                need_cancel = true;
                tran_ids.push(self.transactions.get_transaction_id(rsp.error.as_bytes()));
            } else {
                tran_ids.push(self.transactions.get_transaction_id(&rsp.rsp));
            }
        }
        for ((req, rsp), tran_id) in reqs.iter().zip(rsps).zip(&tran_ids) {
            if need_cancel {
                let Some(tran_id) = tran_id else {
                    continue;
                };
                self.transactions
                    .cancel(&self.pool, &rsp.host, &rsp.port, &req.service_api, tran_id)
                    .await;
            } else {
                self.transactions
                    .confirm(
                        &self.pool,
                        &rsp.host,
                        &rsp.port,
                        &req.service_api,
                        tran_id.as_deref().unwrap_or(""),
                    )
                    .await;
            }
        }
    }

    /// One upstream call with the retry ladder: up to three attempts with a
    /// 5 s/10 s/15 s timeout, round-robin node choice seeded randomly.
    pub async fn call_single(&self, id: u64, req: &ServiceCallReq) -> ServiceCallRsp {
        let mut rsp = ServiceCallRsp {
            service_name: req.service_name.clone(),
            ..Default::default()
        };
        if req.service_name == LOCAL_TEST {
            self.request_log
                .send_service_request(id, &req.service_name, "127.0.0.1", "0");
            rsp.rsp = Bytes::from_static(LOCAL_TEST.as_bytes());
            self.request_log.got_service_reply(id, &req.service_name);
            return rsp;
        }

        let mut balance: usize = rand::random();
        let mut success = false;
        let mut attempt = 0u32;
        while attempt < MAX_RETRY {
            attempt += 1;
            let timeout_ms = RETRY_TIMEOUT_STEP_MS * u64::from(attempt);
            balance = balance.wrapping_add(1);
            let Some(node) = self
                .table
                .resolve(balance, &req.service_name, req.service_type)
            else {
                rsp.error = ERR_SERVICE_NOT_FOUND.to_string();
                break;
            };
            self.request_log
                .send_service_request(id, &req.service_name, &node.host, &node.port);
            rsp.host = node.host.clone();
            rsp.port = node.port.clone();

            let sent = if req.service_type == ServiceType::Http {
                match self
                    .pool
                    .send_http_request(
                        &req.service_api,
                        req.method,
                        &node.host,
                        &node.port,
                        req.service_req_data.clone(),
                        timeout_ms,
                    )
                    .await
                {
                    Some(client) => {
                        let (result, can_retry) = self.pool.get_http_response(client).await;
                        self.request_log.got_service_reply(id, &req.service_name);
                        Some(result.map_err(|msg| (msg, can_retry)))
                    }
                    None => None,
                }
            } else {
                match self
                    .pool
                    .send_request(
                        req.service_type,
                        &req.service_api,
                        &node.host,
                        &node.port,
                        &req.service_req_data,
                        timeout_ms,
                    )
                    .await
                {
                    Some(future) => {
                        let outcome = future.wait().await;
                        self.request_log.got_service_reply(id, &req.service_name);
                        if outcome.is_success {
                            Some(Ok(outcome.body))
                        } else {
                            Some(Err((
                                String::from_utf8_lossy(&outcome.body).into_owned(),
                                outcome.can_retry,
                            )))
                        }
                    }
                    None => None,
                }
            };

            match sent {
                None => {
                    self.request_log
                        .service_failed(id, &req.service_name, "Send Data Failed.");
                    self.bump_failure(&req.service_name);
                    if attempt == MAX_RETRY {
                        rsp.error = ERR_SEND_FAILED.to_string();
                    }
                    continue;
                }
                Some(Ok(body)) => {
                    rsp.rsp = body;
                    success = true;
                    break;
                }
                Some(Err((msg, can_retry))) => {
                    self.request_log.service_failed(id, &req.service_name, &msg);
                    self.bump_failure(&req.service_name);
                    if !can_retry || attempt == MAX_RETRY {
                        rsp.error = format!("{ERR_RSP_FAILED_PREFIX}{msg}");
                        break;
                    }
                }
            }
        }

        if success {
            self.cache.set(req, &rsp);
        } else {
            let failed = self
                .fail_stat
                .get(&req.service_name)
                .map(|c| *c)
                .unwrap_or(0);
            if failed % 10 == 0 {
                info!(
                    service = %req.service_name,
                    total_failed = failed,
                    "service get response failed"
                );
            }
            if req.enable_cache {
                if let Some(hit) = self.cache.get(req) {
                    rsp = hit;
                }
            }
        }
        rsp
    }

    fn bump_failure(&self, service: &str) {
        *self.fail_stat.entry(service.to_string()).or_insert(0) += 1;
    }

    /// Forward bindings referenced by one agent, for the API controller.
    pub fn port_forward_services_for(&self, agent_id: &str) -> Vec<ForwardInfo> {
        self.table
            .related_forward_ports(agent_id)
            .into_iter()
            .filter_map(|port| self.forwards.forward_info(port))
            .collect()
    }

    pub fn forward_info(&self, port: u16) -> Option<ForwardInfo> {
        self.forwards.forward_info(port)
    }

    /// Stops the port listeners and drops pooled state.
    pub fn stop(&self) {
        self.forwards.stop_all();
        self.cache.clear();
        self.pool.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ServiceCache;
    use crate::types::{HttpMethod, ServiceNode};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    fn build_manager(table: Arc<RoutingTable>) -> Arc<ForwardManager> {
        let forwards = PortForwardManager::new(Arc::clone(&table), CancellationToken::new());
        ForwardManager::new(
            Arc::new(ClientPool::new()),
            table,
            Arc::new(ServiceCache::new(1024)),
            TaskPool::new(64),
            Arc::new(RequestLog::new(1024)),
            forwards,
        )
    }

    async fn http_upstream(status: &'static str, body: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 8192];
                    let _ = sock.read(&mut buf).await;
                    let rsp = format!(
                        "HTTP/1.1 {status}\r\nContent-Length: {}\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = sock.write_all(rsp.as_bytes()).await;
                });
            }
        });
        addr
    }

    fn install_http(table: &RoutingTable, name: &str, addr: std::net::SocketAddr) {
        table.install(
            ServiceType::Http,
            &format!("{name}-dev"),
            vec![ServiceNode::new(addr.ip().to_string(), addr.port().to_string())],
        );
    }

    #[tokio::test]
    async fn local_test_echoes_without_an_upstream() {
        let mgr = build_manager(Arc::new(RoutingTable::new()));
        let req = ServiceCallReq {
            service_name: LOCAL_TEST.to_string(),
            ..Default::default()
        };
        let rsp = mgr.call_single(0, &req).await;
        assert!(rsp.is_success());
        assert_eq!(rsp.rsp.as_ref(), LOCAL_TEST.as_bytes());
    }

    #[tokio::test]
    async fn unknown_service_fails_without_retry() {
        let mgr = build_manager(Arc::new(RoutingTable::new()));
        let req = ServiceCallReq {
            service_name: "ghost".to_string(),
            ..Default::default()
        };
        let rsp = mgr.call_single(0, &req).await;
        assert_eq!(rsp.error, ERR_SERVICE_NOT_FOUND);
    }

    #[tokio::test]
    async fn batch_preserves_request_order() {
        let table = Arc::new(RoutingTable::new());
        let a = http_upstream("200 OK", "alpha").await;
        let b = http_upstream("200 OK", "beta").await;
        install_http(&table, "svc-a", a);
        install_http(&table, "svc-b", b);
        let mgr = build_manager(table);

        let reqs = vec![
            ServiceCallReq {
                service_name: "svc-a".into(),
                service_api: "/x".into(),
                method: HttpMethod::Get,
                ..Default::default()
            },
            ServiceCallReq {
                service_name: "svc-b".into(),
                service_api: "/y".into(),
                method: HttpMethod::Get,
                ..Default::default()
            },
        ];
        let rsps = mgr.call_services(0, reqs, false).await;
        assert_eq!(rsps.len(), 2);
        assert_eq!(rsps[0].service_name, "svc-a");
        assert_eq!(rsps[0].rsp.as_ref(), b"alpha");
        assert_eq!(rsps[1].service_name, "svc-b");
        assert_eq!(rsps[1].rsp.as_ref(), b"beta");
    }

    #[tokio::test]
    async fn transactional_batch_rejects_non_http_rows() {
        let mgr = build_manager(Arc::new(RoutingTable::new()));
        let reqs = vec![
            ServiceCallReq {
                service_name: "a".into(),
                service_type: ServiceType::Http,
                ..Default::default()
            },
            ServiceCallReq {
                service_name: "b".into(),
                service_type: ServiceType::Rpc,
                ..Default::default()
            },
        ];
        let rsps = mgr.call_services(0, reqs, true).await;
        assert_eq!(rsps.len(), 2);
        for rsp in &rsps {
            assert_eq!(rsp.error, ERR_TRANSACTION_REJECT);
        }
    }

    #[tokio::test]
    async fn failure_falls_back_to_cache_when_enabled() {
        let table = Arc::new(RoutingTable::new());
        let addr = http_upstream("200 OK", "cached-body").await;
        install_http(&table, "flaky", addr);
        let mgr = build_manager(Arc::clone(&table));

        let req = ServiceCallReq {
            service_name: "flaky".into(),
            service_api: "/data".into(),
            method: HttpMethod::Get,
            enable_cache: true,
            ..Default::default()
        };
        let first = mgr.call_single(0, &req).await;
        assert!(first.is_success());
        assert!(!first.is_cached);

        // Upstream vanishes from the routing table; the cache must answer.
        let empty: Vec<ServiceNode> = Vec::new();
        table.install(ServiceType::Http, "flaky-dev", empty);
        let second = mgr.call_single(0, &req).await;
        assert!(second.is_cached);
        assert_eq!(second.rsp.as_ref(), b"cached-body");
    }
}
