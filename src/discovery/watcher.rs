//! Long-poll watchers against the service registry.
//!
//! Four loops run concurrently: the catalog watcher (which spawns one node
//! watcher per discovered service), the forward-port KV watcher, the active
//! cluster watcher, and the per-service stats reporter. Each loop owns its
//! own HTTP client, rotates through the configured registry addresses on
//! failure with a short backoff, and long-polls with the registry's
//! `X-Consul-Index` tag.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{HttpClient, HttpRequest};
use crate::config::HostPort;
use crate::discovery::catalog::{
    parse_cluster_name, parse_forward_keys, parse_forward_value, parse_health_nodes,
    parse_services_list, AGENT_ID_LEN,
};
use crate::discovery::table::RoutingTable;
use crate::portforward::PortForwardManager;
use crate::request_log::RequestLog;
use crate::types::{HttpMethod, ServiceType};

/// Long-poll wait, in seconds.
const LONG_POLL_WAIT_SECS: u64 = 600;
/// Backoff after a failed registry poll.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Cluster-watcher backoff and stats-report period.
const REPORT_PERIOD: Duration = Duration::from_secs(10);

/// The discovery control plane.
pub struct ServiceDiscovery {
    registry_addrs: Vec<HostPort>,
    report_addr: HostPort,
    table: Arc<RoutingTable>,
    forwards: Arc<PortForwardManager>,
    request_log: Arc<RequestLog>,
    cancel: CancellationToken,
}

impl ServiceDiscovery {
    pub fn new(
        registry_addrs: Vec<HostPort>,
        report_addr: HostPort,
        table: Arc<RoutingTable>,
        forwards: Arc<PortForwardManager>,
        request_log: Arc<RequestLog>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        for addr in &registry_addrs {
            info!(registry = %addr.address(), "registry server added");
        }
        Arc::new(ServiceDiscovery {
            registry_addrs,
            report_addr,
            table,
            forwards,
            request_log,
            cancel,
        })
    }

    /// Spawns all watcher loops.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        {
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move { this.watch_services().await }));
        }
        {
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move { this.watch_forward_ports().await }));
        }
        {
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move { this.watch_cluster().await }));
        }
        {
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move { this.report_service_stats().await }));
        }
        handles
    }

    fn registry_client(&self, balance: usize) -> HttpClient {
        let addr = &self.registry_addrs[balance % self.registry_addrs.len()];
        HttpClient::new(addr.host.clone(), addr.port.clone())
    }

    /// One long-poll exchange. `wait` appends `index=…&wait=…s`; deadlines
    /// are disabled so the poll can park for the full wait.
    async fn long_poll(
        &self,
        client: &mut HttpClient,
        path: &str,
        extra_query: &str,
        index: &mut u64,
        wait: Option<u64>,
    ) -> Result<String, String> {
        let mut query = extra_query.to_string();
        if let Some(wait_secs) = wait {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(&format!("index={index}&wait={wait_secs}s"));
        }
        let req = HttpRequest {
            method: HttpMethod::Get,
            path: path.to_string(),
            query,
            headers: Vec::new(),
            keep_alive: true,
            body: bytes::Bytes::new(),
        };
        client
            .send_http_request(&req, 0)
            .await
            .map_err(|e| format!("send long polling request failed: {e}"))?;
        let rsp = client
            .get_http_response()
            .await
            .map_err(|e| format!("get long polling response failed: {e}"))?;
        if rsp.status != 200 {
            return Err(format!("long polling status {}", rsp.status));
        }
        if let Some(tag) = rsp.header("X-Consul-Index").and_then(|v| v.trim().parse().ok()) {
            *index = tag;
        }
        Ok(String::from_utf8_lossy(&rsp.body).into_owned())
    }

    /// Sleeps unless cancelled first; true means keep running.
    async fn pause(&self, period: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(period) => true,
        }
    }

    /// Catalog watcher: starts a node watcher for every newly seen service.
    async fn watch_services(self: Arc<Self>) {
        let mut watching: HashSet<String> = HashSet::new();
        let mut index = 0u64;
        let mut balance = 0usize;
        let mut client = self.registry_client(balance);
        while !self.cancel.is_cancelled() {
            let polled = tokio::select! {
                _ = self.cancel.cancelled() => break,
                polled = self.long_poll(&mut client, "/v1/catalog/services", "", &mut index, Some(LONG_POLL_WAIT_SECS)) => polled,
            };
            let body = match polled {
                Ok(body) => body,
                Err(e) => {
                    warn!(error = %e, "service catalog poll failed");
                    if !self.pause(POLL_RETRY_DELAY).await {
                        break;
                    }
                    balance += 1;
                    client = self.registry_client(balance);
                    continue;
                }
            };
            let Some(services) = parse_services_list(&body) else {
                continue;
            };
            for name in services {
                if watching.contains(&name) {
                    continue;
                }
                watching.insert(name.clone());
                let this = Arc::clone(&self);
                tokio::spawn(async move { this.watch_service_nodes(name).await });
            }
        }
    }

    /// Health watcher for one service: replaces its routing-table entries on
    /// every poll.
    async fn watch_service_nodes(self: Arc<Self>, name: String) {
        let mut index = 0u64;
        let mut balance = 0usize;
        let mut seen_keys: HashSet<String> = HashSet::new();
        let mut client = self.registry_client(balance);
        let path = format!("/v1/health/service/{name}");
        while !self.cancel.is_cancelled() {
            let polled = tokio::select! {
                _ = self.cancel.cancelled() => break,
                polled = self.long_poll(&mut client, &path, "", &mut index, Some(LONG_POLL_WAIT_SECS)) => polled,
            };
            let body = match polled {
                Ok(body) => body,
                Err(e) => {
                    debug!(service = %name, error = %e, "health poll failed");
                    if !self.pause(POLL_RETRY_DELAY).await {
                        break;
                    }
                    balance += 1;
                    client = self.registry_client(balance);
                    continue;
                }
            };
            let Some(update) = parse_health_nodes(&body) else {
                info!(service = %name, "parse service node list failed");
                continue;
            };
            self.table.apply_health_update(&mut seen_keys, update);
        }
    }

    /// Fetches one forward-port KV value (`"service_name,protocol_tag"`).
    async fn fetch_forward_value(
        &self,
        client: &mut HttpClient,
        key: &str,
    ) -> Option<(String, ServiceType)> {
        let mut index = 0u64;
        let path = format!("/v1/kv/fibp-forward-port/{key}");
        match self.long_poll(client, &path, "raw", &mut index, None).await {
            Ok(body) => parse_forward_value(body.trim()),
            Err(e) => {
                info!(key, error = %e, "get forward info failed");
                None
            }
        }
    }

    /// Forward-port watcher: keeps one listener per bound service alive as
    /// long as at least one agent references it.
    async fn watch_forward_ports(self: Arc<Self>) {
        let mut index = 0u64;
        let mut balance = 0usize;
        let mut client = self.registry_client(balance);
        // port → agents referencing it this tick
        let mut last_ports: HashMap<u16, HashSet<String>> = HashMap::new();
        // service_name + type digit → port
        let mut service_port_map: HashMap<String, u16> = HashMap::new();
        // keys fetched on the previous tick are not re-fetched
        let mut previous_keys: HashMap<String, (String, ServiceType)> = HashMap::new();

        while !self.cancel.is_cancelled() {
            let polled = tokio::select! {
                _ = self.cancel.cancelled() => break,
                polled = self.long_poll(&mut client, "/v1/kv/fibp-forward-port", "keys", &mut index, Some(LONG_POLL_WAIT_SECS)) => polled,
            };
            let body = match polled {
                Ok(body) => body,
                Err(e) => {
                    debug!(error = %e, "forward port poll failed");
                    if !self.pause(POLL_RETRY_DELAY).await {
                        break;
                    }
                    balance += 1;
                    client = self.registry_client(balance);
                    continue;
                }
            };
            let Some(keys) = parse_forward_keys(&body) else {
                info!("parse the forward services data failed");
                continue;
            };
            if keys.is_empty() {
                info!(live_ports = last_ports.len(), "no forward services available");
            }

            for agents in last_ports.values_mut() {
                agents.clear();
            }
            let mut new_keys: HashMap<String, (String, ServiceType)> = HashMap::new();
            for key in keys {
                if key.len() <= AGENT_ID_LEN {
                    info!(key, "forward key invalid");
                    continue;
                }
                let Some(agent_id) = key.get(..AGENT_ID_LEN).map(str::to_string) else {
                    continue;
                };
                let binding = match previous_keys.get(&key) {
                    Some(known) => known.clone(),
                    None => match self.fetch_forward_value(&mut client, &key).await {
                        Some(fetched) => fetched,
                        None => continue,
                    },
                };
                let unique = format!("{}{}", binding.0, binding.1.as_u32());
                new_keys.insert(key, binding.clone());
                if let Some(&port) = service_port_map.get(&unique) {
                    last_ports.entry(port).or_default().insert(agent_id);
                    continue;
                }
                match self.forwards.start_port_forward(&binding.0, binding.1).await {
                    Ok(port) => {
                        service_port_map.insert(unique, port);
                        last_ports.entry(port).or_default().insert(agent_id);
                    }
                    Err(e) => {
                        warn!(service = %binding.0, error = %e, "start port forward failed");
                    }
                }
            }
            previous_keys = new_keys;

            let retired: Vec<u16> = last_ports
                .iter()
                .filter(|(_, agents)| agents.is_empty())
                .map(|(port, _)| *port)
                .collect();
            for port in retired {
                if let Some(info) = self.forwards.forward_info(port) {
                    service_port_map
                        .remove(&format!("{}{}", info.service_name, info.service_type.as_u32()));
                }
                self.forwards.stop_port_forward(port);
                last_ports.remove(&port);
                info!(port, "forward port removed");
            }

            let mut by_agent: HashMap<String, BTreeSet<u16>> = HashMap::new();
            for (port, agents) in &last_ports {
                for agent in agents {
                    by_agent.entry(agent.clone()).or_default().insert(*port);
                }
            }
            self.table.set_agent_ports(by_agent);
        }
    }

    /// Active-cluster watcher against the report endpoint.
    async fn watch_cluster(self: Arc<Self>) {
        let mut index = 0u64;
        let mut client = HttpClient::new(
            self.report_addr.host.clone(),
            self.report_addr.port.clone(),
        );
        while !self.cancel.is_cancelled() {
            let polled = tokio::select! {
                _ = self.cancel.cancelled() => break,
                polled = self.long_poll(&mut client, "/api/local/get-cluster", "", &mut index, Some(LONG_POLL_WAIT_SECS)) => polled,
            };
            match polled {
                Ok(body) => {
                    match parse_cluster_name(&body) {
                        Some(name) => self.table.set_cluster(&name),
                        None => info!("parsing cluster name failed"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "cluster poll failed");
                    if !self.pause(REPORT_PERIOD).await {
                        break;
                    }
                    client = HttpClient::new(
                        self.report_addr.host.clone(),
                        self.report_addr.port.clone(),
                    );
                }
            }
        }
    }

    /// Ships the per-service stat snapshot to the cluster-report endpoint
    /// every ten seconds.
    async fn report_service_stats(self: Arc<Self>) {
        let mut client = HttpClient::new(
            self.report_addr.host.clone(),
            self.report_addr.port.clone(),
        );
        while self.pause(REPORT_PERIOD).await {
            let stats = self.request_log.recent_service_stats();
            let mut rows = Vec::new();
            for (name, buckets) in &stats {
                for stat in buckets {
                    rows.push(json!({
                        "Name": name,
                        "Latency": stat.avg_latency,
                        "RequestPerSec": stat.request_per_sec,
                        "Timestamp": stat.timestamp,
                    }));
                }
            }
            if rows.is_empty() {
                info!("no stats for any service");
                continue;
            }
            let req = HttpRequest {
                method: HttpMethod::Post,
                path: "/api/monitor/cluster/report-service".to_string(),
                query: String::new(),
                headers: vec![("Content-Type".to_string(), "application/json".to_string())],
                keep_alive: true,
                body: serde_json::Value::Array(rows).to_string().into(),
            };
            if client.send_http_request(&req, 1_000).await.is_err() {
                warn!("report request failed");
                client = HttpClient::new(
                    self.report_addr.host.clone(),
                    self.report_addr.port.clone(),
                );
                continue;
            }
            if let Err(e) = client.get_response().await {
                warn!(error = %e, "get report response failed");
            }
        }
    }
}
