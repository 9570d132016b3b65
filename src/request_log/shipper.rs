//! Drains the request-log ring to the external time-series sink.
//!
//! Records ship as two columnar series (`fibp_api_log` per request,
//! `fibp_services_log` per upstream attempt) in one JSON document per batch.
//! While draining, per-second per-service stats accumulate; once more than
//! ten seconds of history exist they are swapped into the ring's snapshot
//! for the cluster reporter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{HttpClient, HttpRequest};
use crate::config::HostPort;
use crate::discovery::RoutingTable;
use crate::request_log::{
    DrainStep, RequestLog, ServiceStat, ServiceStatMap, SlotRecord, MAX_LOG_SEND_NUM,
};
use crate::types::{HttpMethod, ServiceType};

/// Sink path, InfluxDB 0.8 series-write shape.
const SINK_PATH: &str = "/db/FIBP/series";
const SINK_QUERY: &str = "u=root&p=root&time_precision=u";
const SINK_TIMEOUT_MS: u64 = 300;

/// Seconds of per-second history accumulated before a snapshot swap.
const STAT_WINDOW_SECS: u64 = 10;

#[derive(Default)]
struct StatAccum {
    latency_sum: f64,
    count: u64,
    timestamp: u64,
}

/// The drain task.
pub struct LogShipper {
    log: Arc<RequestLog>,
    table: Arc<RoutingTable>,
    sink: HostPort,
    log_service: String,
    cancel: CancellationToken,
}

impl LogShipper {
    pub fn new(
        log: Arc<RequestLog>,
        table: Arc<RoutingTable>,
        sink: HostPort,
        log_service: String,
        cancel: CancellationToken,
    ) -> Self {
        info!(sink = %sink.address(), "log sending to server");
        LogShipper {
            log,
            table,
            sink,
            log_service,
            cancel,
        }
    }

    /// Runs until cancelled.
    pub async fn run(self) {
        let mut client = HttpClient::new(self.sink.host.clone(), self.sink.port.clone());
        let mut next_send: u64 = 1;
        let mut accums: HashMap<String, StatAccum> = HashMap::new();
        let mut pending: ServiceStatMap = HashMap::new();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let mut batch: Vec<SlotRecord> = Vec::new();
            let mut dropped = 0usize;
            while batch.len() < MAX_LOG_SEND_NUM {
                match self.log.drain_one(next_send) {
                    DrainStep::NotReady => break,
                    DrainStep::Shipped(record) => {
                        batch.push(*record);
                        next_send += 1;
                    }
                    DrainStep::Dropped => {
                        dropped += 1;
                        next_send += 1;
                    }
                }
            }
            if dropped > 0 {
                warn!(
                    dropped,
                    next_send,
                    claimed = self.log.claimed(),
                    "log send fell behind, abandoning some logs"
                );
            }
            if batch.is_empty() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                continue;
            }

            self.accumulate_stats(&batch, &mut accums, &mut pending);
            let body = build_series_document(&batch);
            let small_batch = batch.len() < 100;

            if !self.ship(&mut client, body).await {
                if let Some(fresh) = self.find_log_service(&client) {
                    client = fresh;
                }
            }
            if small_batch {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
            }
        }
        info!("log shipper exited");
    }

    async fn ship(&self, client: &mut HttpClient, body: serde_json::Value) -> bool {
        let req = HttpRequest {
            method: HttpMethod::Post,
            path: SINK_PATH.to_string(),
            query: SINK_QUERY.to_string(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            keep_alive: true,
            body: body.to_string().into(),
        };
        if client.send_http_request(&req, SINK_TIMEOUT_MS).await.is_err() {
            info!("send log failed");
            return false;
        }
        match client.get_response().await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "log sink rejected batch");
                false
            }
        }
    }

    /// Re-resolves the log service through the routing table; returns a new
    /// client when the sink moved.
    fn find_log_service(&self, current: &HttpClient) -> Option<HttpClient> {
        let node = self.table.resolve(0, &self.log_service, ServiceType::Http);
        match node {
            Some(node) => {
                if current.host() == node.host && current.port() == node.port {
                    return None;
                }
                info!(sink = %node.address(), "log service was found");
                Some(HttpClient::new(node.host, node.port))
            }
            None => {
                info!("log service not found");
                None
            }
        }
    }

    fn accumulate_stats(
        &self,
        batch: &[SlotRecord],
        accums: &mut HashMap<String, StatAccum>,
        pending: &mut ServiceStatMap,
    ) {
        for record in batch {
            for (service, attempts) in &record.services {
                for attempt in attempts {
                    let bucket = attempt.start_time / 1_000_000;
                    let accum = accums.entry(service.clone()).or_insert_with(|| StatAccum {
                        timestamp: bucket,
                        ..Default::default()
                    });
                    if bucket != accum.timestamp {
                        let finished = ServiceStat {
                            avg_latency: if accum.count > 0 {
                                accum.latency_sum / accum.count as f64
                            } else {
                                0.0
                            },
                            request_per_sec: accum.count,
                            timestamp: accum.timestamp,
                        };
                        let history = pending.entry(service.clone()).or_default();
                        history.push(finished);
                        let oldest = history.first().map(|s| s.timestamp).unwrap_or(bucket);
                        if accum.timestamp.saturating_sub(oldest) > STAT_WINDOW_SECS {
                            self.log.swap_recent_stats(std::mem::take(pending));
                        }
                        accum.latency_sum = 0.0;
                        accum.count = 0;
                        accum.timestamp = bucket;
                    }
                    accum.count += 1;
                    accum.latency_sum +=
                        attempt.end_time.saturating_sub(attempt.start_time) as f64;
                }
            }
        }
    }
}

/// Builds the two-series columnar document for one batch.
fn build_series_document(batch: &[SlotRecord]) -> serde_json::Value {
    let mut api_points = Vec::with_capacity(batch.len());
    let mut service_points = Vec::new();
    for record in batch {
        api_points.push(json!([
            record.start_time,
            record.id,
            record.start_time,
            record.end_time,
            record.end_time.saturating_sub(record.start_time),
        ]));
        for (service, attempts) in &record.services {
            for attempt in attempts {
                let is_fail = !attempt.failed_msg.is_empty();
                service_points.push(json!([
                    attempt.start_time,
                    record.id,
                    attempt.start_time,
                    attempt.end_time,
                    attempt.end_time.saturating_sub(attempt.start_time),
                    service,
                    attempt.host_port,
                    is_fail,
                    attempt.failed_msg,
                ]));
            }
        }
    }
    json!([
        {
            "name": "fibp_api_log",
            "columns": ["time", "logid", "start_time", "end_time", "latency"],
            "points": api_points,
        },
        {
            "name": "fibp_services_log",
            "columns": [
                "time", "logid", "start_time", "end_time", "latency",
                "service_name", "host_port", "is_fail", "failed_msg"
            ],
            "points": service_points,
        }
    ])
}
