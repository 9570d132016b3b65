//! Controller routing shared by the driver and HTTP front ends.
//!
//! A request names `/{controller}/{action}`; the router maps that pair onto
//! a handler, parses the JSON body into service calls, invokes the forward
//! manager, and renders the per-row response document. Upstream failures
//! surface as row errors, never as transport failures.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::forward::ForwardManager;
use crate::request_log::RequestLog;
use crate::types::{HttpMethod, ServiceCallReq, ServiceCallRsp, ServiceType};

/// Parsed front-end request handed to a controller.
#[derive(Debug, Clone)]
pub struct ControllerRequest {
    pub controller: String,
    pub action: String,
    /// Full request path (used by the single-call passthrough).
    pub path: String,
    pub method: HttpMethod,
    pub body: Bytes,
}

/// Controller result: a JSON document, plus an optional raw body that
/// replaces it for passthrough responses.
#[derive(Debug, Clone)]
pub struct ControllerResponse {
    pub value: Value,
    pub raw: Option<Bytes>,
}

impl ControllerResponse {
    fn ok(mut fields: Value) -> Self {
        if let Some(obj) = fields.as_object_mut() {
            obj.insert("header".to_string(), json!({"success": true}));
        }
        ControllerResponse {
            value: fields,
            raw: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ControllerResponse {
            value: json!({
                "header": {"success": false},
                "errors": [message.into()],
            }),
            raw: None,
        }
    }

    fn raw(body: Bytes) -> Self {
        ControllerResponse {
            value: json!({"header": {"success": true}}),
            raw: Some(body),
        }
    }
}

/// Parses one `call_api_list` row set from the request document. RPC rows
/// get their JSON body wrapped as a msgpack tuple-of-one-string for the
/// upstream codec.
pub fn parse_api_request(list: &Value) -> Option<Vec<ServiceCallReq>> {
    let rows = list.as_array()?;
    let mut reqs = Vec::with_capacity(rows.len());
    for row in rows {
        let service_type = row
            .get("service_type")
            .and_then(Value::as_u64)
            .and_then(|v| ServiceType::from_u32(v as u32))
            .unwrap_or(ServiceType::Http);
        let body_text = row
            .get("service_req_data")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let service_req_data = if service_type == ServiceType::Rpc {
            Bytes::from(wrap_rpc_body(body_text))
        } else {
            Bytes::copy_from_slice(body_text.as_bytes())
        };
        reqs.push(ServiceCallReq {
            service_name: row.get("service_name")?.as_str()?.to_string(),
            service_api: row
                .get("service_api")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            method: HttpMethod::from_name(
                row.get("service_method").and_then(Value::as_str).unwrap_or("POST"),
            ),
            service_req_data,
            service_cluster: row
                .get("service_cluster")
                .and_then(Value::as_str)
                .unwrap_or(crate::types::DEFAULT_CLUSTER)
                .to_string(),
            service_type,
            enable_cache: row
                .get("enable_cache")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        });
    }
    Some(reqs)
}

/// Msgpack `(body,)` wrapper used for RPC upstream payloads.
pub fn wrap_rpc_body(body: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);
    let _ = rmp::encode::write_array_len(&mut out, 1);
    let _ = rmp::encode::write_str(&mut out, body);
    out
}

/// Parses the single-call passthrough path
/// `/{controller}/{action}/{service}/{api…}`.
pub fn parse_single_api_request(
    method: HttpMethod,
    raw_body: &Bytes,
    path: &str,
) -> Option<Vec<ServiceCallReq>> {
    let trimmed = path.trim_matches('/');
    let segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 4 {
        return None;
    }
    let service_name = segments[2].to_string();
    let api_offset = segments[0].len() + 1 + segments[1].len() + 1 + segments[2].len();
    let service_api = trimmed.get(api_offset..)?.to_string();
    debug!(service = %service_name, api = %service_api, "single api call");
    Some(vec![ServiceCallReq {
        service_name,
        service_api,
        method,
        service_req_data: raw_body.clone(),
        service_type: ServiceType::Http,
        ..Default::default()
    }])
}

/// Renders the batch rows. RPC row bodies are decoded back from msgpack to
/// their JSON string.
pub fn render_rsp_list(reqs: &[ServiceCallReq], rsps: &[ServiceCallRsp]) -> Value {
    let mut rows = Vec::with_capacity(rsps.len());
    for (req, rsp) in reqs.iter().zip(rsps) {
        let mut error = rsp.error.clone();
        let body = if req.service_type == ServiceType::Rpc && !rsp.rsp.is_empty() {
            match unwrap_rpc_body(&rsp.rsp) {
                Ok(text) => text,
                Err(e) => {
                    error = format!("Convert Service Rpc Response to Json String Failed.{e}");
                    String::new()
                }
            }
        } else {
            String::from_utf8_lossy(&rsp.rsp).into_owned()
        };
        let mut row = json!({
            "service_name": rsp.service_name,
            "service_rsp": body,
            "is_cached": rsp.is_cached,
        });
        if !error.is_empty() {
            row["service_error"] = Value::String(error);
        }
        rows.push(row);
    }
    Value::Array(rows)
}

/// Decodes an RPC row body (a msgpack string) back to its JSON text.
fn unwrap_rpc_body(packed: &[u8]) -> Result<String, String> {
    let value = rmpv::decode::read_value(&mut &packed[..]).map_err(|e| e.to_string())?;
    match value {
        rmpv::Value::String(s) => s
            .into_str()
            .ok_or_else(|| "response string is not utf-8".to_string()),
        other => Err(format!("response is not a string: {other}")),
    }
}

/// The `/{controller}/{action}` route map.
pub struct DriverRouter {
    forward: Arc<ForwardManager>,
    request_log: Arc<RequestLog>,
    enable_test: bool,
}

impl DriverRouter {
    pub fn new(
        forward: Arc<ForwardManager>,
        request_log: Arc<RequestLog>,
        enable_test: bool,
    ) -> Arc<Self> {
        Arc::new(DriverRouter {
            forward,
            request_log,
            enable_test,
        })
    }

    /// Finds and invokes the handler. Unknown routes report
    /// "Handler not found".
    pub async fn dispatch(&self, req: ControllerRequest) -> ControllerResponse {
        match (req.controller.as_str(), req.action.as_str()) {
            ("commands", "call_services_async") => self.call_services_async(&req).await,
            ("commands", "call_single_service_async") => self.call_single_service_async(&req).await,
            ("commands", "check_alive") => ControllerResponse::ok(json!({"echo": "alive"})),
            ("api", "list_port_forward_services") => self.list_port_forward_services(&req),
            ("test", "echo") if self.enable_test => ControllerResponse::raw(req.body.clone()),
            _ => {
                warn!(controller = %req.controller, action = %req.action, "handler not found");
                ControllerResponse::error("Handler not found")
            }
        }
    }

    async fn call_services_async(&self, req: &ControllerRequest) -> ControllerResponse {
        let id = self.request_log.start_call();
        let parsed: Value = match serde_json::from_slice(&req.body) {
            Ok(v) => v,
            Err(_) => {
                self.request_log.end_call(id);
                return ControllerResponse::error("parser request data failed.");
            }
        };
        let do_transaction = parsed
            .get("do_transaction")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let Some(reqs) = parsed.get("call_api_list").and_then(|v| parse_api_request(v)) else {
            self.request_log.end_call(id);
            return ControllerResponse::error("parser request data failed.");
        };
        let rsps = self.forward.call_services(id, reqs.clone(), do_transaction).await;
        let rendered = render_rsp_list(&reqs, &rsps);
        self.request_log.end_call(id);
        ControllerResponse::ok(json!({"service_rsp_list": rendered}))
    }

    async fn call_single_service_async(&self, req: &ControllerRequest) -> ControllerResponse {
        let id = self.request_log.start_call();
        let Some(reqs) = parse_single_api_request(req.method, &req.body, &req.path) else {
            self.request_log.end_call(id);
            return ControllerResponse::error("parser request data failed.");
        };
        let rsps = self.forward.call_services(id, reqs, false).await;
        self.request_log.end_call(id);
        if rsps.len() != 1 {
            return ControllerResponse::error("SERVER_RETURN_ERROR");
        }
        if !rsps[0].error.is_empty() {
            return ControllerResponse::error(rsps[0].error.clone());
        }
        ControllerResponse::raw(rsps[0].rsp.clone())
    }

    fn list_port_forward_services(&self, req: &ControllerRequest) -> ControllerResponse {
        let agent_id = serde_json::from_slice::<Value>(&req.body)
            .ok()
            .and_then(|v| v.get("ID").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();
        let rows: Vec<Value> = self
            .forward
            .port_forward_services_for(&agent_id)
            .into_iter()
            .map(|info| {
                json!({
                    "ServiceName": info.service_name,
                    "ServiceType": info.service_type.as_u32(),
                    "ForwardPort": info.port,
                })
            })
            .collect();
        ControllerResponse::ok(json!({"ForwardServiceList": rows}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_request_rows_parse_with_defaults() {
        let list = json!([
            {"service_name": "echo", "service_api": "/ping", "service_method": "GET",
             "service_req_data": "", "service_type": 0, "enable_cache": false},
            {"service_name": "calc", "service_api": "add", "service_req_data": "{\"a\":1}",
             "service_type": 1}
        ]);
        let reqs = parse_api_request(&list).unwrap();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].method, HttpMethod::Get);
        assert_eq!(reqs[0].service_cluster, "dev");
        assert_eq!(reqs[1].service_type, ServiceType::Rpc);
        // RPC body arrives as msgpack ("body",).
        let value = rmpv::decode::read_value(&mut &reqs[1].service_req_data[..]).unwrap();
        assert_eq!(value[0].as_str(), Some("{\"a\":1}"));
    }

    #[test]
    fn missing_service_name_rejects_the_batch() {
        let list = json!([{"service_api": "/x"}]);
        assert!(parse_api_request(&list).is_none());
    }

    #[test]
    fn single_api_path_splits_service_and_api() {
        let body = Bytes::from_static(b"{}");
        let reqs = parse_single_api_request(
            HttpMethod::Put,
            &body,
            "/commands/call_single_service_async/billing/v2/charge",
        )
        .unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].service_name, "billing");
        assert_eq!(reqs[0].service_api, "/v2/charge");
        assert_eq!(reqs[0].method, HttpMethod::Put);

        assert!(parse_single_api_request(HttpMethod::Get, &body, "/commands/too/short").is_none());
    }

    #[test]
    fn rpc_rows_render_back_to_json_text() {
        let reqs = vec![ServiceCallReq {
            service_name: "calc".into(),
            service_type: ServiceType::Rpc,
            ..Default::default()
        }];
        let mut packed = Vec::new();
        rmpv::encode::write_value(&mut packed, &rmpv::Value::from("{\"sum\":3}")).unwrap();
        let rsps = vec![ServiceCallRsp {
            service_name: "calc".into(),
            rsp: Bytes::from(packed),
            ..Default::default()
        }];
        let rendered = render_rsp_list(&reqs, &rsps);
        assert_eq!(rendered[0]["service_rsp"], "{\"sum\":3}");
        assert_eq!(rendered[0]["is_cached"], false);
        assert!(rendered[0].get("service_error").is_none());

        // A non-string msgpack body is a conversion error.
        let mut bad = Vec::new();
        rmpv::encode::write_value(&mut bad, &rmpv::Value::from(42)).unwrap();
        let rsps = vec![ServiceCallRsp {
            service_name: "calc".into(),
            rsp: Bytes::from(bad),
            ..Default::default()
        }];
        let rendered = render_rsp_list(&reqs, &rsps);
        assert!(rendered[0]["service_error"]
            .as_str()
            .unwrap()
            .starts_with("Convert Service Rpc Response to Json String Failed."));
    }
}
