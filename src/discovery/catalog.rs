//! Parsers for the Consul-compatible registry payloads.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;
use tracing::{debug, info};

use crate::discovery::table::NodesByType;
use crate::types::{ServiceNode, ServiceType, DEFAULT_CLUSTER};

/// KV prefix under which forward-port bindings live.
pub const FORWARD_PORT_PREFIX: &str = "fibp-forward-port/";

/// First 10 characters of a forward key name the agent.
pub const AGENT_ID_LEN: usize = 10;

/// `/v1/catalog/services` → service names (the object's keys).
pub fn parse_services_list(json: &str) -> Option<Vec<String>> {
    let doc: Value = match serde_json::from_str(json) {
        Ok(doc) => doc,
        Err(_) => {
            info!("parsing services list failed");
            return None;
        }
    };
    let obj = doc.as_object()?;
    Some(obj.keys().cloned().collect())
}

/// `/v1/health/service/{name}` → per-type `service_key → nodes`, keeping
/// only nodes whose every check reports `"passing"`.
pub fn parse_health_nodes(json: &str) -> Option<NodesByType> {
    let doc: Value = match serde_json::from_str(json) {
        Ok(doc) => doc,
        Err(_) => {
            info!("parsing health response failed");
            return None;
        }
    };
    let entries = doc.as_array()?;
    let mut out: NodesByType = (0..ServiceType::COUNT).map(|_| HashMap::new()).collect();
    for entry in entries {
        let host = entry
            .get("Node")
            .and_then(|n| n.get("Address"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let service = entry.get("Service");
        let service_name = service
            .and_then(|s| s.get("Service"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let port = service
            .and_then(|s| s.get("Port"))
            .and_then(Value::as_u64)
            .map(|p| p.to_string())
            .unwrap_or_default();

        let mut service_type = ServiceType::Custom;
        let mut clusters: Vec<String> = Vec::new();
        if let Some(tags) = service.and_then(|s| s.get("Tags")).and_then(Value::as_array) {
            for tag in tags.iter().filter_map(Value::as_str) {
                let tag = tag.to_ascii_lowercase();
                match ServiceType::from_tag(&tag) {
                    Some(t) => service_type = t,
                    None => clusters.push(tag),
                }
            }
        }
        if !service_name.is_empty() && clusters.is_empty() {
            clusters.push(DEFAULT_CLUSTER.to_string());
        }

        // A node with no Checks member at all is not trusted.
        let passing = match entry.get("Checks") {
            None => false,
            Some(checks) => match checks.as_array() {
                None => true,
                Some(list) => list.iter().all(|check| {
                    check
                        .get("Status")
                        .and_then(Value::as_str)
                        .map(|s| s == "passing")
                        .unwrap_or(true)
                }),
            },
        };
        if !passing || host.is_empty() || service_name.is_empty() {
            debug!(%host, %port, %service_name, "ignore failed node");
            continue;
        }

        let per_type = &mut out[service_type.index()];
        for cluster in &clusters {
            per_type
                .entry(format!("{service_name}-{cluster}"))
                .or_insert_with(BTreeSet::new)
                .insert(ServiceNode::new(host.clone(), port.clone()));
        }
    }
    Some(out)
}

/// `/v1/kv/fibp-forward-port?keys` → key names with the prefix stripped.
pub fn parse_forward_keys(json: &str) -> Option<Vec<String>> {
    let doc: Value = match serde_json::from_str(json) {
        Ok(doc) => doc,
        Err(_) => {
            info!("parsing forward key list failed");
            return None;
        }
    };
    let keys = doc.as_array()?;
    Some(
        keys.iter()
            .filter_map(Value::as_str)
            .filter(|k| k.len() > FORWARD_PORT_PREFIX.len())
            .map(|k| k[FORWARD_PORT_PREFIX.len()..].to_string())
            .collect(),
    )
}

/// KV value `"service_name,protocol_tag"` → binding target. Unknown tags
/// fall back to the custom protocol.
pub fn parse_forward_value(value: &str) -> Option<(String, ServiceType)> {
    let mut parts = value.splitn(2, ',');
    let name = parts.next()?.to_string();
    let tag = parts.next()?.trim().to_ascii_lowercase();
    if name.is_empty() {
        return None;
    }
    let service_type = ServiceType::from_tag(&tag).unwrap_or(ServiceType::Custom);
    Some((name, service_type))
}

/// `/api/local/get-cluster` → `{"Name": "…"}`.
pub fn parse_cluster_name(json: &str) -> Option<String> {
    let doc: Value = serde_json::from_str(json).ok()?;
    doc.get("Name")
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn services_list_is_the_object_keys() {
        let json = r#"{"consul":[],"echo":["http"],"billing":["http","prod"]}"#;
        let mut names = parse_services_list(json).unwrap();
        names.sort();
        assert_eq!(names, ["billing", "consul", "echo"]);
        assert!(parse_services_list("[1,2]").is_none());
    }

    #[test]
    fn health_nodes_keep_only_all_passing() {
        let json = r#"[
          {"Node":{"Address":"10.0.0.1"},
           "Service":{"Service":"echo","Port":8080,"Tags":["http"]},
           "Checks":[{"Status":"passing"},{"Status":"passing"}]},
          {"Node":{"Address":"10.0.0.2"},
           "Service":{"Service":"echo","Port":8080,"Tags":["http"]},
           "Checks":[{"Status":"passing"},{"Status":"critical"}]}
        ]"#;
        let nodes = parse_health_nodes(json).unwrap();
        let http = &nodes[ServiceType::Http.index()];
        let entry = http.get("echo-dev").expect("tagged http, default cluster");
        assert_eq!(entry.len(), 1);
        assert!(entry.contains(&ServiceNode::new("10.0.0.1", "8080")));
    }

    #[test]
    fn cluster_tags_fan_out_service_keys() {
        let json = r#"[
          {"Node":{"Address":"10.0.0.3"},
           "Service":{"Service":"pay","Port":9000,"Tags":["rpc","prod","canary"]},
           "Checks":[{"Status":"passing"}]}
        ]"#;
        let nodes = parse_health_nodes(json).unwrap();
        let rpc = &nodes[ServiceType::Rpc.index()];
        assert!(rpc.contains_key("pay-prod"));
        assert!(rpc.contains_key("pay-canary"));
        assert!(!rpc.contains_key("pay-dev"), "explicit clusters suppress the default");
    }

    #[test]
    fn untagged_services_default_to_custom_and_dev() {
        let json = r#"[
          {"Node":{"Address":"10.0.0.4"},
           "Service":{"Service":"legacy","Port":7000,"Tags":[]},
           "Checks":[{"Status":"passing"}]}
        ]"#;
        let nodes = parse_health_nodes(json).unwrap();
        assert!(nodes[ServiceType::Custom.index()].contains_key("legacy-dev"));
    }

    #[test]
    fn forward_keys_strip_the_kv_prefix() {
        let json = r#"["fibp-forward-port/aaaaaaaaaa-k1","fibp-forward-port/bbbbbbbbbb-k2","fibp-forward-port/"]"#;
        let keys = parse_forward_keys(json).unwrap();
        assert_eq!(keys, ["aaaaaaaaaa-k1", "bbbbbbbbbb-k2"]);
    }

    #[test]
    fn forward_values_map_protocol_tags() {
        assert_eq!(
            parse_forward_value("svc,http"),
            Some(("svc".to_string(), ServiceType::Http))
        );
        assert_eq!(
            parse_forward_value("svc,weird"),
            Some(("svc".to_string(), ServiceType::Custom))
        );
        assert_eq!(parse_forward_value("svc"), None);
    }

    #[test]
    fn cluster_name_from_object() {
        assert_eq!(parse_cluster_name(r#"{"Name":"prod"}"#).as_deref(), Some("prod"));
        assert_eq!(parse_cluster_name(r#"{}"#), None);
    }
}
