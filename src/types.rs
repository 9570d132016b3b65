//! Common request/response types shared by the front-end servers, the
//! forward manager, and the protocol clients.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// HTTP verb carried by a service call. The numeric values are part of the
/// driver and RPC wire contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Delete,
    Get,
    Head,
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Delete => "DELETE",
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        }
    }

    /// Unknown names fall back to POST, matching the gateway's historical
    /// request parser.
    pub fn from_name(name: &str) -> Self {
        match name {
            "DELETE" => HttpMethod::Delete,
            "GET" => HttpMethod::Get,
            "HEAD" => HttpMethod::Head,
            "PUT" => HttpMethod::Put,
            _ => HttpMethod::Post,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            HttpMethod::Delete => 0,
            HttpMethod::Get => 1,
            HttpMethod::Head => 2,
            HttpMethod::Post => 3,
            HttpMethod::Put => 4,
        }
    }

    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => HttpMethod::Delete,
            1 => HttpMethod::Get,
            2 => HttpMethod::Head,
            4 => HttpMethod::Put,
            _ => HttpMethod::Post,
        }
    }
}

/// Protocol an upstream service speaks. The numeric values are part of the
/// driver and RPC wire contracts and index the per-type routing tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceType {
    Http,
    Rpc,
    Raw,
    Custom,
}

impl ServiceType {
    /// Number of routing-table slots (one per variant).
    pub const COUNT: usize = 4;

    pub fn as_u32(self) -> u32 {
        match self {
            ServiceType::Http => 0,
            ServiceType::Rpc => 1,
            ServiceType::Raw => 2,
            ServiceType::Custom => 3,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(ServiceType::Http),
            1 => Some(ServiceType::Rpc),
            2 => Some(ServiceType::Raw),
            3 => Some(ServiceType::Custom),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self.as_u32() as usize
    }

    /// Registry tag names map onto service types; any other tag is a cluster
    /// tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "http" => Some(ServiceType::Http),
            "rpc" => Some(ServiceType::Rpc),
            "raw" => Some(ServiceType::Raw),
            _ => None,
        }
    }
}

/// Cluster tag used when a service carries no explicit cluster.
pub const DEFAULT_CLUSTER: &str = "dev";

/// One upstream invocation inside a batch. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCallReq {
    pub service_name: String,
    /// Path for HTTP upstreams, method name for RPC, opaque tag for raw.
    pub service_api: String,
    pub method: HttpMethod,
    /// Opaque body; already msgpack-wrapped for RPC upstreams.
    pub service_req_data: Bytes,
    pub service_cluster: String,
    pub service_type: ServiceType,
    pub enable_cache: bool,
}

impl Default for ServiceCallReq {
    fn default() -> Self {
        ServiceCallReq {
            service_name: String::new(),
            service_api: String::new(),
            method: HttpMethod::Post,
            service_req_data: Bytes::new(),
            service_cluster: DEFAULT_CLUSTER.to_string(),
            service_type: ServiceType::Http,
            enable_cache: false,
        }
    }
}

impl ServiceCallReq {
    /// Cache fingerprint: every field except `enable_cache` participates.
    pub fn fingerprint(&self) -> CallFingerprint {
        CallFingerprint {
            service_name: self.service_name.clone(),
            service_api: self.service_api.clone(),
            method: self.method,
            service_req_data: self.service_req_data.clone(),
            service_cluster: self.service_cluster.clone(),
            service_type: self.service_type,
        }
    }
}

/// Key of the response cache; see [`ServiceCallReq::fingerprint`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallFingerprint {
    service_name: String,
    service_api: String,
    method: HttpMethod,
    service_req_data: Bytes,
    service_cluster: String,
    service_type: ServiceType,
}

/// Response paired with one [`ServiceCallReq`]. `error` is empty on success.
#[derive(Debug, Clone, Default)]
pub struct ServiceCallRsp {
    pub service_name: String,
    pub rsp: Bytes,
    pub error: String,
    pub is_cached: bool,
    pub host: String,
    pub port: String,
}

impl ServiceCallRsp {
    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}

/// A healthy instance of a service, as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceNode {
    pub host: String,
    pub port: String,
}

impl ServiceNode {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        ServiceNode {
            host: host.into(),
            port: port.into(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A dynamic port binding: traffic accepted on `port` is bridged to the
/// chosen instance of `service_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardInfo {
    pub service_name: String,
    pub service_type: ServiceType,
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_name_round_trip_with_post_fallback() {
        assert_eq!(HttpMethod::from_name("GET"), HttpMethod::Get);
        assert_eq!(HttpMethod::from_name("DELETE"), HttpMethod::Delete);
        assert_eq!(HttpMethod::from_name("banana"), HttpMethod::Post);
        assert_eq!(HttpMethod::from_u32(HttpMethod::Put.as_u32()), HttpMethod::Put);
    }

    #[test]
    fn service_type_tags() {
        assert_eq!(ServiceType::from_tag("http"), Some(ServiceType::Http));
        assert_eq!(ServiceType::from_tag("rpc"), Some(ServiceType::Rpc));
        assert_eq!(ServiceType::from_tag("raw"), Some(ServiceType::Raw));
        assert_eq!(ServiceType::from_tag("canary"), None);
    }

    #[test]
    fn fingerprint_ignores_cache_flag() {
        let mut a = ServiceCallReq {
            service_name: "echo".into(),
            service_api: "/ping".into(),
            ..Default::default()
        };
        let mut b = a.clone();
        a.enable_cache = true;
        b.enable_cache = false;
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
