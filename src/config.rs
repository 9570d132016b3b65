//! Gateway configuration.
//!
//! Config lives in `config.xml` under the `--config-dir` directory. The XML
//! layout mirrors the historical deployment schema (`System` and
//! `Deployment` sections with attribute-carried values); it is deserialized
//! into raw serde structs and then validated into [`GatewayConfig`], whose
//! scalars are domain newtypes.
//!
//! The three front-end listeners derive from one base port: driver on
//! `port`, HTTP on `port + 1`, msgpack-RPC on `port + 2`.

use std::path::Path;

use nutype::nutype;
use serde::Deserialize;

use crate::error::{FibpError, Result};

/// Base TCP port of the driver listener. HTTP and RPC listeners use the two
/// ports above it, so the base must leave room for them.
#[nutype(
    validate(less_or_equal = 65533),
    derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)
)]
pub struct ListenPort(u16);

/// Number of reactor worker threads.
#[nutype(
    validate(greater = 0, less_or_equal = 256),
    derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)
)]
pub struct WorkerThreadCount(usize);

/// Capacity of the request-log ring.
#[nutype(
    validate(greater = 0),
    derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)
)]
pub struct RingCapacity(usize);

/// `host:port` address pair, already split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: String,
}

impl HostPort {
    /// Parses `host:port`. Rejects anything without exactly one colon
    /// separating two non-empty halves.
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = s
            .split_once(':')
            .ok_or_else(|| FibpError::Config(format!("address must be host:port, got {s:?}")))?;
        if host.is_empty() || port.is_empty() {
            return Err(FibpError::Config(format!(
                "address must be host:port, got {s:?}"
            )));
        }
        Ok(HostPort {
            host: host.to_string(),
            port: port.to_string(),
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parses a comma-separated registry address list.
pub fn parse_address_list(s: &str) -> Vec<HostPort> {
    s.split(',')
        .filter(|part| !part.trim().is_empty())
        .filter_map(|part| HostPort::parse(part.trim()).ok())
        .collect()
}

// Raw XML shape. Attribute values stay as primitives here; validation
// happens when building `GatewayConfig`.

#[derive(Debug, Deserialize)]
#[serde(rename = "FibpConfig")]
struct RawConfig {
    #[serde(rename = "System")]
    system: RawSystem,
    #[serde(rename = "Deployment")]
    deployment: RawDeployment,
}

#[derive(Debug, Deserialize)]
struct RawSystem {
    #[serde(rename = "WorkingDir", default)]
    working_dir: Option<RawWorkingDir>,
    #[serde(rename = "LogServerConnection")]
    log_server: RawLogServer,
}

#[derive(Debug, Deserialize)]
struct RawWorkingDir {
    #[serde(rename = "@path")]
    path: String,
}

#[derive(Debug, Deserialize)]
struct RawLogServer {
    #[serde(rename = "@host")]
    host: String,
    #[serde(rename = "@port")]
    port: String,
    #[serde(rename = "@log_service")]
    log_service: String,
    #[serde(rename = "@log_tag", default)]
    log_tag: String,
}

#[derive(Debug, Deserialize)]
struct RawDeployment {
    #[serde(rename = "BrokerAgent")]
    broker_agent: RawBrokerAgent,
    #[serde(rename = "DistributedCommon", default)]
    distributed_common: Option<RawDistributedCommon>,
    #[serde(rename = "DistributedUtil")]
    distributed_util: RawDistributedUtil,
}

#[derive(Debug, Deserialize)]
struct RawBrokerAgent {
    #[serde(rename = "@port")]
    port: u16,
    #[serde(rename = "@threadnum", default)]
    threadnum: Option<usize>,
    #[serde(rename = "@enabletest", default)]
    enabletest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDistributedCommon {
    #[serde(rename = "@localhost", default)]
    localhost: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDistributedUtil {
    #[serde(rename = "ServiceDiscovery")]
    service_discovery: RawServiceDiscovery,
}

#[derive(Debug, Deserialize)]
struct RawServiceDiscovery {
    #[serde(rename = "@servers")]
    servers: String,
}

/// Validated gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Driver listener port; HTTP is `+1`, RPC is `+2`.
    pub port: ListenPort,
    pub thread_num: WorkerThreadCount,
    pub enable_test: bool,
    pub working_dir: Option<String>,
    pub local_host: String,
    /// External log/metrics sink.
    pub log_server: HostPort,
    /// Service name used to rediscover the log sink through the routing
    /// table when shipping fails.
    pub log_service: String,
    pub log_tag: String,
    /// Consul-compatible registry addresses, rotated on poll failure.
    pub registry_addrs: Vec<HostPort>,
    /// Cluster-report endpoint; defaults to the registry when unset.
    pub report_addr: Option<HostPort>,
    pub ring_capacity: RingCapacity,
}

impl GatewayConfig {
    /// Loads and validates `config.xml` from `config_dir`.
    pub fn load(config_dir: &Path) -> Result<Self> {
        if !config_dir.is_dir() {
            return Err(FibpError::Config(format!(
                "config dir does not exist: {}",
                config_dir.display()
            )));
        }
        let path = config_dir.join("config.xml");
        let text = std::fs::read_to_string(&path)?;
        Self::from_xml(&text)
    }

    /// Parses the XML document body.
    pub fn from_xml(text: &str) -> Result<Self> {
        let raw: RawConfig = quick_xml::de::from_str(text)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let port = ListenPort::try_new(raw.deployment.broker_agent.port)
            .map_err(|e| FibpError::Config(format!("BrokerAgent port: {e}")))?;
        let threads = raw
            .deployment
            .broker_agent
            .threadnum
            .unwrap_or_else(num_cpus::get);
        let thread_num = WorkerThreadCount::try_new(threads)
            .map_err(|e| FibpError::Config(format!("BrokerAgent threadnum: {e}")))?;
        let enable_test = matches!(
            raw.deployment.broker_agent.enabletest.as_deref(),
            Some("y") | Some("Y") | Some("yes") | Some("true")
        );

        let registry_addrs = parse_address_list(&raw.deployment.distributed_util.service_discovery.servers);
        if registry_addrs.is_empty() {
            return Err(FibpError::Config(
                "ServiceDiscovery servers list is empty".to_string(),
            ));
        }

        Ok(GatewayConfig {
            port,
            thread_num,
            enable_test,
            working_dir: raw.system.working_dir.map(|w| w.path),
            local_host: raw
                .deployment
                .distributed_common
                .and_then(|c| c.localhost)
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            log_server: HostPort {
                host: raw.system.log_server.host,
                port: raw.system.log_server.port,
            },
            log_service: raw.system.log_server.log_service,
            log_tag: raw.system.log_server.log_tag,
            registry_addrs,
            report_addr: None,
            ring_capacity: RingCapacity::try_new(DEFAULT_RING_CAPACITY)
                .expect("default ring capacity is positive"),
        })
    }

    pub fn driver_port(&self) -> u16 {
        self.port.into_inner()
    }

    pub fn http_port(&self) -> u16 {
        self.port.into_inner() + 1
    }

    pub fn rpc_port(&self) -> u16 {
        self.port.into_inner() + 2
    }
}

/// Slots in the request-log ring.
pub const DEFAULT_RING_CAPACITY: usize = 1_000_000;
