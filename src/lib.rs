//! # FIBP — multi-protocol service gateway
//!
//! A long-running process that accepts client requests on three front-end
//! listeners (a length-framed binary driver protocol, HTTP/1.1, and a
//! msgpack-RPC port), resolves logical service names against a discovery
//! registry, and fans each batch out to upstream services speaking HTTP,
//! msgpack-RPC, or a raw length-framed protocol. Responses aggregate in
//! request order and may take part in a confirm/cancel transaction. A
//! second control plane runs dynamic port-forward listeners that bridge
//! arbitrary TCP traffic to discovered services.
//!
//! ## Architecture
//!
//! - [`runtime`]: the capped task pool every dispatch goes through
//! - [`client`]: protocol clients, per-request futures, and the
//!   per-destination pool
//! - [`discovery`]: the routing table and the registry long-poll watchers
//! - [`forward`]: the fan-out/aggregation orchestrator with retries,
//!   caching, and transactions
//! - [`portforward`]: dynamic TCP listeners bridging ports to services
//! - [`request_log`]: the per-request record ring and its shipper
//! - [`server`]: the three front-end listeners and the controller router
//! - [`gateway`]: process wiring with an `init → run → stop` lifecycle

pub mod cache;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod forward;
pub mod gateway;
pub mod portforward;
pub mod request_log;
pub mod runtime;
pub mod server;
pub mod transaction;
pub mod types;

pub use crate::cache::ServiceCache;
pub use crate::client::ClientPool;
pub use crate::config::GatewayConfig;
pub use crate::discovery::{RoutingTable, ServiceDiscovery};
pub use crate::error::{FibpError, Result};
pub use crate::forward::ForwardManager;
pub use crate::gateway::Gateway;
pub use crate::portforward::PortForwardManager;
pub use crate::request_log::RequestLog;
pub use crate::runtime::TaskPool;
pub use crate::server::{DriverRouter, DriverServer, HttpServer, RpcFrontServer};
pub use crate::types::{
    ForwardInfo, HttpMethod, ServiceCallReq, ServiceCallRsp, ServiceNode, ServiceType,
};
