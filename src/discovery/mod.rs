//! Service discovery: the routing table, the registry payload parsers, and
//! the long-poll watcher loops.

pub mod catalog;
pub mod table;
pub mod watcher;

pub use catalog::{AGENT_ID_LEN, FORWARD_PORT_PREFIX};
pub use table::{NodesByType, RoutingTable};
pub use watcher::ServiceDiscovery;
