//! Front-end listeners: the length-framed driver protocol, the HTTP/1.1
//! app, and the msgpack-RPC port, all dispatching into the controller
//! router.

pub mod driver;
pub mod http;
pub mod router;
pub mod rpc;

pub use driver::{DriverServer, MAX_PAYLOAD};
pub use http::{create_app, HttpServer, SERVER_NAME};
pub use router::{ControllerRequest, ControllerResponse, DriverRouter};
pub use rpc::RpcFrontServer;
