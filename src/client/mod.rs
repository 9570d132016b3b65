//! Upstream protocol clients: a shared TCP session with deadlines, the
//! HTTP/1.1, msgpack-RPC, and raw length-framed clients, per-request
//! futures, and the per-destination pool.

pub mod future;
pub mod http;
pub mod pool;
pub mod raw;
pub mod rpc;
pub mod session;

pub use future::{CallOutcome, ClientFuture, PendingCalls, TIMEOUT_ERR};
pub use http::{HttpClient, HttpRequest, HttpResponse};
pub use pool::{ClientPool, MAX_CLIENTS_PER_DEST};
pub use raw::RawClient;
pub use rpc::{RpcClient, SERVER_RSP_TOO_LARGE_ERR};
pub use session::{ClientSession, SessionState};
