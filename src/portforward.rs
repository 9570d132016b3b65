//! Dynamic port-forward listeners.
//!
//! Each listener binds an ephemeral port and bridges every accepted
//! connection to an instance of its bound service, chosen through the
//! routing table at accept time. The bridge is a plain byte pump with a
//! fixed 10 KiB slab per direction and no protocol awareness; when one side
//! reaches EOF or fails, the other side's write half is closed.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, RwLock};

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClientSession;
use crate::discovery::RoutingTable;
use crate::types::{ForwardInfo, ServiceType};

/// Copy slab size per pump direction.
const PUMP_BUF_SIZE: usize = 10 * 1024;

/// Node-selection attempts per accepted connection.
const CONNECT_RETRIES: usize = 3;

struct ListenerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    bindings: HashMap<u16, ForwardInfo>,
    listeners: HashMap<u16, ListenerHandle>,
}

/// Owns the dynamic listeners and their `port → service` bindings.
pub struct PortForwardManager {
    table: Arc<RoutingTable>,
    inner: RwLock<Inner>,
    cancel: CancellationToken,
}

impl PortForwardManager {
    pub fn new(table: Arc<RoutingTable>, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(PortForwardManager {
            table,
            inner: RwLock::new(Inner::default()),
            cancel,
        })
    }

    /// Binds a fresh ephemeral listener for `(service_name, service_type)`
    /// and returns the chosen port.
    pub async fn start_port_forward(
        self: &Arc<Self>,
        service_name: &str,
        service_type: ServiceType,
    ) -> io::Result<u16> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();
        let cancel = self.cancel.child_token();
        let task = {
            let mgr = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                mgr.accept_loop(listener, port, cancel).await;
            })
        };
        let mut inner = self.inner.write().expect("port forward lock poisoned");
        inner.listeners.insert(port, ListenerHandle { cancel, task });
        inner.bindings.insert(
            port,
            ForwardInfo {
                service_name: service_name.to_string(),
                service_type,
                port,
            },
        );
        info!(port, service = service_name, "begin forward server");
        Ok(port)
    }

    /// Rebinds an existing port to a different service.
    pub fn update_binding(&self, port: u16, service_name: &str, service_type: ServiceType) {
        let mut inner = self.inner.write().expect("port forward lock poisoned");
        inner.bindings.insert(
            port,
            ForwardInfo {
                service_name: service_name.to_string(),
                service_type,
                port,
            },
        );
        info!(port, service = service_name, "port is forwarding to service");
    }

    /// Current binding of `port`.
    pub fn forward_info(&self, port: u16) -> Option<ForwardInfo> {
        let inner = self.inner.read().expect("port forward lock poisoned");
        inner.bindings.get(&port).cloned()
    }

    /// Bindings for every live port.
    pub fn all_forward_services(&self) -> Vec<ForwardInfo> {
        let inner = self.inner.read().expect("port forward lock poisoned");
        inner.bindings.values().cloned().collect()
    }

    /// Closes one listener and drops its binding.
    pub fn stop_port_forward(&self, port: u16) {
        let handle = {
            let mut inner = self.inner.write().expect("port forward lock poisoned");
            inner.bindings.remove(&port);
            inner.listeners.remove(&port)
        };
        if let Some(handle) = handle {
            handle.cancel.cancel();
            handle.task.abort();
            info!(port, "port forward server stopped");
        }
    }

    /// Closes every listener.
    pub fn stop_all(&self) {
        let drained = {
            let mut inner = self.inner.write().expect("port forward lock poisoned");
            inner.bindings.clear();
            std::mem::take(&mut inner.listeners)
        };
        for (port, handle) in drained {
            handle.cancel.cancel();
            handle.task.abort();
            debug!(port, "port forward server stopped");
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, port: u16, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, _peer)) => {
                    let mgr = Arc::clone(&self);
                    tokio::spawn(async move {
                        mgr.bridge_connection(socket, port).await;
                    });
                }
                Err(e) => {
                    warn!(port, error = %e, "forward accept failed");
                    break;
                }
            }
        }
        debug!(port, "forward accept loop exited");
    }

    /// Opens the upstream side for one accepted connection. Node choice
    /// retries across the rotation; a custom binding falls back to the
    /// service's HTTP nodes when no custom nodes exist.
    async fn connect_upstream(&self, port: u16) -> Option<ClientSession> {
        let info = self.forward_info(port)?;
        let mut balance: usize = rand::thread_rng().gen_range(0..1000);
        for _ in 0..CONNECT_RETRIES {
            balance = balance.wrapping_add(1);
            let node = self
                .table
                .resolve(balance, &info.service_name, info.service_type)
                .or_else(|| {
                    if info.service_type == ServiceType::Custom {
                        self.table.resolve(balance, &info.service_name, ServiceType::Http)
                    } else {
                        None
                    }
                });
            let Some(node) = node else {
                info!(service = %info.service_name, "no machines for the forward service");
                return None;
            };
            let mut session = ClientSession::new(node.host.clone(), node.port.clone());
            session.set_timeout(0, 0);
            match session.connect().await {
                Ok(()) => return Some(session),
                Err(_) => {
                    info!(upstream = %node.address(), "failed connect forward service");
                    continue;
                }
            }
        }
        None
    }

    async fn bridge_connection(self: Arc<Self>, socket: TcpStream, port: u16) {
        let Some(mut upstream) = self.connect_upstream(port).await else {
            debug!(port, "failed to get the forward connection");
            return;
        };
        let Some(mut upstream_read) = upstream.take_read_half() else {
            return;
        };
        let (mut client_read, mut client_write) = socket.into_split();

        // Upstream → client runs on its own task; this task pumps
        // client → upstream. Each side half-closes its peer when done.
        let downstream = tokio::spawn(async move {
            let mut buf = [0u8; PUMP_BUF_SIZE];
            loop {
                match upstream_read.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if client_write.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "read from forward error");
                        break;
                    }
                }
            }
            let _ = client_write.shutdown().await;
        });

        let mut buf = [0u8; PUMP_BUF_SIZE];
        loop {
            match client_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if upstream.send_data(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "reading data error");
                    break;
                }
            }
        }
        upstream.shutdown(false);
        let _ = downstream.await;
        debug!(port, "forward connection closed");
    }
}
