//! Process wiring: builds every component, starts the listeners and
//! background tasks, and tears them down in order.
//!
//! Lifecycle is `init → run → stop`; a gateway instance cannot be
//! re-initialized.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::{ServiceCache, DEFAULT_CACHE_CAPACITY};
use crate::client::ClientPool;
use crate::config::{GatewayConfig, HostPort};
use crate::discovery::{RoutingTable, ServiceDiscovery};
use crate::error::Result;
use crate::forward::ForwardManager;
use crate::portforward::PortForwardManager;
use crate::request_log::shipper::LogShipper;
use crate::request_log::RequestLog;
use crate::runtime::TaskPool;
use crate::server::{DriverRouter, DriverServer, HttpServer, RpcFrontServer};

/// A fully wired gateway process.
pub struct Gateway {
    cancel: CancellationToken,
    tasks: TaskPool,
    forward: Arc<ForwardManager>,
    server_handles: Vec<JoinHandle<()>>,
    background_handles: Vec<JoinHandle<()>>,
    driver_port: u16,
    http_port: u16,
    rpc_port: u16,
}

impl Gateway {
    /// Builds every component and binds the three front-end listeners.
    pub async fn init(config: &GatewayConfig) -> Result<Gateway> {
        let cancel = CancellationToken::new();
        let tasks = TaskPool::default();

        let table = Arc::new(RoutingTable::new());
        let pool = Arc::new(ClientPool::new());
        let cache = Arc::new(ServiceCache::new(DEFAULT_CACHE_CAPACITY));
        let request_log = Arc::new(RequestLog::new(config.ring_capacity.into_inner()));
        let forwards = PortForwardManager::new(Arc::clone(&table), cancel.child_token());
        let forward = ForwardManager::new(
            pool,
            Arc::clone(&table),
            cache,
            tasks.clone(),
            Arc::clone(&request_log),
            Arc::clone(&forwards),
        );

        let report_addr = config.report_addr.clone().unwrap_or_else(|| HostPort {
            host: config.registry_addrs[0].host.clone(),
            port: config.registry_addrs[0].port.clone(),
        });

        let mut background_handles = Vec::new();

        let shipper = LogShipper::new(
            Arc::clone(&request_log),
            Arc::clone(&table),
            config.log_server.clone(),
            config.log_service.clone(),
            cancel.child_token(),
        );
        background_handles.push(tokio::spawn(shipper.run()));

        let discovery = ServiceDiscovery::new(
            config.registry_addrs.clone(),
            report_addr,
            Arc::clone(&table),
            Arc::clone(&forwards),
            Arc::clone(&request_log),
            cancel.child_token(),
        );
        background_handles.extend(discovery.start());

        let router = DriverRouter::new(
            Arc::clone(&forward),
            Arc::clone(&request_log),
            config.enable_test,
        );
        let driver = DriverServer::bind(
            config.driver_port(),
            Arc::clone(&router),
            cancel.child_token(),
        )
        .await?;
        let http = HttpServer::bind(
            config.http_port(),
            Arc::clone(&router),
            cancel.child_token(),
        )
        .await?;
        let rpc = RpcFrontServer::bind(
            config.rpc_port(),
            Arc::clone(&forward),
            Arc::clone(&request_log),
            cancel.child_token(),
        )
        .await?;

        let driver_port = driver.local_port();
        let http_port = http.local_port();
        let rpc_port = rpc.local_port();

        let server_handles = vec![
            tokio::spawn(driver.run()),
            tokio::spawn(http.run()),
            tokio::spawn(rpc.run()),
        ];

        info!(driver_port, http_port, rpc_port, "gateway started");
        Ok(Gateway {
            cancel,
            tasks,
            forward,
            server_handles,
            background_handles,
            driver_port,
            http_port,
            rpc_port,
        })
    }

    pub fn driver_port(&self) -> u16 {
        self.driver_port
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn rpc_port(&self) -> u16 {
        self.rpc_port
    }

    /// Waits until the process is asked to stop (ctrl-c or an internal
    /// cancel), then shuts down.
    pub async fn run(&mut self) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
            }
            _ = self.cancel.cancelled() => {}
        }
        self.stop().await;
    }

    /// Ordered shutdown: listeners first, then the dispatch engine and
    /// background tasks.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.tasks.stop();
        self.forward.stop();
        let _ = futures::future::join_all(self.server_handles.drain(..)).await;
        for handle in self.background_handles.drain(..) {
            handle.abort();
        }
        info!("gateway stopped");
    }
}
