//! HTTP/1.1 front end.
//!
//! Thin axum app over the controller router: any request path is read as
//! `/{controller}/{action}/…`, the JSON body is handed to the controller,
//! and the answer is always 200 with per-row errors in the document —
//! upstream failures never become transport failures. Every response
//! carries the `Server: FibpServer 1.0` header.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::limit::ConcurrencyLimitLayer;
use tracing::{debug, info};

use crate::error::{FibpError, Result};
use crate::server::router::{ControllerRequest, ControllerResponse, DriverRouter};
use crate::types::HttpMethod;

/// Server header stamped on every response.
pub const SERVER_NAME: &str = "FibpServer 1.0";

/// Concurrent in-flight requests served by this front end. Excess
/// connections queue at the listener instead of piling up dispatch tasks.
const MAX_INFLIGHT_REQUESTS: usize = 1_024;

/// Builds the front-end app around the controller router.
pub fn create_app(router: Arc<DriverRouter>) -> Router {
    Router::new()
        .fallback(handle)
        .layer(ConcurrencyLimitLayer::new(MAX_INFLIGHT_REQUESTS))
        .with_state(router)
}

async fn handle(
    State(router): State<Arc<DriverRouter>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();
    let rsp = if segments.len() < 2 {
        ControllerResponse::error("Handler not found")
    } else {
        router
            .dispatch(ControllerRequest {
                controller: segments[0].to_string(),
                action: segments[1].to_string(),
                path: path.clone(),
                method: HttpMethod::from_name(method.as_str()),
                body,
            })
            .await
    };
    render(rsp)
}

fn render(rsp: ControllerResponse) -> Response {
    let (content_type, body) = match rsp.raw {
        Some(raw) => ("application/octet-stream", raw),
        None => ("application/json", Bytes::from(rsp.value.to_string())),
    };
    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// The HTTP front-end acceptor.
pub struct HttpServer {
    listener: TcpListener,
    app: Router,
    cancel: CancellationToken,
}

impl HttpServer {
    pub async fn bind(
        port: u16,
        router: Arc<DriverRouter>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| FibpError::Listen { addr, source })?;
        info!(port, "http server listening");
        Ok(HttpServer {
            listener,
            app: create_app(router),
            cancel,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Serves until cancelled.
    pub async fn run(self) {
        let shutdown = self.cancel.cancelled_owned();
        if let Err(e) = axum::serve(self.listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            debug!(error = %e, "http server exited with error");
        }
    }
}
