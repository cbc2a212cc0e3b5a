//! Main proxy service implementation
//!
//! `ProxyService` owns the axum router (dashboard under its reserved prefix,
//! everything else to the forwarding engine) and answers CONNECT before
//! routing, since tunnels need the raw upgraded connection.
//!
//! ```rust,ignore
//! let service = ProxyService::new(engine, dashboard_state);
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//! serve(listener, service, shutdown_signal, Duration::from_secs(5)).await;
//! ```

use crate::dashboard::{self, DashboardState};
use crate::proxy::headers::DASHBOARD_PREFIX;
use crate::proxy::hot_path::ForwardingEngine;
use crate::proxy::middleware::apply_stack;
use crate::proxy::streaming::BoxError;
use crate::proxy::tunnel;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use hyper::body::Incoming;
use hyper::Method;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceExt;
use tracing::{debug, info, warn};

/// Pause after a failed accept so descriptor exhaustion does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Proxy surface combining the dashboard and the forwarding engine
#[derive(Clone)]
pub struct ProxyService {
    engine: ForwardingEngine,
    router: Router,
}

impl ProxyService {
    pub fn new(engine: ForwardingEngine, dashboard: DashboardState) -> Self {
        let router = Router::new()
            .nest(DASHBOARD_PREFIX, dashboard::routes(dashboard))
            .fallback(proxy_handler)
            .with_state(engine.clone());

        Self {
            engine,
            router: apply_stack(router),
        }
    }

    pub fn engine(&self) -> &ForwardingEngine {
        &self.engine
    }

    /// The routed part of the surface, without CONNECT handling
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Answer one request from an accepted connection
    pub async fn dispatch<B>(&self, request: hyper::Request<B>) -> Response
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if request.method() == Method::CONNECT {
            return tunnel::connect(&self.engine, request).await;
        }

        match self.router.clone().oneshot(request.map(Body::new)).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}

/// Axum fallback: everything outside the dashboard is forwarded
async fn proxy_handler(State(engine): State<ForwardingEngine>, request: Request) -> Response {
    engine.handle(request).await
}

/// Accept connections until `shutdown` resolves, then drain for at most
/// `drain_timeout`
pub async fn serve<F>(listener: TcpListener, service: ProxyService, shutdown: F, drain_timeout: Duration)
where
    F: Future<Output = ()> + Send,
{
    let graceful = GracefulShutdown::new();
    let builder = auto::Builder::new(TokioExecutor::new());
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };

                let service = service.clone();
                let hyper_service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                    let service = service.clone();
                    async move { Ok::<_, Infallible>(service.dispatch(request).await) }
                });

                let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), hyper_service);
                let conn = graceful.watch(conn.into_owned());
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(peer = %peer, error = %e, "Connection closed with error");
                    }
                });
            }
            () = &mut shutdown => break,
        }
    }

    drop(listener);
    info!("Listener closed, draining open connections");
    tokio::select! {
        () = graceful.shutdown() => debug!("All connections closed"),
        () = tokio::time::sleep(drain_timeout) => {
            warn!(timeout_ms = u64::try_from(drain_timeout.as_millis()).unwrap_or(u64::MAX), "Connections still open after drain timeout");
        }
    }
}
