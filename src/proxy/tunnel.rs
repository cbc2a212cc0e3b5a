//! CONNECT tunnels for proxy-all mode
//!
//! The tunnel is opaque: bytes are copied in both directions without
//! inspection. Only host, byte counts and duration are observed.

use crate::capture::{PendingCapture, TunnelStats};
use crate::providers::{PassthroughPolicy, UNKNOWN_PROVIDER};
use crate::proxy::hot_path::ForwardingEngine;
use crate::proxy::types::ProxyError;
use axum::body::Body;
use axum::response::{IntoResponse, Response};
use hyper::upgrade::OnUpgrade;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::time::Instant;
use tokio::net::TcpStream;
use tracing::{info, info_span, warn, Instrument};

/// Answer a CONNECT request and spawn the tunnel
pub async fn connect<B>(engine: &ForwardingEngine, mut request: Request<B>) -> Response {
    if !engine.config().proxy_all {
        return ProxyError::MethodNotAllowed("CONNECT".to_string()).into_response();
    }

    let Some(authority) = request.uri().authority().cloned() else {
        return ProxyError::InvalidUpstream(format!("CONNECT target {} has no authority", request.uri()))
            .into_response();
    };
    let target = authority.as_str().to_string();

    let mut pending = (engine.config().passthrough == PassthroughPolicy::Record).then(|| {
        let mut pending =
            PendingCapture::new(UNKNOWN_PROVIDER, "CONNECT", &target, authority.host(), &target)
                .passthrough();
        pending.request_headers = engine.redactor().capture(request.headers());
        pending
    });

    let connect_timeout = engine.config().connect_timeout;
    let upstream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return fail(engine, pending, ProxyError::UpstreamConnection(format!("{target}: {e}"))),
        Err(_) => return fail(engine, pending, ProxyError::UpstreamTimeout(connect_timeout)),
    };

    if let Some(pending) = pending.as_mut() {
        pending.status_code = Some(200);
    }

    let on_upgrade = hyper::upgrade::on(&mut request);
    let recorder = engine.recorder().clone();
    let span = info_span!("tunnel", host = %target);
    tokio::spawn(
        async move {
            let (stats, error) = run(on_upgrade, upstream).await;
            info!(
                bytes_to_upstream = stats.bytes_to_upstream,
                bytes_to_client = stats.bytes_to_client,
                duration_ms = stats.duration_ms,
                "Tunnel closed"
            );
            if let Some(pending) = pending {
                recorder.record(pending.finish_tunnel(stats, error));
            }
        }
        .instrument(span),
    );

    Response::new(Body::empty())
}

async fn run(on_upgrade: OnUpgrade, mut upstream: TcpStream) -> (TunnelStats, Option<String>) {
    let started = Instant::now();
    let result = match on_upgrade.await {
        Ok(upgraded) => {
            let mut client = TokioIo::new(upgraded);
            tokio::io::copy_bidirectional(&mut client, &mut upstream)
                .await
                .map_err(|e| format!("tunnel error: {e}"))
        }
        Err(e) => Err(format!("upgrade failed: {e}")),
    };

    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    match result {
        Ok((bytes_to_upstream, bytes_to_client)) => (
            TunnelStats {
                bytes_to_upstream,
                bytes_to_client,
                duration_ms,
            },
            None,
        ),
        Err(e) => {
            warn!(error = %e, "Tunnel ended with an error");
            (
                TunnelStats {
                    bytes_to_upstream: 0,
                    bytes_to_client: 0,
                    duration_ms,
                },
                Some(e),
            )
        }
    }
}

fn fail(engine: &ForwardingEngine, pending: Option<PendingCapture>, error: ProxyError) -> Response {
    warn!(error = %error, "CONNECT failed");
    if let Some(pending) = pending {
        let stats = TunnelStats {
            bytes_to_upstream: 0,
            bytes_to_client: 0,
            duration_ms: pending.elapsed_ms(),
        };
        engine
            .recorder()
            .record(pending.finish_tunnel(stats, Some(error.record_message())));
    }
    error.into_response()
}
