//! Middleware for the proxy and dashboard routers

use crate::proxy::error_response::ErrorResponse;
use crate::proxy::headers::{header_str, X_CAPTURE_ID};
use axum::{
    extract::Request,
    http::StatusCode,
    middleware::{from_fn, Next},
    response::Response,
    Router,
};
use std::any::Any;
use std::time::Instant;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{debug, error, info};

/// Logging middleware - logs request/response details with timing
///
/// Completion is logged when the response head is ready; streamed bodies may
/// still be flowing.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();

    debug!(method = %method, uri = %uri, "Incoming request");

    let response = next.run(request).await;

    info!(
        method = %method,
        path = %uri.path(),
        status = response.status().as_u16(),
        capture_id = header_str(response.headers(), X_CAPTURE_ID).unwrap_or("-"),
        duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        "Request completed"
    );

    response
}

/// Turn a handler panic into a 500 for that request only
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else {
        "unknown panic payload".to_string()
    };
    error!(panic = %detail, "Request handler panicked");

    ErrorResponse::new("INTERNAL_ERROR", "Internal server error")
        .into_response_with_status(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Apply the shared middleware stack (outermost last)
pub fn apply_stack<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(from_fn(logging_middleware))
        .layer(CatchPanicLayer::custom(panic_response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use tower::ServiceExt;

    fn router() -> Router {
        apply_stack(
            Router::new()
                .route("/ok", get(|| async { "fine" }))
                .route("/boom", get(boom)),
        )
    }

    async fn boom() -> &'static str {
        panic!("handler exploded")
    }

    #[tokio::test]
    async fn test_requests_pass_through_logging() {
        let response = router()
            .oneshot(Request::builder().uri("/ok").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_panic_becomes_500_and_router_survives() {
        let app = router();

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = app
            .oneshot(Request::builder().uri("/ok").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
