use std::time::Instant;

use axum::body::Body;
use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

pub static X_TRACE_ID: &str = "x-trace-id";

/// Wrap each request in a span keyed by a trace id, echoed back in the
/// response. A caller-supplied `x-trace-id` is honoured when it is a UUID.
pub async fn trace_middleware(mut req: Request<Body>, next: Next) -> Response {
    let start_time = Instant::now();

    let trace_id = req
        .headers()
        .get(X_TRACE_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);
    // A hyphenated UUID is always a valid header value.
    let header = HeaderValue::from_str(&trace_id.to_string()).ok();

    let span = info_span!(
        "http_request",
        trace_id = %trace_id,
        method = %req.method(),
        path = %req.uri().path(),
    );

    async move {
        info!("→ request started");
        if let Some(h) = &header {
            req.headers_mut().insert(X_TRACE_ID, h.clone());
        }

        let mut response = next.run(req).await;

        if let Some(h) = header {
            response.headers_mut().insert(X_TRACE_ID, h);
        }
        info!(
            status = response.status().as_u16(),
            latency_ms = start_time.elapsed().as_millis(),
            "← response finished"
        );
        response
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::get;
    use tower::ServiceExt;
    use tracing_test::traced_test;

    fn app() -> Router {
        Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(axum::middleware::from_fn(trace_middleware))
    }

    #[tokio::test]
    #[traced_test]
    async fn caller_trace_id_is_echoed() {
        let id = Uuid::new_v4().to_string();
        let req = axum::http::Request::builder().uri("/ping").header(X_TRACE_ID, &id).body(Body::empty()).expect("request");
        let resp = app().oneshot(req).await.expect("response");
        assert_eq!(resp.headers().get(X_TRACE_ID).and_then(|v| v.to_str().ok()), Some(id.as_str()));
        assert!(logs_contain("response finished"));
    }

    #[tokio::test]
    async fn malformed_trace_id_is_replaced() {
        let req = axum::http::Request::builder().uri("/ping").header(X_TRACE_ID, "nope").body(Body::empty()).expect("request");
        let resp = app().oneshot(req).await.expect("response");
        let echoed = resp.headers().get(X_TRACE_ID).and_then(|v| v.to_str().ok()).expect("header");
        assert!(Uuid::parse_str(echoed).is_ok());
    }
}
