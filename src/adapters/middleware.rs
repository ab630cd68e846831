//! Axum middleware attached to the hub's public router.
//!
//! Request timing, per-request ids and the basic-auth gate in front of the admin
//! API. All of them are plain `from_fn` layers without state of their own.
use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderValue, StatusCode, header},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

use crate::{ports::credentials::CredentialChecker, tracing_setup::create_request_span};

/// Response header carrying the request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Log start/end of a request including latency.
pub async fn request_timing_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    tracing::debug!("Started processing {} {}", method, uri);

    let response = next.run(req).await;
    let duration = start.elapsed();

    let span = tracing::Span::current();
    span.record("http.status_code", response.status().as_u16());
    span.record("duration_ms", duration.as_millis() as u64);
    tracing::info!(
        "Completed {} {} - {} in {:?}",
        method,
        uri,
        response.status(),
        duration
    );

    response
}

/// Reuse the caller's `X-Request-ID` or generate one, run the request inside a
/// request span and echo the id back.
pub async fn request_id_middleware(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = create_request_span(req.method().as_str(), req.uri().path(), &request_id);
    let mut response = next.run(req).instrument(span).await;

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header_value);
    }

    response
}

/// Gate a router behind basic auth. Without a checker every request is refused.
pub async fn basic_auth_middleware(
    req: Request,
    next: Next,
    checker: Option<Arc<dyn CredentialChecker>>,
    realm: Arc<str>,
) -> Response {
    if checker.as_ref().is_some_and(|c| c.check(req.headers())) {
        return next.run(req).await;
    }

    tracing::debug!("Rejected unauthenticated request to {}", req.uri().path());
    let mut response = Response::new(Body::from("Unauthorized"));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{realm}\", charset=\"UTF-8\"")) {
        response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

/// Create a cloneable closure wrapping [`basic_auth_middleware`]. The realm is copied,
/// so the closure does not borrow from the caller.
pub fn create_basic_auth_middleware(
    checker: Option<Arc<dyn CredentialChecker>>,
    realm: &str,
) -> impl Fn(Request, Next) -> std::pin::Pin<Box<dyn std::future::Future<Output = Response> + Send>>
+ Clone
+ use<> {
    let realm: Arc<str> = Arc::from(realm);
    move |req, next| {
        let checker = checker.clone();
        let realm = realm.clone();
        Box::pin(async move { basic_auth_middleware(req, next, checker, realm).await })
    }
}
