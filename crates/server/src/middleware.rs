//! Middleware stack (spec §4.G), applied in order: request-id injection,
//! structured logging, per-IP token-bucket rate limiting, body-size limit,
//! and response-timeout with a single-writer guard. Path-parameter
//! validators live alongside the route handlers in `routes.rs`.

use axum::body::Body;
use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const MAX_BODY_BYTES: usize = 1024 * 1024;
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub type IpRateLimiter = DefaultKeyedRateLimiter<IpAddr>;

/// One token bucket per client IP (spec §4.G). 20 requests/sec, burst 40.
pub fn new_rate_limiter() -> Arc<IpRateLimiter> {
    let quota = Quota::per_second(NonZeroU32::new(20).expect("nonzero")).allow_burst(NonZeroU32::new(40).expect("nonzero"));
    Arc::new(RateLimiter::keyed(quota))
}

pub async fn request_id(mut request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[derive(Clone)]
pub struct RequestId(pub String);

pub async fn structured_logging(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = std::time::Instant::now();

    let response = next.run(request).await;

    info!(%method, %path, status = response.status().as_u16(), elapsed_ms = start.elapsed().as_millis() as u64, "request handled");
    response
}

pub async fn rate_limit(
    axum::extract::State(limiter): axum::extract::State<Arc<IpRateLimiter>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if limiter.check_key(&addr.ip()).is_err() {
        warn!(ip = %addr.ip(), "request rejected by per-IP rate limiter");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }
    Ok(next.run(request).await)
}

/// Coordinates the timeout branch and the handler through a single atomic
/// flag so only one ever writes to the response (spec §4.G, invariant 10).
pub async fn timeout_guard(request: Request, next: Next) -> Response {
    let committed = Arc::new(AtomicBool::new(false));
    let handler_committed = committed.clone();

    let work = async move {
        let response = next.run(request).await;
        handler_committed.store(true, Ordering::SeqCst);
        response
    };

    match tokio::time::timeout(REQUEST_TIMEOUT, work).await {
        Ok(response) => response,
        Err(_) => {
            if committed.swap(true, Ordering::SeqCst) {
                // Handler finished between the timeout firing and this check;
                // its response already committed, nothing further to send.
                Response::builder().status(StatusCode::INTERNAL_SERVER_ERROR).body(Body::empty()).expect("static status and empty body always build")
            } else {
                Response::builder().status(StatusCode::GATEWAY_TIMEOUT).body(Body::empty()).expect("static status and empty body always build")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_quota_allows_configured_burst() {
        let limiter = new_rate_limiter();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..40 {
            assert!(limiter.check_key(&ip).is_ok());
        }
        assert!(limiter.check_key(&ip).is_err());
    }
}
