//! HTTP error envelope and status mapping (spec §4.G/§7): `{code, message,
//! suggestion?, retryable?, request_id}`, internal detail elided unless
//! `DEBUG_ERRORS` is set.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fleetctl_core::CoreError;
use fleetctl_p2p::P2pError;
use serde::Serialize;
use std::sync::OnceLock;

fn debug_errors_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var("DEBUG_ERRORS").map(|v| v == "1").unwrap_or(false))
}

#[derive(Serialize)]
pub struct ErrorEnvelope {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<&'static str>,
    pub retryable: bool,
    pub request_id: String,
}

pub struct ServerError {
    pub status: StatusCode,
    pub envelope: ErrorEnvelope,
}

impl ServerError {
    pub fn from_core(error: CoreError, request_id: String) -> Self {
        let code = error.kind();
        let (status, retryable, suggestion) = match code {
            "not_found" => (StatusCode::NOT_FOUND, false, None),
            "validation" => (StatusCode::BAD_REQUEST, false, Some("check the request body against the documented schema")),
            "rate_limited" => (StatusCode::TOO_MANY_REQUESTS, true, Some("retry after the indicated delay")),
            "unavailable" => (StatusCode::SERVICE_UNAVAILABLE, true, None),
            "conflict" | "already_exists" => (StatusCode::CONFLICT, false, None),
            "security" => (StatusCode::FORBIDDEN, false, None),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, false, None),
        };

        let message = if debug_errors_enabled() || status != StatusCode::INTERNAL_SERVER_ERROR {
            error.to_string()
        } else {
            "internal error".to_string()
        };

        Self { status, envelope: ErrorEnvelope { code, message, suggestion, retryable, request_id } }
    }

    /// Maps the peer-to-peer control surface's error type (spec §4.J), which
    /// has no `CoreError` equivalent for timeouts/unknown peers.
    pub fn from_p2p(error: P2pError, request_id: String) -> Self {
        let (status, retryable, code) = match error {
            P2pError::PeerNotFound(_) => (StatusCode::NOT_FOUND, false, "not_found"),
            P2pError::Timeout => (StatusCode::GATEWAY_TIMEOUT, true, "unavailable"),
            P2pError::Closed => (StatusCode::SERVICE_UNAVAILABLE, true, "unavailable"),
            P2pError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, true, "rate_limited"),
            P2pError::Security(_) => (StatusCode::FORBIDDEN, false, "security"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, false, "internal"),
        };

        let message = if debug_errors_enabled() || status != StatusCode::INTERNAL_SERVER_ERROR {
            error.to_string()
        } else {
            "internal error".to_string()
        };

        Self { status, envelope: ErrorEnvelope { code, message, suggestion: None, retryable, request_id } }
    }

    pub fn rate_limited(request_id: String) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            envelope: ErrorEnvelope {
                code: "rate_limited",
                message: "too many requests".to_string(),
                suggestion: Some("retry after the indicated delay"),
                retryable: true,
                request_id,
            },
        }
    }

    pub fn bad_request(message: impl Into<String>, request_id: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            envelope: ErrorEnvelope { code: "validation", message: message.into(), suggestion: None, retryable: false, request_id },
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (self.status, Json(self.envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let err = ServerError::from_core(CoreError::NotFound("xmrig-rx0".into()), "req-1".into());
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn internal_errors_elide_detail_without_debug_errors() {
        let err = ServerError::from_core(CoreError::Internal("stack trace leaked here".into()), "req-2".into());
        assert_eq!(err.envelope.message, "internal error");
    }
}
