//! Error codes and JSON error responses for the gateway

use crate::router::GatewayResponse;
use hyper::body::Bytes;
use hyper::StatusCode;
use serde::Serialize;

/// Header carrying the machine-readable error code
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Required `machine_no` query parameter absent
    MissingMachineNo,
    /// `machine_no` not an integer or out of range
    InvalidMachineNo,
    /// `shift` not an integer in 0..=2
    InvalidShift,
    /// No service listening on the resolved port
    MachineOffline,
    /// Forwarding to the backend failed
    UpstreamFailed,
    /// Path not registered
    RouteNotFound,
    /// Only GET is routed
    MethodNotAllowed,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// HTTP status used for this error.
    ///
    /// Parameter and offline errors are answered with 200 and an error body,
    /// which is what existing clients of the gateway check for.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::MissingMachineNo => StatusCode::OK,
            GatewayErrorCode::InvalidMachineNo => StatusCode::OK,
            GatewayErrorCode::InvalidShift => StatusCode::OK,
            GatewayErrorCode::MachineOffline => StatusCode::OK,
            GatewayErrorCode::UpstreamFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::MissingMachineNo => "MISSING_MACHINE_NO",
            GatewayErrorCode::InvalidMachineNo => "INVALID_MACHINE_NO",
            GatewayErrorCode::InvalidShift => "INVALID_SHIFT",
            GatewayErrorCode::MachineOffline => "MACHINE_OFFLINE",
            GatewayErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            GatewayErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            GatewayErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error_log: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error_log: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error_log":"{}"}}"#,
                self.error_log.replace('\\', "\\\\").replace('"', "\\\"")
            )
        })
    }
}

/// Create a JSON error response tagged with its error code
pub fn json_error_response(code: GatewayErrorCode, message: impl Into<String>) -> GatewayResponse {
    let body = ErrorResponse::new(message).to_json();
    GatewayResponse {
        status: code.status_code(),
        content_type: "application/json",
        error_code: Some(code),
        body: Bytes::from(body),
    }
}
