//! Error handling and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Response header echoing the request origin on rejections, so
/// cross-origin callers can read the rejection.
pub const ACCESS_CONTROL_ALLOW_ORIGIN: &str = "access-control-allow-origin";

/// Error codes for admission rejections and proxy failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Request origin is not in the configured allow-list
    OriginDenied,
    /// Source identity (IP or source header) could not be determined
    SourceUndetectable,
    /// Client IP is not in the configured allow-list
    IpDenied,
    /// Per-source or global concurrent connection limit exceeded
    ConnectionLimitExceeded,
    /// Declared request body exceeds the configured maximum
    PayloadTooLarge,
    /// Selected backend is at its configured connection limit
    BackendSaturated,
    /// Failed to connect to or read from the backend
    ConnectionFailed,
    /// Request transfer timed out waiting for the backend
    RequestTimeout,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::OriginDenied => StatusCode::FORBIDDEN,
            ProxyErrorCode::SourceUndetectable => StatusCode::BAD_REQUEST,
            ProxyErrorCode::IpDenied => StatusCode::FORBIDDEN,
            ProxyErrorCode::ConnectionLimitExceeded => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyErrorCode::BackendSaturated => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::OriginDenied => "ORIGIN_DENIED",
            ProxyErrorCode::SourceUndetectable => "SOURCE_UNDETECTABLE",
            ProxyErrorCode::IpDenied => "IP_DENIED",
            ProxyErrorCode::ConnectionLimitExceeded => "CONNECTION_LIMIT_EXCEEDED",
            ProxyErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ProxyErrorCode::BackendSaturated => "BACKEND_SATURATED",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with an X-Proxy-Error header.
///
/// When the rejected request supplied an `Origin` header, it is echoed
/// back in `access-control-allow-origin` so browsers expose the
/// rejection to cross-origin callers.
pub fn error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
    origin: Option<&HeaderValue>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    let mut builder = Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value());

    if let Some(origin) = origin {
        builder = builder.header(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    }

    builder
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
