//! Error taxonomy and JSON error responses for the dispatcher

use crate::request::ProxyBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, RETRY_AFTER, WWW_AUTHENTICATE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Header carrying the machine-readable error code on terminal responses
pub const X_DISPATCH_ERROR: &str = "x-dispatch-error";

/// Error codes for terminal dispatch errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchErrorCode {
    /// Target identifier or host failed syntax validation
    MalformedRoute,
    /// No dispatch strategy matched the request
    NoRoute,
    /// Identifier is reserved for the platform
    ForbiddenTarget,
    /// Missing or invalid credential on a protected dispatch form
    Unauthorized,
    /// Custom domain is unmapped, inactive or unverified
    NotFound,
    /// Quota exceeded for the current window
    RateLimited,
    /// Client request body was aborted or malformed mid-stream
    BadRequestBody,
    /// No compute unit exists for the target
    TargetNotFound,
    /// Target invocation failed transiently (after retry)
    TargetUnavailable,
    /// Domain store or identity verifier failed or timed out
    DependencyUnavailable,
    /// Unexpected failure inside the dispatcher
    InternalError,
}

impl DispatchErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchErrorCode::MalformedRoute => StatusCode::BAD_REQUEST,
            DispatchErrorCode::NoRoute => StatusCode::NOT_FOUND,
            DispatchErrorCode::ForbiddenTarget => StatusCode::FORBIDDEN,
            DispatchErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            DispatchErrorCode::NotFound => StatusCode::NOT_FOUND,
            DispatchErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            DispatchErrorCode::BadRequestBody => StatusCode::BAD_REQUEST,
            DispatchErrorCode::TargetNotFound => StatusCode::BAD_GATEWAY,
            DispatchErrorCode::TargetUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            DispatchErrorCode::DependencyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            DispatchErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Dispatch-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            DispatchErrorCode::MalformedRoute => "MALFORMED_ROUTE",
            DispatchErrorCode::NoRoute => "NO_ROUTE",
            DispatchErrorCode::ForbiddenTarget => "FORBIDDEN_TARGET",
            DispatchErrorCode::Unauthorized => "UNAUTHORIZED",
            DispatchErrorCode::NotFound => "NOT_FOUND",
            DispatchErrorCode::RateLimited => "RATE_LIMITED",
            DispatchErrorCode::BadRequestBody => "BAD_REQUEST_BODY",
            DispatchErrorCode::TargetNotFound => "TARGET_NOT_FOUND",
            DispatchErrorCode::TargetUnavailable => "TARGET_UNAVAILABLE",
            DispatchErrorCode::DependencyUnavailable => "DEPENDENCY_UNAVAILABLE",
            DispatchErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// A terminal error raised by one of the dispatch stages.
///
/// The `Display` output may contain internal detail and is meant for logs.
/// Clients only ever see [`DispatchError::public_message`].
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("malformed route: {0}")]
    MalformedRoute(&'static str),

    #[error("no route matches the request")]
    NoRoute,

    #[error("target '{0}' is reserved")]
    ForbiddenTarget(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("custom domain '{0}' is not routable")]
    NotFound(String),

    #[error("rate limit exceeded for {key}, retry after {retry_after_secs}s")]
    RateLimited { key: String, retry_after_secs: u64 },

    #[error("request body could not be read: {0}")]
    RequestBody(String),

    #[error("target '{0}' has no running compute unit")]
    TargetNotFound(String),

    #[error("target '{target}' unavailable: {reason}")]
    TargetUnavailable { target: String, reason: String },

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn code(&self) -> DispatchErrorCode {
        match self {
            DispatchError::MalformedRoute(_) => DispatchErrorCode::MalformedRoute,
            DispatchError::NoRoute => DispatchErrorCode::NoRoute,
            DispatchError::ForbiddenTarget(_) => DispatchErrorCode::ForbiddenTarget,
            DispatchError::Unauthorized(_) => DispatchErrorCode::Unauthorized,
            DispatchError::NotFound(_) => DispatchErrorCode::NotFound,
            DispatchError::RateLimited { .. } => DispatchErrorCode::RateLimited,
            DispatchError::RequestBody(_) => DispatchErrorCode::BadRequestBody,
            DispatchError::TargetNotFound(_) => DispatchErrorCode::TargetNotFound,
            DispatchError::TargetUnavailable { .. } => DispatchErrorCode::TargetUnavailable,
            DispatchError::DependencyUnavailable(_) => DispatchErrorCode::DependencyUnavailable,
            DispatchError::Internal(_) => DispatchErrorCode::InternalError,
        }
    }

    /// Message safe to return to unauthenticated callers.
    ///
    /// Never echoes request input, hostnames or collaborator error text.
    pub fn public_message(&self) -> String {
        match self {
            DispatchError::MalformedRoute(detail) => format!("Malformed route: {}", detail),
            DispatchError::NoRoute => "No route for this request".to_string(),
            DispatchError::ForbiddenTarget(_) => "Target is not available for dispatch".to_string(),
            DispatchError::Unauthorized(_) => "A valid bearer credential is required".to_string(),
            DispatchError::NotFound(_) => "Unknown or unconfigured host".to_string(),
            DispatchError::RateLimited { retry_after_secs, .. } => {
                format!("Rate limit exceeded, retry after {} seconds", retry_after_secs)
            }
            DispatchError::RequestBody(_) => "Request body could not be read".to_string(),
            DispatchError::TargetNotFound(_) => "Target not found".to_string(),
            DispatchError::TargetUnavailable { .. } => {
                "Target is temporarily unavailable, please retry later".to_string()
            }
            DispatchError::DependencyUnavailable(_) => {
                "Service temporarily unavailable, please retry later".to_string()
            }
            DispatchError::Internal(_) => "Internal dispatcher error".to_string(),
        }
    }

    /// Render this error as the terminal HTTP response
    pub fn into_response(self) -> Response<ProxyBody> {
        let mut response = json_error_response(self.code(), self.public_message());
        match &self {
            DispatchError::RateLimited { retry_after_secs, .. } => {
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert(RETRY_AFTER, value);
                }
            }
            DispatchError::Unauthorized(_) => {
                response
                    .headers_mut()
                    .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            _ => {}
        }
        response
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: DispatchErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: DispatchErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

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

/// Create a JSON error response with the X-Dispatch-Error header
pub fn json_error_response(
    code: DispatchErrorCode,
    message: impl Into<String>,
) -> Response<ProxyBody> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header(X_DISPATCH_ERROR, code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Best-effort text of a caught panic payload
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
