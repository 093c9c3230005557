//! Error taxonomy and JSON error responses for the front door

use crate::pool::ProxyBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Failures raised while resolving, starting or reaching a tenant instance
#[derive(Debug, thiserror::Error)]
pub enum BullpenError {
    #[error("invalid tenant identifier: {0:?}")]
    InvalidTenant(String),

    #[error("no content directory for tenant '{0}'")]
    TenantNotFound(String),

    #[error("no free port in range [{start}, {end})")]
    ResourceExhausted { start: u16, end: u16 },

    #[error("instance for '{tenant}' did not open port {port} after {attempts} probes")]
    StartupTimeout {
        tenant: String,
        port: u16,
        attempts: u32,
    },

    #[error("failed to spawn instance for '{tenant}': {source}")]
    SpawnFailed {
        tenant: String,
        #[source]
        source: std::io::Error,
    },

    #[error("instance on port {port} unreachable: {reason}")]
    UpstreamUnreachable { port: u16, reason: String },

    #[error("instance on port {port} did not answer within {secs}s")]
    UpstreamTimeout { port: u16, secs: u64 },

    #[error("no instance available to serve shared assets")]
    AssetsUnavailable,
}

impl BullpenError {
    /// The public error code this failure is reported as
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            BullpenError::InvalidTenant(_) | BullpenError::TenantNotFound(_) => {
                ProxyErrorCode::TenantNotFound
            }
            BullpenError::ResourceExhausted { .. } => ProxyErrorCode::ResourceExhausted,
            BullpenError::StartupTimeout { .. } => ProxyErrorCode::StartupTimeout,
            BullpenError::SpawnFailed { .. } => ProxyErrorCode::StartFailed,
            BullpenError::UpstreamUnreachable { .. } => ProxyErrorCode::UpstreamUnreachable,
            BullpenError::UpstreamTimeout { .. } => ProxyErrorCode::UpstreamTimeout,
            BullpenError::AssetsUnavailable => ProxyErrorCode::AssetsUnavailable,
        }
    }

    /// Short operator-facing message; never includes OS or upstream detail
    pub fn public_message(&self) -> &'static str {
        match self {
            BullpenError::InvalidTenant(_) | BullpenError::TenantNotFound(_) => {
                "User garden not found"
            }
            BullpenError::ResourceExhausted { .. } => "No capacity to start editor",
            BullpenError::StartupTimeout { .. } | BullpenError::SpawnFailed { .. } => {
                "Failed to start editor"
            }
            BullpenError::UpstreamUnreachable { .. } => "Proxy error",
            BullpenError::UpstreamTimeout { .. } => "Editor did not respond in time",
            BullpenError::AssetsUnavailable => "No active instances to serve assets",
        }
    }

    /// Render as a JSON error response
    pub fn into_response(self) -> Response<ProxyBody> {
        json_error_response(self.code(), self.public_message())
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Unknown tenant or no content directory
    TenantNotFound,
    /// Port range exhausted
    ResourceExhausted,
    /// Instance never opened its port
    StartupTimeout,
    /// Instance could not be spawned at all
    StartFailed,
    /// Failed to connect to a previously healthy instance
    UpstreamUnreachable,
    /// Instance accepted the request but did not answer in time
    UpstreamTimeout,
    /// Neither the assets instance nor any fallback is available
    AssetsUnavailable,
    /// Method not allowed on this route
    MethodNotAllowed,
    /// No route matches
    NotFound,
    /// Malformed identity-provider callback
    BadRequest,
    /// Identity provider exchange failed
    IdentityProviderError,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::TenantNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::ResourceExhausted => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::StartupTimeout => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::StartFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::AssetsUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::IdentityProviderError => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::TenantNotFound => "TENANT_NOT_FOUND",
            ProxyErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ProxyErrorCode::StartupTimeout => "STARTUP_TIMEOUT",
            ProxyErrorCode::StartFailed => "START_FAILED",
            ProxyErrorCode::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
            ProxyErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ProxyErrorCode::AssetsUnavailable => "ASSETS_UNAVAILABLE",
            ProxyErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::BadRequest => "BAD_REQUEST",
            ProxyErrorCode::IdentityProviderError => "IDENTITY_PROVIDER_ERROR",
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

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
