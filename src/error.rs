//! Error types and client-visible error responses for the gateway

use crate::forward::{full_body, ProxyBody};
use hyper::{Response, StatusCode};

/// Error codes reported to clients in the X-Gateway-Error header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorCode {
    /// No destination registered for the request host
    NoRoute,
    /// Failed to connect to or read from the destination
    ConnectionFailed,
    /// The destination refused or broke a protocol upgrade
    UpgradeFailed,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::NoRoute => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::UpgradeFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::NoRoute => "NO_ROUTE",
            GatewayErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            GatewayErrorCode::UpgradeFailed => "UPGRADE_FAILED",
        }
    }
}

/// Create a plain-text error response with X-Gateway-Error header
pub fn text_error_response(code: GatewayErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let mut body = message.into();
    if !body.ends_with('\n') {
        body.push('\n');
    }

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header("X-Gateway-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Errors raised while reading configuration from the environment
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Please provide {0} environment variable!")]
    Missing(&'static str),

    #[error("Invalid value '{value}' for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Errors reported by a container source
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("No such container: {0}")]
    NotFound(String),

    #[error("Container API error: {0}")]
    Api(String),

    #[error("Event stream unavailable: {0}")]
    Stream(String),
}

impl From<bollard::errors::Error> for ContainerError {
    fn from(err: bollard::errors::Error) -> Self {
        ContainerError::Api(err.to_string())
    }
}

/// Errors raised while building a destination
#[derive(Debug, thiserror::Error)]
pub enum DestinationError {
    #[error("Invalid backend address '{address}': {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: url::ParseError,
    },
}

/// Errors raised while forwarding a request to a backend
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("Request build error: {0}")]
    RequestBuild(String),
}

/// Errors raised by routing table operations
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Destination already exists for container {container_id} under {key}")]
    AlreadyExists { key: String, container_id: String },

    #[error(transparent)]
    Destination(#[from] DestinationError),

    #[error(transparent)]
    Container(#[from] ContainerError),
}
