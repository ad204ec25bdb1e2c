//! Centralized error types for the streaming coordinator library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::sonos::discovery::DiscoveryError;
use crate::sonos::gena::GenaError;
use crate::sonos::soap::SoapError;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

impl ErrorCode for DiscoveryError {
    fn code(&self) -> &'static str {
        match self {
            Self::SocketBind(_) => "socket_bind_failed",
            Self::SendSearch(_) => "ssdp_send_failed",
            Self::NoInterfaces => "no_network_interfaces",
            Self::MdnsDaemon(_) => "mdns_daemon_failed",
            Self::AllMethodsFailed(_) => "all_discovery_methods_failed",
            Self::IpUnreachable(_) => "ip_unreachable",
            Self::NotSonosDevice(_) => "not_sonos_device",
        }
    }
}

impl ErrorCode for SoapError {
    fn code(&self) -> &'static str {
        match self {
            Self::Http(_) => "http_request_failed",
            Self::HttpStatus(_, _) => "http_error_status",
            Self::Fault(_) => "soap_fault",
            Self::Parse => "soap_parse_error",
        }
    }
}

impl ErrorCode for GenaError {
    fn code(&self) -> &'static str {
        match self {
            Self::Http(_) => "http_request_failed",
            Self::SubscriptionFailed(_) => "gena_subscription_failed",
            Self::RenewalFailed(_) => "gena_renewal_failed",
            Self::MissingSid => "gena_missing_sid",
            Self::UnknownToken => "gena_unknown_token",
        }
    }
}

/// Application-wide error type for the streaming coordinator server.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum CoordinatorError {
    /// Speaker discovery failed (SSDP/network issues).
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// SOAP request to Sonos speaker failed.
    #[error("SOAP request failed: {0}")]
    Soap(String),

    /// Speaker not found or unreachable.
    #[error("Speaker not found: {0}")]
    SpeakerNotFound(String),

    /// Requested stream ID does not exist.
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid IP address for speaker configuration.
    ///
    /// Used for IP validation errors (IPv6, loopback, broadcast, etc.).
    /// Returns `"invalid_ip"` error code for API compatibility.
    #[error("Invalid IP: {0}")]
    InvalidIp(String),

    /// Network-related error (IP detection, connection issues).
    #[error("Network error: {0}")]
    Network(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Server configuration error (missing required settings).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A stream's audio source was reassigned to a different producer while
    /// a previous producer still held it.
    #[error("Stream source stolen: {0}")]
    SourceStolen(String),

    /// The active producer for a stream stopped sending frames past the
    /// allowed stall window.
    #[error("Producer stalled: {0}")]
    ProducerStalled(String),

    /// A frame was dropped because the cadence buffer could not absorb it.
    #[error("Backpressure drop: {0}")]
    BackpressureDrop(String),

    /// An internal invariant was violated; indicates a bug rather than an
    /// external failure.
    #[error("Invariant violated: {0}")]
    InvariantViolated(String),

    /// The server is already running the maximum number of concurrent
    /// streams.
    #[error("Too many concurrent streams: {0}")]
    TooManyStreams(String),

    /// A GENA NOTIFY arrived on a callback path whose token this process
    /// never issued (expired, unknown, or left over from a prior instance).
    #[error("Unknown GENA callback token: {0}")]
    UnknownGenaCallback(String),
}

impl CoordinatorError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Discovery(_) => "discovery_failed",
            Self::Soap(_) => "soap_error",
            Self::SpeakerNotFound(_) => "speaker_not_found",
            Self::StreamNotFound(_) => "stream_not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidIp(_) => "invalid_ip",
            Self::Network(_) => "network_error",
            Self::Internal(_) => "internal_error",
            Self::Configuration(_) => "configuration_error",
            Self::SourceStolen(_) => "source_stolen",
            Self::ProducerStalled(_) => "producer_stalled",
            Self::BackpressureDrop(_) => "backpressure_drop",
            Self::InvariantViolated(_) => "invariant_violated",
            Self::TooManyStreams(_) => "too_many_streams",
            Self::UnknownGenaCallback(_) => "gena_unknown_token",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SpeakerNotFound(_) | Self::StreamNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) | Self::InvalidIp(_) => StatusCode::BAD_REQUEST,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::SourceStolen(_) => StatusCode::CONFLICT,
            Self::TooManyStreams(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UnknownGenaCallback(_) => StatusCode::PRECONDITION_FAILED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Result Type Aliases
// ─────────────────────────────────────────────────────────────────────────────

// Re-export Result type aliases from their defining modules
pub use crate::sonos::discovery::DiscoveryResult;
pub use crate::sonos::gena::GenaResult;
pub use crate::sonos::soap::SoapResult;

/// Convenient Result alias for application-wide operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<GenaError> for CoordinatorError {
    fn from(err: GenaError) -> Self {
        Self::Soap(err.to_string())
    }
}

impl From<SoapError> for CoordinatorError {
    fn from(err: SoapError) -> Self {
        Self::Soap(err.to_string())
    }
}

impl From<DiscoveryError> for CoordinatorError {
    fn from(err: DiscoveryError) -> Self {
        Self::Discovery(err.to_string())
    }
}
