//! HTTP handlers
//!
//! - `routes`: router construction and request handlers
//! - `streams`: server-sent event streams
//!
//! Successful calls return an [`ApiResponse`] envelope; failures return an
//! [`ApiError`] body whose `category` tells a malformed request apart from
//! an unhealthy fleet.

mod routes;
mod streams;

pub use routes::create_router;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use gpu_fleet_core::{BenchmarkKind, FleetError, FleetService, IncidentStatus, Vendor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Application state
pub struct AppState {
    pub service: Arc<FleetService>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(service: Arc<FleetService>) -> Self {
        Self {
            service,
            start_time: Instant::now(),
        }
    }
}

/// Standard response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    pub metadata: ResponseMetadata,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
            metadata: ResponseMetadata::new(uuid::Uuid::new_v4().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub request_id: String,
    /// ISO 8601
    pub timestamp: String,
    pub version: String,
}

impl ResponseMetadata {
    pub fn new(request_id: String) -> Self {
        Self {
            request_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Who is at fault for a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The request was malformed or refers to something unknown
    Client,
    /// The fleet or its infrastructure is unhealthy
    Fleet,
}

/// Error body returned by every route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
    pub category: ErrorCategory,
    #[serde(skip)]
    status: Option<u16>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            error: "invalid_input".to_string(),
            message: message.into(),
            category: ErrorCategory::Client,
            status: Some(StatusCode::BAD_REQUEST.as_u16()),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
            .and_then(|s| StatusCode::from_u16(s).ok())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

fn status_for(err: &FleetError) -> StatusCode {
    match err {
        FleetError::UnknownProvider(_)
        | FleetError::UnknownVendor(_)
        | FleetError::ResourceNotFound(_)
        | FleetError::IncidentNotFound(_)
        | FleetError::AlertNotFound(_) => StatusCode::NOT_FOUND,
        FleetError::InvalidTransition { .. } => StatusCode::CONFLICT,
        FleetError::ClockSkew { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        FleetError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        FleetError::DetectorUnavailable { .. }
        | FleetError::DiscoveryFailed(_)
        | FleetError::StoreUnavailable(_)
        | FleetError::BenchmarkTimeout { .. }
        | FleetError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        let category = if err.is_client_error() {
            ErrorCategory::Client
        } else {
            ErrorCategory::Fleet
        };
        Self {
            error: err.code().to_string(),
            message: err.to_string(),
            category,
            status: Some(status_for(&err).as_u16()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(error = %self.error, message = %self.message, "Request failed");
        }
        (status, Json(self)).into_response()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverRequest {
    pub force_refresh: bool,
    /// Restrict to these vendors; all when absent
    pub vendors: Option<Vec<Vendor>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkRequest {
    /// Every kind when empty
    pub kinds: Vec<BenchmarkKind>,
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub status: IncidentStatus,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub store_healthy: bool,
    pub vendors_available: Vec<Vendor>,
}
