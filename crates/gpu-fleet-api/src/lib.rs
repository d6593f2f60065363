//! GPU Fleet API
//!
//! HTTP surface over [`gpu_fleet_core::FleetService`]:
//!
//! - **Discovery**: `POST /api/v1/discovery`, resource lookup and benchmarks
//! - **Heartbeats**: `POST /api/v1/heartbeats`, provider health and the
//!   system overview
//! - **Incidents and alerts**: listing and operator transitions
//! - **Streams**: server-sent events for inventory changes, availability
//!   transitions and alerts
//! - **Operations**: `GET /health` and Prometheus text at `GET /metrics`

pub mod handler;

pub use handler::{create_router, ApiError, ApiResponse, AppState, ErrorCategory};
