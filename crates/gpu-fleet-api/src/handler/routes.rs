//! Route definitions
//!
//! - `POST /api/v1/discovery` - run or serve a cached discovery cycle
//! - `GET /api/v1/resources[/:id]` - inventory and live resource info
//! - `GET|POST /api/v1/resources/:id/benchmarks` - history / run benchmarks
//! - `POST /api/v1/heartbeats` - submit a provider heartbeat
//! - `GET /api/v1/providers[/:id]` - provider health
//! - `GET /api/v1/overview` - system health overview
//! - `/api/v1/incidents`, `/api/v1/alerts` - listing and transitions
//! - `GET /api/v1/streams/{changes,availability,alerts}` - SSE
//! - `GET /health`, `GET /metrics`

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use gpu_fleet_core::{
    AlertFilter, BenchmarkResult, DiscoveryReport, HealthIncident, Heartbeat, HeartbeatResponse,
    IncidentFilter, ProviderHealthStatus, ResourceDescriptor, SystemAlert, SystemHealthOverview, Vendor,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use super::streams::{alert_stream, availability_stream, change_stream};
use super::{
    ApiError, ApiResponse, AppState, BenchmarkRequest, DiscoverRequest, HealthResponse, TransitionRequest,
};

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Create the router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        // Discovery surface
        .route("/api/v1/discovery", post(discover))
        .route("/api/v1/resources", get(list_resources))
        .route("/api/v1/resources/:id", get(resource_info))
        .route(
            "/api/v1/resources/:id/benchmarks",
            get(benchmark_history).post(run_benchmark),
        )
        // Heartbeat surface
        .route("/api/v1/heartbeats", post(submit_heartbeat))
        .route("/api/v1/providers", get(list_providers))
        .route("/api/v1/providers/:id", get(provider_health))
        .route("/api/v1/overview", get(system_overview))
        // Incidents and alerts
        .route("/api/v1/incidents", get(list_incidents))
        .route("/api/v1/incidents/:id", get(get_incident))
        .route("/api/v1/incidents/:id/transition", post(transition_incident))
        .route("/api/v1/alerts", get(list_alerts))
        .route("/api/v1/alerts/:id", get(get_alert))
        .route("/api/v1/alerts/:id/acknowledge", post(acknowledge_alert))
        .route("/api/v1/alerts/:id/suppress", post(suppress_alert))
        .route("/api/v1/alerts/:id/resolve", post(resolve_alert))
        // Streams
        .route("/api/v1/streams/changes", get(change_stream))
        .route("/api/v1/streams/availability", get(availability_stream))
        .route("/api/v1/streams/alerts", get(alert_stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /health
async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let store_healthy = state.service.store_healthy().await;
    let status = if store_healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };
    (
        status.0,
        Json(HealthResponse {
            status: status.1.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
            store_healthy,
            vendors_available: state.service.available_vendors(),
        }),
    )
}

/// GET /metrics - Prometheus text exposition
async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let body = state.service.metrics_text()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

async fn discover(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DiscoverRequest>,
) -> ApiResult<DiscoveryReport> {
    let report = state
        .service
        .discover_all(request.force_refresh, request.vendors.as_deref())
        .await?;
    Ok(Json(ApiResponse::success(report)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InventoryQuery {
    vendor: Option<Vendor>,
}

async fn list_resources(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InventoryQuery>,
) -> Json<ApiResponse<Vec<ResourceDescriptor>>> {
    let filter = query.vendor.map(|v| vec![v]);
    Json(ApiResponse::success(state.service.inventory(filter.as_deref())))
}

async fn resource_info(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<ResourceDescriptor> {
    let resource = state.service.get_resource_info(&id).await?;
    Ok(Json(ApiResponse::success(resource)))
}

async fn run_benchmark(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<BenchmarkRequest>,
) -> ApiResult<Vec<BenchmarkResult>> {
    let duration = match request.duration_secs {
        Some(secs) if !secs.is_finite() || secs <= 0.0 => {
            return Err(ApiError::bad_request("duration_secs must be a positive number"))
        }
        Some(secs) => Some(Duration::from_secs_f64(secs)),
        None => None,
    };
    let results = state
        .service
        .run_benchmark(&id, &request.kinds, duration)
        .await?;
    Ok(Json(ApiResponse::success(results)))
}

async fn benchmark_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<ApiResponse<Vec<BenchmarkResult>>> {
    Json(ApiResponse::success(state.service.benchmark_history(&id)))
}

async fn submit_heartbeat(
    State(state): State<Arc<AppState>>,
    Json(heartbeat): Json<Heartbeat>,
) -> ApiResult<HeartbeatResponse> {
    let response = state.service.submit_heartbeat(heartbeat).await?;
    Ok(Json(ApiResponse::success(response)))
}

async fn list_providers(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<ProviderHealthStatus>>> {
    Json(ApiResponse::success(state.service.providers().await))
}

async fn provider_health(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<ProviderHealthStatus> {
    let health = state.service.provider_health(&id).await?;
    Ok(Json(ApiResponse::success(health)))
}

async fn system_overview(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SystemHealthOverview>> {
    Json(ApiResponse::success(state.service.system_overview().await))
}

async fn list_incidents(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<IncidentFilter>,
) -> Json<ApiResponse<Vec<HealthIncident>>> {
    Json(ApiResponse::success(state.service.list_incidents(&filter)))
}

async fn get_incident(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<HealthIncident> {
    Ok(Json(ApiResponse::success(state.service.get_incident(id)?)))
}

async fn transition_incident(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<TransitionRequest>,
) -> ApiResult<HealthIncident> {
    let incident = state
        .service
        .transition_incident(id, request.status, request.note)
        .await?;
    Ok(Json(ApiResponse::success(incident)))
}

async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<AlertFilter>,
) -> Json<ApiResponse<Vec<SystemAlert>>> {
    Json(ApiResponse::success(state.service.list_alerts(&filter)))
}

async fn get_alert(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<SystemAlert> {
    Ok(Json(ApiResponse::success(state.service.get_alert(id)?)))
}

async fn acknowledge_alert(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<SystemAlert> {
    Ok(Json(ApiResponse::success(state.service.acknowledge_alert(id).await?)))
}

async fn suppress_alert(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<SystemAlert> {
    Ok(Json(ApiResponse::success(state.service.suppress_alert(id).await?)))
}

async fn resolve_alert(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<SystemAlert> {
    Ok(Json(ApiResponse::success(state.service.resolve_alert(id).await?)))
}
