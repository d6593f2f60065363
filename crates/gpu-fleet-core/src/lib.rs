//! GPU Fleet Core
//!
//! Resource discovery and fleet health for a decentralized GPU compute
//! network.
//!
//! ## Features
//!
//! - **Multi-vendor discovery**: NVIDIA, AMD and Intel detectors selected by
//!   runtime probing of the vendor tooling, run in parallel with per-vendor
//!   fault isolation
//! - **Change detection**: snapshot diffing with a removal grace period and
//!   a broadcast change stream
//! - **Benchmarks**: compute, memory bandwidth and latency measurements with a
//!   hard deadline
//! - **Heartbeats**: validation, clock-skew rejection, idempotent and
//!   order-safe application
//! - **Health**: weighted health score, missed-heartbeat sweeps, provider
//!   and resource availability events
//! - **Incidents and alerts**: deduplicated incidents, severity-based alert
//!   promotion, operator lifecycle
//! - **Persistence**: asynchronous write-behind with retry and backoff
//! - **Telemetry**: Prometheus metrics and structured `tracing` logs
//!
//! ## Example
//!
//! ```rust,no_run
//! use gpu_fleet_core::{FleetConfig, FleetService, Heartbeat};
//! use chrono::Utc;
//!
//! # async fn run() -> gpu_fleet_core::Result<()> {
//! let service = FleetService::builder(FleetConfig::from_env()).build().await?;
//! service.start();
//!
//! let report = service.discover_all(false, None).await?;
//! println!("{} resources", report.resources.len());
//!
//! let response = service.submit_heartbeat(Heartbeat::new("provider-1", Utc::now())).await?;
//! assert!(response.accepted);
//!
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod collaborators;
pub mod config;
pub mod contracts;
pub mod detectors;
pub mod discovery;
pub mod error;
pub mod health;
pub mod incidents;
pub mod persistence;
pub mod service;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use collaborators::{
    FleetStore, IdentityRegistry, InMemoryIdentityRegistry, InMemoryStore, PersistenceStore, ProviderRecord,
    Transaction,
};
pub use config::{FleetConfig, FleetConfigBuilder, RecoveryPolicy};
pub use contracts::*;
pub use detectors::{
    CommandRunner, DetectorRegistry, MonitorSettings, ScriptedCommandRunner, SystemCommandRunner, VendorDetector,
};
pub use discovery::{ChangeSubscription, DiscoveryEngine, DiscoveryReport};
pub use error::{FleetError, Result};
pub use health::{ApplyOutcome, HealthAggregator, HeartbeatIngestor, SweepReport};
pub use incidents::{AlertFilter, AlertManager, IncidentFilter, IncidentManager};
pub use service::{FleetService, FleetServiceBuilder};
pub use telemetry::{FleetMetrics, FleetMetricsRegistry};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
