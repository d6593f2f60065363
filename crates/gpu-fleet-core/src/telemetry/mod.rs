//! Telemetry for the fleet core
//!
//! Prometheus metrics shared by the discovery engine, the heartbeat path,
//! the incident/alert manager and the persistence writer.

mod metrics;

pub use metrics::{FleetMetrics, FleetMetricsRegistry};
