//! Prometheus metrics for the GPU fleet core
//!
//! - `fleet_discovery_cycles_total` (counter) - Discovery cycles by result
//! - `fleet_discovery_duration_seconds` (histogram) - Discovery cycle duration
//! - `fleet_detector_errors_total` (counter) - Detector errors by vendor and kind
//! - `fleet_resources` (gauge) - Known resources by vendor
//! - `fleet_change_events_total` (counter) - Change events by type
//! - `fleet_change_events_dropped_total` (counter) - Events lost by slow listeners
//! - `fleet_heartbeats_total` (counter) - Heartbeats by result
//! - `fleet_heartbeat_delivery_seconds` (histogram) - Send-to-receive latency
//! - `fleet_providers` (gauge) - Providers by status
//! - `fleet_incidents_total` (counter) - Incidents by type and severity
//! - `fleet_active_alerts` (gauge) - Open alerts
//! - `fleet_persistence_retries_total` (counter) - Failed persistence attempts
//! - `fleet_persistence_dropped_total` (counter) - Records dropped on a full queue
//! - `fleet_benchmarks_total` (counter) - Benchmark runs by kind and result
//!
//! # Example
//!
//! ```rust,no_run
//! use gpu_fleet_core::telemetry::FleetMetricsRegistry;
//!
//! let registry = FleetMetricsRegistry::new().unwrap();
//! let metrics = registry.fleet();
//!
//! metrics.record_heartbeat("accepted");
//! metrics.record_discovery_cycle("success", 0.42);
//!
//! let text = registry.encode_text().unwrap();
//! ```

use prometheus::{Counter, CounterVec, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

use crate::contracts::ProviderStatus;
use crate::error::{FleetError, Result};

const NAMESPACE: &str = "fleet";

pub struct FleetMetrics {
    /// Discovery cycles (by result)
    discovery_cycles_total: CounterVec,

    /// Discovery duration in seconds (by result)
    discovery_duration_seconds: HistogramVec,

    /// Detector errors (by vendor, kind)
    detector_errors_total: CounterVec,

    /// Resources in the inventory (by vendor)
    resources: GaugeVec,

    /// Change events published (by change_type)
    change_events_total: CounterVec,

    /// Change events dropped on listener overflow
    change_events_dropped_total: Counter,

    /// Heartbeats (by result)
    heartbeats_total: CounterVec,

    heartbeat_delivery_seconds: Histogram,

    /// Providers (by status)
    providers: GaugeVec,

    /// Incidents raised (by type, severity)
    incidents_total: CounterVec,

    active_alerts: Gauge,

    persistence_retries_total: Counter,

    persistence_dropped_total: Counter,

    /// Benchmarks (by kind, result)
    benchmarks_total: CounterVec,
}

impl FleetMetrics {
    /// Create the metrics and register them with `registry`
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let discovery_cycles_total = CounterVec::new(
            Opts::new("discovery_cycles_total", "Total number of discovery cycles").namespace(NAMESPACE),
            &["result"],
        )?;

        let discovery_duration_seconds = HistogramVec::new(
            HistogramOpts::new("discovery_duration_seconds", "Discovery cycle duration in seconds")
                .namespace(NAMESPACE)
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 30.0]),
            &["result"],
        )?;

        let detector_errors_total = CounterVec::new(
            Opts::new("detector_errors_total", "Total number of vendor detector errors").namespace(NAMESPACE),
            &["vendor", "kind"],
        )?;

        let resources = GaugeVec::new(
            Opts::new("resources", "Resources currently in the inventory").namespace(NAMESPACE),
            &["vendor"],
        )?;

        let change_events_total = CounterVec::new(
            Opts::new("change_events_total", "Total number of published change events").namespace(NAMESPACE),
            &["change_type"],
        )?;

        let change_events_dropped_total = Counter::with_opts(
            Opts::new(
                "change_events_dropped_total",
                "Change events dropped because a listener queue overflowed",
            )
            .namespace(NAMESPACE),
        )?;

        let heartbeats_total = CounterVec::new(
            Opts::new("heartbeats_total", "Total number of received heartbeats").namespace(NAMESPACE),
            &["result"],
        )?;

        let heartbeat_delivery_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "heartbeat_delivery_seconds",
                "Delay between heartbeat send time and receipt",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;

        let providers = GaugeVec::new(
            Opts::new("providers", "Providers by aggregated status").namespace(NAMESPACE),
            &["status"],
        )?;

        let incidents_total = CounterVec::new(
            Opts::new("incidents_total", "Total number of health incidents raised").namespace(NAMESPACE),
            &["incident_type", "severity"],
        )?;

        let active_alerts = Gauge::with_opts(
            Opts::new("active_alerts", "Alerts not yet resolved").namespace(NAMESPACE),
        )?;

        let persistence_retries_total = Counter::with_opts(
            Opts::new("persistence_retries_total", "Failed persistence attempts that were retried")
                .namespace(NAMESPACE),
        )?;

        let persistence_dropped_total = Counter::with_opts(
            Opts::new("persistence_dropped_total", "Records dropped because the persistence queue was full")
                .namespace(NAMESPACE),
        )?;

        let benchmarks_total = CounterVec::new(
            Opts::new("benchmarks_total", "Total number of benchmark runs").namespace(NAMESPACE),
            &["kind", "result"],
        )?;

        registry.register(Box::new(discovery_cycles_total.clone()))?;
        registry.register(Box::new(discovery_duration_seconds.clone()))?;
        registry.register(Box::new(detector_errors_total.clone()))?;
        registry.register(Box::new(resources.clone()))?;
        registry.register(Box::new(change_events_total.clone()))?;
        registry.register(Box::new(change_events_dropped_total.clone()))?;
        registry.register(Box::new(heartbeats_total.clone()))?;
        registry.register(Box::new(heartbeat_delivery_seconds.clone()))?;
        registry.register(Box::new(providers.clone()))?;
        registry.register(Box::new(incidents_total.clone()))?;
        registry.register(Box::new(active_alerts.clone()))?;
        registry.register(Box::new(persistence_retries_total.clone()))?;
        registry.register(Box::new(persistence_dropped_total.clone()))?;
        registry.register(Box::new(benchmarks_total.clone()))?;

        Ok(Self {
            discovery_cycles_total,
            discovery_duration_seconds,
            detector_errors_total,
            resources,
            change_events_total,
            change_events_dropped_total,
            heartbeats_total,
            heartbeat_delivery_seconds,
            providers,
            incidents_total,
            active_alerts,
            persistence_retries_total,
            persistence_dropped_total,
            benchmarks_total,
        })
    }

    pub fn record_discovery_cycle(&self, result: &str, duration_secs: f64) {
        self.discovery_cycles_total.with_label_values(&[result]).inc();
        self.discovery_duration_seconds
            .with_label_values(&[result])
            .observe(duration_secs);
    }

    pub fn record_detector_error(&self, vendor: &str, kind: &str) {
        self.detector_errors_total.with_label_values(&[vendor, kind]).inc();
    }

    pub fn set_resources(&self, vendor: &str, count: usize) {
        self.resources.with_label_values(&[vendor]).set(count as f64);
    }

    pub fn record_change_event(&self, change_type: &str) {
        self.change_events_total.with_label_values(&[change_type]).inc();
    }

    pub fn record_dropped_events(&self, count: u64) {
        self.change_events_dropped_total.inc_by(count as f64);
    }

    pub fn dropped_events(&self) -> u64 {
        self.change_events_dropped_total.get() as u64
    }

    /// `accepted`, `duplicate`, `stale` or `rejected`
    pub fn record_heartbeat(&self, result: &str) {
        self.heartbeats_total.with_label_values(&[result]).inc();
    }

    pub fn observe_heartbeat_delivery(&self, seconds: f64) {
        self.heartbeat_delivery_seconds.observe(seconds.max(0.0));
    }

    /// Replace the provider gauges with a fresh count per status
    pub fn set_providers(&self, counts: &[(ProviderStatus, usize)]) {
        for status in ProviderStatus::ALL {
            let count = counts
                .iter()
                .find(|(s, _)| *s == status)
                .map_or(0, |(_, c)| *c);
            self.providers
                .with_label_values(&[status.as_str()])
                .set(count as f64);
        }
    }

    pub fn record_incident(&self, incident_type: &str, severity: &str) {
        self.incidents_total
            .with_label_values(&[incident_type, severity])
            .inc();
    }

    pub fn set_active_alerts(&self, count: usize) {
        self.active_alerts.set(count as f64);
    }

    pub fn record_persistence_retry(&self) {
        self.persistence_retries_total.inc();
    }

    pub fn persistence_retries(&self) -> u64 {
        self.persistence_retries_total.get() as u64
    }

    pub fn record_persistence_dropped(&self) {
        self.persistence_dropped_total.inc();
    }

    pub fn persistence_dropped(&self) -> u64 {
        self.persistence_dropped_total.get() as u64
    }

    pub fn record_benchmark(&self, kind: &str, result: &str) {
        self.benchmarks_total.with_label_values(&[kind, result]).inc();
    }
}

/// Registry for all fleet metrics
pub struct FleetMetricsRegistry {
    registry: Arc<Registry>,
    fleet: Arc<FleetMetrics>,
}

impl FleetMetricsRegistry {
    pub fn new() -> Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Create with an existing Prometheus registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let fleet = Arc::new(FleetMetrics::new(Arc::clone(&registry))?);
        Ok(Self { registry, fleet })
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn fleet(&self) -> Arc<FleetMetrics> {
        Arc::clone(&self.fleet)
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Encode metrics as text for scraping
    pub fn encode_text(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| FleetError::Metrics(prometheus::Error::Msg(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_registration_fails() {
        let registry = Arc::new(Registry::new());
        assert!(FleetMetrics::new(Arc::clone(&registry)).is_ok());
        assert!(matches!(FleetMetrics::new(registry), Err(FleetError::Metrics(_))));
    }

    #[test]
    fn test_dropped_events_counted() {
        let registry = FleetMetricsRegistry::new().unwrap();
        let metrics = registry.fleet();
        metrics.record_dropped_events(3);
        metrics.record_dropped_events(2);
        assert_eq!(metrics.dropped_events(), 5);
    }

    #[test]
    fn test_encode_text() {
        let registry = FleetMetricsRegistry::new().unwrap();
        let metrics = registry.fleet();
        metrics.record_heartbeat("accepted");
        metrics.record_incident("heartbeat_missed", "medium");
        metrics.set_providers(&[(ProviderStatus::Healthy, 4)]);

        let text = registry.encode_text().unwrap();
        assert!(text.contains("fleet_heartbeats_total"));
        assert!(text.contains("fleet_incidents_total"));
        assert!(text.contains("fleet_providers{status=\"healthy\"} 4"));
        assert!(text.contains("fleet_providers{status=\"offline\"} 0"));
    }
}
