//! Fleet configuration
//!
//! Every option has a default, so an empty file is a valid configuration.
//! Values can come from a TOML/YAML/JSON file, from `FLEET_*` environment
//! variables, or from the builder.
//!
//! # Health score weighting
//!
//! The provider health score is
//!
//! ```text
//! 100 * (uptime_weight * uptime + latency_weight * latency + resource_weight * resources)
//!     / (uptime_weight + latency_weight + resource_weight)
//! ```
//!
//! where each factor is in `[0, 1]`: `uptime` is the share of expected
//! heartbeats received over the last `uptime_window` slots, `latency` falls
//! linearly from 1 at `latency_target_ms` to 0 at `latency_ceiling_ms`, and
//! `resources` is the share of reported resources without problems.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::contracts::{ChangeThresholds, IncidentSeverity, Vendor};
use crate::error::{FleetError, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub detectors: DetectorConfig,
    pub discovery: DiscoveryConfig,
    pub benchmark: BenchmarkConfig,
    pub heartbeat: HeartbeatConfig,
    pub health: HealthConfig,
    pub alerts: AlertConfig,
    pub persistence: PersistenceConfig,
    pub identity: IdentityConfig,
}

/// Providers registered with the built-in identity registry at startup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub providers: Vec<String>,
}

/// Vendor enable flags and tool invocation limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub nvidia_enabled: bool,
    pub amd_enabled: bool,
    pub intel_enabled: bool,
    pub command_timeout_ms: u64,
    pub monitor_interval_secs: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            nvidia_enabled: true,
            amd_enabled: true,
            intel_enabled: true,
            command_timeout_ms: 10_000,
            monitor_interval_secs: 15,
        }
    }
}

impl DetectorConfig {
    pub fn is_enabled(&self, vendor: Vendor) -> bool {
        match vendor {
            Vendor::Nvidia => self.nvidia_enabled,
            Vendor::Amd => self.amd_enabled,
            Vendor::Intel => self.intel_enabled,
        }
    }

    pub fn set_enabled(&mut self, vendor: Vendor, enabled: bool) {
        match vendor {
            Vendor::Nvidia => self.nvidia_enabled = enabled,
            Vendor::Amd => self.amd_enabled = enabled,
            Vendor::Intel => self.intel_enabled = enabled,
        }
    }

    pub fn enabled_vendors(&self) -> Vec<Vendor> {
        Vendor::ALL
            .into_iter()
            .filter(|v| self.is_enabled(*v))
            .collect()
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Period of the background discovery loop
    pub interval_secs: u64,
    /// Sub-timeout for each vendor call
    pub detector_timeout_ms: u64,
    /// Bound on a whole discovery cycle
    pub cycle_timeout_ms: u64,
    /// Age below which a non-forced discovery returns the cached snapshot
    pub cache_ttl_secs: u64,
    /// Cycles a resource may be absent before it is removed
    pub removal_grace_cycles: u32,
    /// Age of `last_seen` after which a resource of a failing vendor is pruned
    pub staleness_window_secs: u64,
    pub utilization_noise_pct: f64,
    pub temperature_delta_c: f64,
    pub power_delta_w: f64,
    /// Per-listener change event buffer; oldest events drop on overflow
    pub listener_queue_size: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            detector_timeout_ms: 15_000,
            cycle_timeout_ms: 30_000,
            cache_ttl_secs: 30,
            removal_grace_cycles: 2,
            staleness_window_secs: 600,
            utilization_noise_pct: 5.0,
            temperature_delta_c: 5.0,
            power_delta_w: 15.0,
            listener_queue_size: 256,
        }
    }
}

impl DiscoveryConfig {
    pub fn change_thresholds(&self) -> ChangeThresholds {
        ChangeThresholds {
            utilization_pct: self.utilization_noise_pct,
            temperature_c: self.temperature_delta_c,
            power_w: self.power_delta_w,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_millis(self.detector_timeout_ms)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_millis(self.cycle_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_window_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub default_duration_secs: u64,
    /// Allowed overrun as a fraction of the requested duration
    pub timeout_grace_factor: f64,
    /// Results kept per resource
    pub history_limit: usize,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            default_duration_secs: 10,
            timeout_grace_factor: 0.10,
            history_limit: 100,
        }
    }
}

impl BenchmarkConfig {
    /// Hard deadline for a benchmark of the given duration
    pub fn deadline_for(&self, duration: Duration) -> Duration {
        duration.mul_f64(1.0 + self.timeout_grace_factor.max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval providers are told to report at
    pub interval_secs: u64,
    /// Consecutive missed heartbeats before a provider is offline
    pub missed_threshold: u32,
    pub clock_skew_tolerance_secs: u64,
    pub sweep_interval_secs: u64,
    /// Resources with problems tolerated before a provider is degraded
    pub resource_issue_threshold: usize,
    /// Checks returned to agents in every response
    pub required_checks: Vec<String>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            missed_threshold: 3,
            clock_skew_tolerance_secs: 30,
            sweep_interval_secs: 10,
            resource_issue_threshold: 0,
            required_checks: Vec::new(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.interval_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// How a provider leaves `Offline`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Any accepted heartbeat makes the provider healthy again
    #[default]
    Direct,
    /// Status is re-evaluated from score and resource reports
    RequireResourceValidation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub uptime_weight: f64,
    pub latency_weight: f64,
    pub resource_weight: f64,
    pub latency_target_ms: u64,
    pub latency_ceiling_ms: u64,
    /// Expected-heartbeat slots in the rolling uptime window
    pub uptime_window: usize,
    pub degraded_threshold: f64,
    pub unhealthy_threshold: f64,
    pub recovery_policy: RecoveryPolicy,
    pub thresholds: MetricThresholds,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            uptime_weight: 0.5,
            latency_weight: 0.2,
            resource_weight: 0.3,
            latency_target_ms: 500,
            latency_ceiling_ms: 10_000,
            uptime_window: 60,
            degraded_threshold: 70.0,
            unhealthy_threshold: 40.0,
            recovery_policy: RecoveryPolicy::Direct,
            thresholds: MetricThresholds::default(),
        }
    }
}

/// Limits that raise threshold-violation incidents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricThresholds {
    pub max_gpu_temperature_c: f64,
    pub max_cpu_percent: f64,
    pub max_memory_percent: f64,
}

impl Default for MetricThresholds {
    fn default() -> Self {
        Self {
            max_gpu_temperature_c: 85.0,
            max_cpu_percent: 95.0,
            max_memory_percent: 95.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Window within which incidents of the same provider and type share an alert
    pub dedup_window_secs: u64,
    /// Minimum incident severity promoted to an alert
    pub promotion_severity: IncidentSeverity,
    /// How long resolved alerts stay queryable
    pub retention_secs: u64,
    pub auto_resolve_on_recovery: bool,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: 300,
            promotion_severity: IncidentSeverity::High,
            retention_secs: 86_400,
            auto_resolve_on_recovery: true,
        }
    }
}

impl AlertConfig {
    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dedup_window_secs as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Failed attempts on one write before an alert about the aggregator is raised
    pub alert_after_attempts: u32,
    pub queue_size: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            alert_after_attempts: 5,
            queue_size: 1024,
        }
    }
}

impl PersistenceConfig {
    /// Exponential backoff before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1).min(32));
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

impl FleetConfig {
    /// Create a new config builder
    pub fn builder() -> FleetConfigBuilder {
        FleetConfigBuilder::new()
    }

    /// Load from a TOML, YAML or JSON file, chosen by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| FleetError::Config(format!("{}: {}", path.display(), e)))?;

        let config: FleetConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| FleetError::Config(format!("JSON error: {}", e)))?,
            other => {
                return Err(FleetError::Config(format!(
                    "unsupported config format: {:?}",
                    other
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `FLEET_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Override fields from `FLEET_*` environment variables; unparsable values are ignored
    pub fn apply_env_overrides(&mut self) {
        fn env<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
        }

        if let Ok(list) = std::env::var("FLEET_DISABLE_VENDORS") {
            for vendor in list.split(',').filter_map(|v| v.parse::<Vendor>().ok()) {
                self.detectors.set_enabled(vendor, false);
            }
        }
        if let Some(v) = env("FLEET_COMMAND_TIMEOUT_MS") {
            self.detectors.command_timeout_ms = v;
        }
        if let Some(v) = env("FLEET_DISCOVERY_INTERVAL_SECS") {
            self.discovery.interval_secs = v;
        }
        if let Some(v) = env("FLEET_DISCOVERY_CACHE_TTL_SECS") {
            self.discovery.cache_ttl_secs = v;
        }
        if let Some(v) = env("FLEET_BENCHMARK_GRACE_FACTOR") {
            self.benchmark.timeout_grace_factor = v;
        }
        if let Some(v) = env("FLEET_HEARTBEAT_INTERVAL_SECS") {
            self.heartbeat.interval_secs = v;
        }
        if let Some(v) = env("FLEET_MISSED_HEARTBEAT_THRESHOLD") {
            self.heartbeat.missed_threshold = v;
        }
        if let Some(v) = env("FLEET_CLOCK_SKEW_TOLERANCE_SECS") {
            self.heartbeat.clock_skew_tolerance_secs = v;
        }
        if let Some(v) = env("FLEET_DEGRADED_THRESHOLD") {
            self.health.degraded_threshold = v;
        }
        if let Some(v) = env("FLEET_UNHEALTHY_THRESHOLD") {
            self.health.unhealthy_threshold = v;
        }
        if let Some(v) = env("FLEET_ALERT_DEDUP_WINDOW_SECS") {
            self.alerts.dedup_window_secs = v;
        }
        if let Ok(list) = std::env::var("FLEET_PROVIDERS") {
            for id in list.split(',').map(str::trim).filter(|id| !id.is_empty()) {
                if !self.identity.providers.iter().any(|p| p == id) {
                    self.identity.providers.push(id.to_string());
                }
            }
        }
    }

    /// Reject values the engines cannot work with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(FleetError::Config(msg.to_string()));

        if self.discovery.interval_secs == 0 {
            return fail("discovery.interval_secs must be positive");
        }
        if self.discovery.detector_timeout_ms == 0 || self.discovery.cycle_timeout_ms == 0 {
            return fail("discovery timeouts must be positive");
        }
        if self.discovery.listener_queue_size == 0 {
            return fail("discovery.listener_queue_size must be positive");
        }
        if self.heartbeat.interval_secs == 0 || self.heartbeat.sweep_interval_secs == 0 {
            return fail("heartbeat intervals must be positive");
        }
        if self.heartbeat.missed_threshold == 0 {
            return fail("heartbeat.missed_threshold must be at least 1");
        }
        let h = &self.health;
        for value in [h.degraded_threshold, h.unhealthy_threshold] {
            if !(0.0..=100.0).contains(&value) {
                return fail("health thresholds must be within [0, 100]");
            }
        }
        if h.unhealthy_threshold >= h.degraded_threshold {
            return fail("health.unhealthy_threshold must be below degraded_threshold");
        }
        if [h.uptime_weight, h.latency_weight, h.resource_weight]
            .iter()
            .any(|w| *w < 0.0)
        {
            return fail("health weights must not be negative");
        }
        if h.uptime_weight + h.latency_weight + h.resource_weight <= 0.0 {
            return fail("at least one health weight must be positive");
        }
        if h.latency_ceiling_ms <= h.latency_target_ms {
            return fail("health.latency_ceiling_ms must exceed latency_target_ms");
        }
        if h.uptime_window == 0 {
            return fail("health.uptime_window must be positive");
        }
        if self.benchmark.timeout_grace_factor < 0.0 {
            return fail("benchmark.timeout_grace_factor must not be negative");
        }
        if self.persistence.queue_size == 0 {
            return fail("persistence.queue_size must be positive");
        }
        if self.identity.providers.iter().any(|p| p.trim().is_empty()) {
            return fail("identity.providers must not contain empty IDs");
        }
        Ok(())
    }
}

/// Builder for FleetConfig
pub struct FleetConfigBuilder {
    config: FleetConfig,
}

impl FleetConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: FleetConfig::default(),
        }
    }

    /// Enable only the listed vendors
    pub fn vendors(mut self, vendors: &[Vendor]) -> Self {
        for vendor in Vendor::ALL {
            self.config
                .detectors
                .set_enabled(vendor, vendors.contains(&vendor));
        }
        self
    }

    pub fn heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.config.heartbeat.interval_secs = secs;
        self
    }

    pub fn missed_threshold(mut self, threshold: u32) -> Self {
        self.config.heartbeat.missed_threshold = threshold;
        self
    }

    pub fn clock_skew_tolerance_secs(mut self, secs: u64) -> Self {
        self.config.heartbeat.clock_skew_tolerance_secs = secs;
        self
    }

    pub fn score_thresholds(mut self, degraded: f64, unhealthy: f64) -> Self {
        self.config.health.degraded_threshold = degraded;
        self.config.health.unhealthy_threshold = unhealthy;
        self
    }

    pub fn score_weights(mut self, uptime: f64, latency: f64, resources: f64) -> Self {
        self.config.health.uptime_weight = uptime;
        self.config.health.latency_weight = latency;
        self.config.health.resource_weight = resources;
        self
    }

    pub fn recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.config.health.recovery_policy = policy;
        self
    }

    pub fn removal_grace_cycles(mut self, cycles: u32) -> Self {
        self.config.discovery.removal_grace_cycles = cycles;
        self
    }

    pub fn cache_ttl_secs(mut self, secs: u64) -> Self {
        self.config.discovery.cache_ttl_secs = secs;
        self
    }

    pub fn detector_timeout_ms(mut self, ms: u64) -> Self {
        self.config.discovery.detector_timeout_ms = ms;
        self
    }

    pub fn cycle_timeout_ms(mut self, ms: u64) -> Self {
        self.config.discovery.cycle_timeout_ms = ms;
        self
    }

    pub fn alert_dedup_window_secs(mut self, secs: u64) -> Self {
        self.config.alerts.dedup_window_secs = secs;
        self
    }

    pub fn benchmark_grace_factor(mut self, factor: f64) -> Self {
        self.config.benchmark.timeout_grace_factor = factor;
        self
    }

    pub fn discovery_interval_secs(mut self, secs: u64) -> Self {
        self.config.discovery.interval_secs = secs;
        self
    }

    pub fn monitor_interval_secs(mut self, secs: u64) -> Self {
        self.config.detectors.monitor_interval_secs = secs;
        self
    }

    pub fn persistence_queue_size(mut self, size: usize) -> Self {
        self.config.persistence.queue_size = size;
        self
    }

    /// Seed the built-in identity registry
    pub fn providers<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.identity.providers = providers.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> FleetConfig {
        self.config
    }
}

impl Default for FleetConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = FleetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat.interval_secs, 60);
        assert_eq!(config.heartbeat.missed_threshold, 3);
        assert_eq!(config.heartbeat.clock_skew_tolerance_secs, 30);
        assert_eq!(config.discovery.removal_grace_cycles, 2);
        assert_eq!(config.health.degraded_threshold, 70.0);
        assert_eq!(config.health.unhealthy_threshold, 40.0);
        assert_eq!(config.alerts.dedup_window_secs, 300);
        assert_eq!(config.detectors.enabled_vendors().len(), 3);
    }

    #[test]
    fn test_config_builder() {
        let config = FleetConfig::builder()
            .vendors(&[Vendor::Nvidia])
            .heartbeat_interval_secs(30)
            .missed_threshold(5)
            .score_thresholds(80.0, 50.0)
            .recovery_policy(RecoveryPolicy::RequireResourceValidation)
            .build();

        assert_eq!(config.detectors.enabled_vendors(), vec![Vendor::Nvidia]);
        assert_eq!(config.heartbeat.interval_secs, 30);
        assert_eq!(config.heartbeat.missed_threshold, 5);
        assert_eq!(config.health.recovery_policy, RecoveryPolicy::RequireResourceValidation);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let config = FleetConfig::builder().score_thresholds(40.0, 70.0).build();
        assert!(matches!(config.validate(), Err(FleetError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_weights() {
        let config = FleetConfig::builder().score_weights(0.0, 0.0, 0.0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = PersistenceConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(4), Duration::from_millis(800));
        assert_eq!(config.backoff(40), Duration::from_millis(30_000));
    }

    #[test]
    fn test_benchmark_deadline() {
        let config = BenchmarkConfig::default();
        assert_eq!(
            config.deadline_for(Duration::from_secs(10)),
            Duration::from_secs(11)
        );
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[heartbeat]\ninterval_secs = 30\n\n[detectors]\namd_enabled = false\n"
        )
        .unwrap();

        let config = FleetConfig::from_file(file.path()).unwrap();
        assert_eq!(config.heartbeat.interval_secs, 30);
        assert_eq!(config.heartbeat.missed_threshold, 3);
        assert!(!config.detectors.amd_enabled);
        assert!(config.detectors.nvidia_enabled);
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "health:\n  recovery_policy: require_resource_validation\n").unwrap();

        let config = FleetConfig::from_file(file.path()).unwrap();
        assert_eq!(config.health.recovery_policy, RecoveryPolicy::RequireResourceValidation);
    }

    #[test]
    fn test_identity_providers_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[identity]\nproviders = [\"p1\", \"p2\"]\n").unwrap();

        let config = FleetConfig::from_file(file.path()).unwrap();
        assert_eq!(config.identity.providers, vec!["p1".to_string(), "p2".to_string()]);
        assert!(FleetConfig::default().identity.providers.is_empty());
    }

    #[test]
    fn test_validate_rejects_blank_provider() {
        let config = FleetConfig::builder().providers(["p1", " "]).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(FleetConfig::from_file(file.path()).is_err());
    }
}
