//! Vendor detectors
//!
//! One [`VendorDetector`] per hardware vendor, each backed by the vendor's
//! command-line tooling through a [`CommandRunner`]. Detectors are selected by
//! runtime availability probing in [`VendorDetector::initialize`]; the
//! [`DetectorRegistry`] holds them keyed by vendor.
//!
//! Monitoring and benchmarking have shared default implementations built on
//! `discover_resources`/`get_resource_info`, so a new vendor only needs to
//! implement enumeration.

mod amd;
mod command;
mod intel;
mod monitor;
mod nvidia;
mod registry;

pub use amd::AmdDetector;
pub use command::{CommandOutput, CommandRunner, ScriptedCommandRunner, SystemCommandRunner};
pub use intel::IntelDetector;
pub use monitor::{poll_for_changes, sampled_benchmark, SnapshotDiffer};
pub use nvidia::NvidiaDetector;
pub use registry::{DetectorRegistry, InitializationReport};

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{DetectorConfig, DiscoveryConfig};
use crate::contracts::{BenchmarkKind, BenchmarkResult, ChangeEvent, ChangeThresholds, ResourceDescriptor, Vendor};
use crate::error::{FleetError, Result};

/// Invoked once per detected change
pub type ChangeCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Diff rules a monitor applies between polls, taken from the discovery config
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorSettings {
    pub thresholds: ChangeThresholds,
    pub removal_grace_cycles: u32,
}

impl MonitorSettings {
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            thresholds: config.change_thresholds(),
            removal_grace_cycles: config.removal_grace_cycles,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from_config(&DiscoveryConfig::default())
    }
}

/// Discovery, polling and benchmarking against one vendor's tooling
#[async_trait]
pub trait VendorDetector: Send + Sync + Debug {
    fn vendor(&self) -> Vendor;

    fn vendor_name(&self) -> &'static str {
        self.vendor().as_str()
    }

    /// Check for the vendor tool. Idempotent; a failure only affects this detector.
    async fn initialize(&self, cancel: &CancellationToken) -> Result<()>;

    /// Release anything acquired by `initialize`
    async fn cleanup(&self) -> Result<()>;

    /// Whether the last `initialize` found a working tool
    fn is_available(&self) -> bool;

    /// Enumerate every device.
    ///
    /// Fails with `DetectorUnavailable` when the tool is absent and with
    /// `PartialDiscovery` (carrying the parsed devices) when only some of
    /// the listed devices could be read.
    async fn discover_resources(&self, cancel: &CancellationToken) -> Result<Vec<ResourceDescriptor>>;

    async fn get_resource_info(&self, cancel: &CancellationToken, resource_id: &str) -> Result<ResourceDescriptor> {
        let resources = match self.discover_resources(cancel).await {
            Ok(resources) => resources,
            Err(FleetError::PartialDiscovery { resources, .. }) => resources,
            Err(e) => return Err(e),
        };
        resources
            .into_iter()
            .find(|r| r.id == resource_id)
            .ok_or_else(|| FleetError::ResourceNotFound(resource_id.to_string()))
    }

    /// Poll until `cancel` fires, invoking `callback` once per change
    async fn monitor_changes(
        &self,
        cancel: CancellationToken,
        callback: ChangeCallback,
        settings: MonitorSettings,
    ) -> Result<()> {
        poll_for_changes(self, cancel, callback, self.monitor_interval(), settings).await
    }

    /// Sample the device for `duration`; the registry enforces the deadline
    async fn run_benchmark(
        &self,
        cancel: &CancellationToken,
        resource_id: &str,
        kind: BenchmarkKind,
        duration: Duration,
    ) -> Result<BenchmarkResult> {
        sampled_benchmark(self, cancel, resource_id, kind, duration).await
    }

    fn monitor_interval(&self) -> Duration {
        Duration::from_secs(15)
    }
}

/// Availability bookkeeping shared by the CLI-backed detectors
#[derive(Debug, Default)]
pub(crate) struct ToolState {
    initialized: AtomicBool,
    available: AtomicBool,
}

impl ToolState {
    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub(crate) fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub(crate) fn mark(&self, available: bool) {
        self.available.store(available, Ordering::Release);
        self.initialized.store(true, Ordering::Release);
    }

    pub(crate) fn reset(&self) {
        self.available.store(false, Ordering::Release);
        self.initialized.store(false, Ordering::Release);
    }

    pub(crate) fn require(&self, vendor: Vendor) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else if self.is_initialized() {
            Err(FleetError::unavailable(vendor, "vendor tool not found"))
        } else {
            Err(FleetError::unavailable(vendor, "detector not initialized"))
        }
    }
}

/// Build the default detector set for the enabled vendors
pub fn default_detectors(config: &DetectorConfig, runner: Arc<dyn CommandRunner>) -> Vec<Arc<dyn VendorDetector>> {
    config
        .enabled_vendors()
        .into_iter()
        .map(|vendor| -> Arc<dyn VendorDetector> {
            match vendor {
                Vendor::Nvidia => Arc::new(NvidiaDetector::new(runner.clone(), config.monitor_interval())),
                Vendor::Amd => Arc::new(AmdDetector::new(runner.clone(), config.monitor_interval())),
                Vendor::Intel => Arc::new(IntelDetector::new(runner.clone(), config.monitor_interval())),
            }
        })
        .collect()
}

/// Treat the usual "no reading" markers of vendor tools as absent
pub(crate) fn parse_reading<T: std::str::FromStr>(raw: &str) -> Option<T> {
    let value = raw.trim();
    if value.is_empty() || value.starts_with('[') || value.eq_ignore_ascii_case("n/a") {
        return None;
    }
    value.parse().ok()
}
