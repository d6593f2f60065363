//! Detector registry
//!
//! Maps each vendor to at most one detector and routes calls by vendor.

use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChangeCallback, MonitorSettings, VendorDetector};
use crate::config::BenchmarkConfig;
use crate::contracts::{BenchmarkKind, BenchmarkResult, ResourceDescriptor, Vendor};
use crate::error::{FleetError, Result};

#[derive(Debug)]
struct Slot {
    detector: Arc<dyn VendorDetector>,
    initialized: bool,
}

/// Outcome of [`DetectorRegistry::initialize_all`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InitializationReport {
    pub initialized: Vec<Vendor>,
    pub failed: Vec<(Vendor, String)>,
}

impl InitializationReport {
    pub fn all_failed(&self) -> bool {
        self.initialized.is_empty()
    }
}

#[derive(Debug)]
pub struct DetectorRegistry {
    slots: RwLock<BTreeMap<Vendor, Slot>>,
    init_timeout: Duration,
    benchmark: BenchmarkConfig,
}

impl DetectorRegistry {
    pub fn new(init_timeout: Duration, benchmark: BenchmarkConfig) -> Self {
        Self {
            slots: RwLock::new(BTreeMap::new()),
            init_timeout,
            benchmark,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<Vendor, Slot>> {
        self.slots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<Vendor, Slot>> {
        self.slots.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a detector; a second detector for the same vendor is rejected
    pub fn register_detector(&self, detector: Arc<dyn VendorDetector>) -> Result<()> {
        let vendor = detector.vendor();
        let mut slots = self.write();
        if slots.contains_key(&vendor) {
            return Err(FleetError::DuplicateVendor(vendor));
        }
        slots.insert(
            vendor,
            Slot {
                detector,
                initialized: false,
            },
        );
        debug!(vendor = %vendor, "Detector registered");
        Ok(())
    }

    pub fn vendors(&self) -> Vec<Vendor> {
        self.read().keys().copied().collect()
    }

    pub fn get(&self, vendor: Vendor) -> Result<Arc<dyn VendorDetector>> {
        self.read()
            .get(&vendor)
            .map(|slot| slot.detector.clone())
            .ok_or(FleetError::UnknownVendor(vendor))
    }

    /// Initialize every registered detector in parallel.
    ///
    /// A failing or hanging detector is reported and skipped; it never
    /// prevents the others from initializing.
    pub async fn initialize_all(&self, cancel: &CancellationToken) -> InitializationReport {
        let detectors: Vec<_> = self
            .read()
            .iter()
            .map(|(vendor, slot)| (*vendor, slot.detector.clone()))
            .collect();

        let init_timeout = self.init_timeout;
        let outcomes = join_all(detectors.into_iter().map(|(vendor, detector)| async move {
            let outcome = match timeout(init_timeout, detector.initialize(cancel)).await {
                Ok(result) => result,
                Err(_) => Err(FleetError::unavailable(
                    vendor,
                    format!("initialization timed out after {}ms", init_timeout.as_millis()),
                )),
            };
            (vendor, outcome)
        }))
        .await;

        let mut report = InitializationReport::default();
        let mut slots = self.write();
        for (vendor, outcome) in outcomes {
            let initialized = outcome.is_ok();
            if let Some(slot) = slots.get_mut(&vendor) {
                slot.initialized = initialized;
            }
            match outcome {
                Ok(()) => report.initialized.push(vendor),
                Err(e) => {
                    warn!(vendor = %vendor, error = %e, "Detector failed to initialize");
                    report.failed.push((vendor, e.to_string()));
                }
            }
        }

        info!(
            initialized = report.initialized.len(),
            failed = report.failed.len(),
            "Detector initialization complete"
        );
        report
    }

    /// Release every detector; safe after partial or no initialization
    pub async fn cleanup_all(&self) {
        let detectors: Vec<_> = self
            .read()
            .values()
            .map(|slot| slot.detector.clone())
            .collect();

        for detector in detectors {
            if let Err(e) = detector.cleanup().await {
                warn!(vendor = %detector.vendor(), error = %e, "Detector cleanup failed");
            }
        }
        for slot in self.write().values_mut() {
            slot.initialized = false;
        }
    }

    /// Initialized, available detectors, optionally restricted to `filter`
    pub fn available_detectors(&self, filter: Option<&[Vendor]>) -> Vec<Arc<dyn VendorDetector>> {
        self.read()
            .iter()
            .filter(|(vendor, _)| filter.map_or(true, |f| f.is_empty() || f.contains(vendor)))
            .filter(|(_, slot)| slot.initialized && slot.detector.is_available())
            .map(|(_, slot)| slot.detector.clone())
            .collect()
    }

    /// Vendor encoded in a resource id
    pub fn vendor_for_resource(resource_id: &str) -> Result<Vendor> {
        resource_id
            .split_once('-')
            .and_then(|(prefix, _)| prefix.parse().ok())
            .ok_or_else(|| FleetError::ResourceNotFound(resource_id.to_string()))
    }

    pub async fn get_resource_info(&self, cancel: &CancellationToken, resource_id: &str) -> Result<ResourceDescriptor> {
        let vendor = Self::vendor_for_resource(resource_id)?;
        let detector = self.get(vendor).map_err(|_| FleetError::ResourceNotFound(resource_id.to_string()))?;
        detector.get_resource_info(cancel, resource_id).await
    }

    /// Run one benchmark under the `duration * (1 + grace)` deadline
    pub async fn run_benchmark(
        &self,
        cancel: &CancellationToken,
        resource_id: &str,
        kind: BenchmarkKind,
        duration: Duration,
    ) -> Result<BenchmarkResult> {
        let vendor = Self::vendor_for_resource(resource_id)?;
        let detector = self.get(vendor).map_err(|_| FleetError::ResourceNotFound(resource_id.to_string()))?;
        let deadline = self.benchmark.deadline_for(duration);

        match timeout(deadline, detector.run_benchmark(cancel, resource_id, kind, duration)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(resource_id = %resource_id, kind = %kind, limit_ms = deadline.as_millis() as u64, "Benchmark timed out");
                Err(FleetError::BenchmarkTimeout {
                    resource_id: resource_id.to_string(),
                    limit_ms: deadline.as_millis() as u64,
                })
            }
        }
    }

    /// Route a monitor subscription to the vendor's detector
    pub async fn monitor_changes(
        &self,
        vendor: Vendor,
        cancel: CancellationToken,
        callback: ChangeCallback,
        settings: MonitorSettings,
    ) -> Result<()> {
        self.get(vendor)?.monitor_changes(cancel, callback, settings).await
    }
}
