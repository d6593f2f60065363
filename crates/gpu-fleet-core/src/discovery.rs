//! Discovery engine
//!
//! Fans a discovery cycle out to every available detector, merges the
//! results into one inventory keyed by `(vendor, uuid)` and publishes the
//! differences as [`ChangeEvent`]s.
//!
//! Each vendor keeps its own [`SnapshotDiffer`], and a vendor's diff is only
//! applied when that vendor was actually polled. A detector that fails or
//! times out therefore never makes its devices look absent. Detector errors
//! end up as warnings on the [`DiscoveryReport`]; only a cycle in which no
//! detector succeeded fails with [`FleetError::DiscoveryFailed`].
//!
//! Listeners receive events through a bounded broadcast queue. A listener
//! that falls behind loses the oldest events, which is counted in
//! `fleet_change_events_dropped_total`; the discovery cycle never waits on
//! a listener.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::{BenchmarkConfig, DiscoveryConfig};
use crate::contracts::{BenchmarkKind, BenchmarkResult, ChangeEvent, ChangeType, ResourceDescriptor, Vendor};
use crate::detectors::{DetectorRegistry, MonitorSettings, SnapshotDiffer, VendorDetector};
use crate::error::{FleetError, Result};
use crate::telemetry::FleetMetrics;

/// Result of one `discover_all` call
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryReport {
    pub resources: Vec<ResourceDescriptor>,
    /// Per-vendor problems that did not fail the cycle
    pub warnings: Vec<String>,
    /// Changes detected by this cycle; empty for cached results
    pub events: Vec<ChangeEvent>,
    pub from_cache: bool,
    pub cycle: u64,
    pub duration_ms: u64,
}

#[derive(Debug)]
struct CachedSnapshot {
    taken_at: Instant,
    warnings: Vec<String>,
}

#[derive(Debug)]
struct Inventory {
    differs: BTreeMap<Vendor, SnapshotDiffer>,
    snapshot: Option<CachedSnapshot>,
    cycle: u64,
}

impl Inventory {
    fn resources(&self, filter: Option<&[Vendor]>) -> Vec<ResourceDescriptor> {
        let mut resources: Vec<ResourceDescriptor> = self
            .differs
            .iter()
            .filter(|(vendor, _)| matches_filter(filter, **vendor))
            .flat_map(|(_, differ)| differ.resources().cloned())
            .collect();
        resources.sort_by(|a, b| (a.vendor, a.index, &a.uuid).cmp(&(b.vendor, b.index, &b.uuid)));
        resources
    }

    fn find(&self, resource_id: &str) -> Option<ResourceDescriptor> {
        self.differs
            .values()
            .flat_map(|d| d.resources())
            .find(|r| r.id == resource_id)
            .cloned()
    }
}

fn matches_filter(filter: Option<&[Vendor]>, vendor: Vendor) -> bool {
    filter.map_or(true, |f| f.is_empty() || f.contains(&vendor))
}

enum PollOutcome {
    Complete(Vec<ResourceDescriptor>),
    Partial(Vec<ResourceDescriptor>, String),
    Failed(String),
}

/// Receiving end of the change stream
pub struct ChangeSubscription {
    receiver: broadcast::Receiver<ChangeEvent>,
    metrics: Arc<FleetMetrics>,
}

impl ChangeSubscription {
    /// Next event; `None` once the engine is gone
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Change listener fell behind, oldest events dropped");
                    self.metrics.record_dropped_events(skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

pub struct DiscoveryEngine {
    registry: Arc<DetectorRegistry>,
    config: DiscoveryConfig,
    benchmark: BenchmarkConfig,
    inventory: Mutex<Inventory>,
    /// Serializes discovery cycles
    cycle_lock: tokio::sync::Mutex<()>,
    changes: broadcast::Sender<ChangeEvent>,
    history: DashMap<String, VecDeque<BenchmarkResult>>,
    clock: SharedClock,
    metrics: Arc<FleetMetrics>,
}

impl DiscoveryEngine {
    pub fn new(
        registry: Arc<DetectorRegistry>,
        config: DiscoveryConfig,
        benchmark: BenchmarkConfig,
        clock: SharedClock,
        metrics: Arc<FleetMetrics>,
    ) -> Self {
        let (changes, _) = broadcast::channel(config.listener_queue_size.max(1));
        Self {
            registry,
            config,
            benchmark,
            inventory: Mutex::new(Inventory {
                differs: BTreeMap::new(),
                snapshot: None,
                cycle: 0,
            }),
            cycle_lock: tokio::sync::Mutex::new(()),
            changes,
            history: DashMap::new(),
            clock,
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inventory> {
        self.inventory.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn registry(&self) -> &Arc<DetectorRegistry> {
        &self.registry
    }

    /// Subscribe to change events from now on
    pub fn subscribe(&self) -> ChangeSubscription {
        ChangeSubscription {
            receiver: self.changes.subscribe(),
            metrics: self.metrics.clone(),
        }
    }

    fn publish(&self, events: &[ChangeEvent]) {
        for event in events {
            self.metrics.record_change_event(event.change_type.as_str());
            // No subscribers is fine.
            let _ = self.changes.send(event.clone());
        }
    }

    fn differ_for<'a>(&self, inventory: &'a mut Inventory, vendor: Vendor) -> &'a mut SnapshotDiffer {
        let thresholds = self.config.change_thresholds();
        let grace = self.config.removal_grace_cycles;
        inventory
            .differs
            .entry(vendor)
            .or_insert_with(|| SnapshotDiffer::new(thresholds, grace))
    }

    /// Current inventory without polling
    pub fn inventory(&self, filter: Option<&[Vendor]>) -> Vec<ResourceDescriptor> {
        self.lock().resources(filter)
    }

    /// Poll every available detector, or return the cached snapshot when
    /// `force_refresh` is unset and the last full cycle is younger than the TTL.
    pub async fn discover_all(
        &self,
        cancel: &CancellationToken,
        force_refresh: bool,
        vendor_filter: Option<&[Vendor]>,
    ) -> Result<DiscoveryReport> {
        if !force_refresh {
            if let Some(report) = self.cached_report(vendor_filter) {
                return Ok(report);
            }
        }

        let _cycle = self.cycle_lock.lock().await;
        let started = Instant::now();

        let detectors = self.registry.available_detectors(vendor_filter);
        let polled: HashSet<Vendor> = detectors.iter().map(|d| d.vendor()).collect();
        let mut warnings: Vec<String> = self
            .registry
            .vendors()
            .into_iter()
            .filter(|v| matches_filter(vendor_filter, *v) && !polled.contains(v))
            .map(|v| format!("{}: detector unavailable", v))
            .collect();

        if detectors.is_empty() {
            self.metrics
                .record_discovery_cycle("failed", started.elapsed().as_secs_f64());
            if warnings.is_empty() {
                warnings.push("no detectors registered".to_string());
            }
            return Err(FleetError::DiscoveryFailed(warnings));
        }

        let (outcomes, cancelled) = self.poll(cancel, detectors).await;

        let mut succeeded = 0usize;
        let mut events = Vec::new();
        let report = {
            let mut inventory = self.lock();
            for (vendor, outcome) in outcomes {
                match outcome {
                    PollOutcome::Complete(resources) => {
                        succeeded += 1;
                        events.extend(self.differ_for(&mut inventory, vendor).apply(resources, true));
                    }
                    PollOutcome::Partial(resources, message) => {
                        succeeded += 1;
                        self.metrics.record_detector_error(vendor.as_str(), "partial_discovery");
                        warnings.push(format!("{}: {}", vendor, message));
                        events.extend(self.differ_for(&mut inventory, vendor).apply(resources, false));
                    }
                    PollOutcome::Failed(message) => {
                        self.metrics.record_detector_error(vendor.as_str(), "failed");
                        warnings.push(format!("{}: {}", vendor, message));
                    }
                }
            }
            if cancelled {
                warnings.push("discovery cancelled before every vendor reported".to_string());
            }

            if succeeded > 0 {
                inventory.cycle += 1;
                if vendor_filter.map_or(true, |f| f.is_empty()) && !cancelled {
                    inventory.snapshot = Some(CachedSnapshot {
                        taken_at: Instant::now(),
                        warnings: warnings.clone(),
                    });
                }
                for (vendor, differ) in &inventory.differs {
                    self.metrics.set_resources(vendor.as_str(), differ.len());
                }
            }

            DiscoveryReport {
                resources: inventory.resources(vendor_filter),
                warnings,
                events: events.clone(),
                from_cache: false,
                cycle: inventory.cycle,
                duration_ms: started.elapsed().as_millis() as u64,
            }
        };

        if succeeded == 0 {
            self.metrics
                .record_discovery_cycle("failed", started.elapsed().as_secs_f64());
            if cancelled {
                return Err(FleetError::Cancelled);
            }
            warn!(warnings = ?report.warnings, "Every detector failed");
            return Err(FleetError::DiscoveryFailed(report.warnings));
        }

        self.publish(&events);
        self.metrics.record_discovery_cycle(
            if report.warnings.is_empty() { "success" } else { "partial" },
            started.elapsed().as_secs_f64(),
        );
        info!(
            cycle = report.cycle,
            resources = report.resources.len(),
            changes = report.events.len(),
            warnings = report.warnings.len(),
            duration_ms = report.duration_ms,
            "Discovery cycle complete"
        );
        Ok(report)
    }

    fn cached_report(&self, vendor_filter: Option<&[Vendor]>) -> Option<DiscoveryReport> {
        let inventory = self.lock();
        let snapshot = inventory.snapshot.as_ref()?;
        if snapshot.taken_at.elapsed() >= self.config.cache_ttl() {
            return None;
        }
        debug!(cycle = inventory.cycle, "Serving cached discovery snapshot");
        Some(DiscoveryReport {
            resources: inventory.resources(vendor_filter),
            warnings: snapshot.warnings.clone(),
            events: Vec::new(),
            from_cache: true,
            cycle: inventory.cycle,
            duration_ms: 0,
        })
    }

    /// One task per detector, each under its own timeout, the whole set
    /// bounded by the cycle timeout
    async fn poll(
        &self,
        cancel: &CancellationToken,
        detectors: Vec<Arc<dyn VendorDetector>>,
    ) -> (Vec<(Vendor, PollOutcome)>, bool) {
        let cycle_cancel = cancel.child_token();
        let detector_timeout = self.config.detector_timeout();
        let deadline = tokio::time::Instant::now() + self.config.cycle_timeout();

        let mut pending: HashSet<Vendor> = HashSet::new();
        let mut tasks = JoinSet::new();
        for detector in detectors {
            let vendor = detector.vendor();
            pending.insert(vendor);
            let token = cycle_cancel.clone();
            tasks.spawn(async move {
                let outcome = match tokio::time::timeout(detector_timeout, detector.discover_resources(&token)).await {
                    Ok(Ok(resources)) => PollOutcome::Complete(resources),
                    Ok(Err(FleetError::PartialDiscovery { resources, message, .. })) => {
                        PollOutcome::Partial(resources, message)
                    }
                    Ok(Err(e)) => PollOutcome::Failed(e.to_string()),
                    Err(_) => PollOutcome::Failed(format!("timed out after {}ms", detector_timeout.as_millis())),
                };
                (vendor, outcome)
            });
        }

        let mut outcomes = Vec::new();
        let mut cancelled = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                next = tokio::time::timeout_at(deadline, tasks.join_next()) => next,
            };
            match next {
                Ok(Some(Ok((vendor, outcome)))) => {
                    pending.remove(&vendor);
                    outcomes.push((vendor, outcome));
                }
                Ok(Some(Err(e))) => warn!(error = %e, "Discovery task failed"),
                Ok(None) => break,
                Err(_) => {
                    warn!(pending = pending.len(), "Discovery cycle deadline exceeded");
                    break;
                }
            }
        }

        cycle_cancel.cancel();
        tasks.abort_all();

        let reason = if cancelled {
            "cancelled".to_string()
        } else {
            format!("cycle deadline of {}ms exceeded", self.config.cycle_timeout_ms)
        };
        for vendor in pending {
            outcomes.push((vendor, PollOutcome::Failed(reason.clone())));
        }
        (outcomes, cancelled)
    }

    /// Live read of one resource, folded into the inventory.
    ///
    /// Falls back to the last known snapshot when the vendor tool is
    /// temporarily unusable.
    pub async fn get_resource_info(&self, cancel: &CancellationToken, resource_id: &str) -> Result<ResourceDescriptor> {
        match self.registry.get_resource_info(cancel, resource_id).await {
            Ok(resource) => {
                let event = {
                    let mut inventory = self.lock();
                    self.differ_for(&mut inventory, resource.vendor).observe(resource.clone())
                };
                if let Some(event) = event {
                    self.publish(&[event]);
                }
                Ok(resource)
            }
            Err(e @ FleetError::ResourceNotFound(_)) | Err(e @ FleetError::Cancelled) => Err(e),
            Err(e) => match self.lock().find(resource_id) {
                Some(cached) => {
                    warn!(resource_id = %resource_id, error = %e, "Live query failed, serving last snapshot");
                    Ok(cached)
                }
                None => Err(e),
            },
        }
    }

    /// Run the requested benchmarks one after another; all kinds when `kinds` is empty
    pub async fn run_benchmark(
        &self,
        cancel: &CancellationToken,
        resource_id: &str,
        kinds: &[BenchmarkKind],
        duration: Option<Duration>,
    ) -> Result<Vec<BenchmarkResult>> {
        let kinds: Vec<BenchmarkKind> = if kinds.is_empty() {
            BenchmarkKind::ALL.to_vec()
        } else {
            kinds.to_vec()
        };
        let duration = duration.unwrap_or(Duration::from_secs(self.benchmark.default_duration_secs));

        let mut results = Vec::with_capacity(kinds.len());
        for kind in kinds {
            match self.registry.run_benchmark(cancel, resource_id, kind, duration).await {
                Ok(result) => {
                    self.metrics.record_benchmark(kind.as_str(), "success");
                    self.record_result(result.clone());
                    results.push(result);
                }
                Err(e) => {
                    self.metrics.record_benchmark(kind.as_str(), e.code());
                    return Err(e);
                }
            }
        }
        Ok(results)
    }

    fn record_result(&self, result: BenchmarkResult) {
        let limit = self.benchmark.history_limit.max(1);
        let mut history = self.history.entry(result.resource_id.clone()).or_default();
        history.push_back(result);
        while history.len() > limit {
            history.pop_front();
        }
    }

    /// Benchmark results for a resource, oldest first
    pub fn benchmark_history(&self, resource_id: &str) -> Vec<BenchmarkResult> {
        self.history
            .get(resource_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove resources not refreshed within the staleness window
    pub fn prune_stale(&self, now: DateTime<Utc>) -> Vec<ChangeEvent> {
        let cutoff = now - self.config.staleness_window();
        let events: Vec<ChangeEvent> = {
            let mut inventory = self.lock();
            inventory
                .differs
                .values_mut()
                .flat_map(|d| d.prune_older_than(cutoff))
                .collect()
        };
        if !events.is_empty() {
            info!(removed = events.len(), "Pruned stale resources");
            self.publish(&events);
        }
        events
    }

    /// Fold a detector monitor event into the inventory and republish it
    /// when the engine's own view changes.
    ///
    /// A monitor that stops seeing a device does not remove it; removal is
    /// decided by the discovery cycles' grace counter alone.
    pub fn ingest_monitor_event(&self, event: ChangeEvent) -> Option<ChangeEvent> {
        let vendor = event.resource.vendor;
        let republished = {
            let mut inventory = self.lock();
            let differ = self.differ_for(&mut inventory, vendor);
            match event.change_type {
                ChangeType::Removed => {
                    if differ.get(&event.resource.uuid).is_some() {
                        debug!(
                            resource_id = %event.resource.id,
                            "Monitor lost resource, awaiting discovery grace"
                        );
                    }
                    None
                }
                _ => differ.observe(event.resource),
            }
        };
        if let Some(event) = &republished {
            self.publish(std::slice::from_ref(event));
        }
        republished
    }

    /// Periodic full discovery plus staleness pruning until cancelled
    pub async fn run_periodic(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.discover_all(&cancel, true, None).await {
                warn!(error = %e, "Periodic discovery failed");
            }
            self.prune_stale(self.clock.now());
        }
        debug!("Periodic discovery stopped");
    }

    /// Start one monitor task per available detector
    pub fn start_monitoring(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let settings = MonitorSettings::from_config(&self.config);
        self.registry
            .available_detectors(None)
            .into_iter()
            .map(|detector| {
                let engine = Arc::clone(self);
                let token = cancel.child_token();
                tokio::spawn(async move {
                    let vendor = detector.vendor();
                    let sink = engine.clone();
                    let callback = Arc::new(move |event: ChangeEvent| {
                        sink.ingest_monitor_event(event);
                    });
                    if let Err(e) = detector.monitor_changes(token, callback, settings).await {
                        warn!(vendor = %vendor, error = %e, "Change monitor exited");
                    }
                })
            })
            .collect()
    }
}
