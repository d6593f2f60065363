//! Poll diffing and sampled benchmarks shared by all detectors

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ChangeCallback, MonitorSettings, VendorDetector};
use crate::contracts::{BenchmarkKind, BenchmarkResult, ChangeEvent, ChangeThresholds, ChangeType, ResourceDescriptor};
use crate::error::{FleetError, Result};

const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
const MAX_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct Tracked {
    latest: ResourceDescriptor,
    /// Snapshot last reported to listeners
    baseline: ResourceDescriptor,
    missed: u32,
}

/// Diffs successive polls of one vendor into change events.
///
/// Status drift is measured against the last *reported* snapshot, so slow
/// drift eventually produces an event. A device is removed only after it is
/// missing from more than `removal_grace_cycles` consecutive complete polls.
#[derive(Debug, Clone)]
pub struct SnapshotDiffer {
    tracked: HashMap<String, Tracked>,
    thresholds: ChangeThresholds,
    removal_grace_cycles: u32,
}

impl SnapshotDiffer {
    pub fn new(thresholds: ChangeThresholds, removal_grace_cycles: u32) -> Self {
        Self {
            tracked: HashMap::new(),
            thresholds,
            removal_grace_cycles,
        }
    }

    /// Apply one poll. Absence is only counted when `complete` is set.
    pub fn apply(&mut self, current: Vec<ResourceDescriptor>, complete: bool) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        let mut seen = HashSet::with_capacity(current.len());

        for resource in current {
            seen.insert(resource.uuid.clone());
            events.extend(self.observe(resource));
        }

        if complete {
            let grace = self.removal_grace_cycles;
            let mut expired = Vec::new();
            for (uuid, tracked) in self.tracked.iter_mut() {
                if seen.contains(uuid) {
                    continue;
                }
                tracked.missed += 1;
                if tracked.missed > grace {
                    expired.push(uuid.clone());
                } else {
                    debug!(resource_id = %tracked.latest.id, missed = tracked.missed, "Resource missing from poll");
                }
            }
            for uuid in expired {
                if let Some(tracked) = self.tracked.remove(&uuid) {
                    events.push(ChangeEvent::removed(tracked.latest, tracked.missed));
                }
            }
        }

        events
    }

    /// Upsert a single device without touching the others
    pub fn observe(&mut self, mut resource: ResourceDescriptor) -> Option<ChangeEvent> {
        let thresholds = self.thresholds;

        let Some(tracked) = self.tracked.get_mut(&resource.uuid) else {
            self.tracked.insert(
                resource.uuid.clone(),
                Tracked {
                    latest: resource.clone(),
                    baseline: resource.clone(),
                    missed: 0,
                },
            );
            return Some(ChangeEvent::added(resource));
        };

        if resource.last_seen <= tracked.latest.last_seen {
            resource.last_seen = tracked.latest.last_seen + chrono::Duration::microseconds(1);
        }
        tracked.missed = 0;

        let change = resource.classify_change(&tracked.baseline, &thresholds);
        tracked.latest = resource;

        change.map(|change_type| {
            tracked.baseline = tracked.latest.clone();
            let description = describe(change_type, &tracked.latest);
            ChangeEvent::new(change_type, tracked.latest.clone(), description)
        })
    }

    /// Remove devices whose `last_seen` is older than `cutoff`
    pub fn prune_older_than(&mut self, cutoff: DateTime<Utc>) -> Vec<ChangeEvent> {
        let stale: Vec<String> = self
            .tracked
            .iter()
            .filter(|(_, t)| t.latest.last_seen < cutoff)
            .map(|(uuid, _)| uuid.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|uuid| self.tracked.remove(&uuid))
            .map(|t| {
                let description = format!(
                    "{} ({}) not refreshed since {}",
                    t.latest.name,
                    t.latest.id,
                    t.latest.last_seen.to_rfc3339()
                );
                ChangeEvent::new(ChangeType::Removed, t.latest, description)
            })
            .collect()
    }

    pub fn get(&self, uuid: &str) -> Option<&ResourceDescriptor> {
        self.tracked.get(uuid).map(|t| &t.latest)
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.tracked.values().map(|t| &t.latest)
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }
}

fn describe(change_type: ChangeType, resource: &ResourceDescriptor) -> String {
    match change_type {
        ChangeType::PerformanceUpdate => {
            let mut text = format!(
                "{} ({}) utilization {:.0}%",
                resource.name, resource.id, resource.status.utilization_pct
            );
            if let Some(t) = resource.status.temperature_c {
                text.push_str(&format!(", temperature {:.0}C", t));
            }
            if let Some(p) = resource.status.power_draw_w {
                text.push_str(&format!(", power {:.0}W", p));
            }
            text
        }
        ChangeType::Modified => format!("{} ({}) configuration changed", resource.name, resource.id),
        ChangeType::Added => format!("{} ({}) discovered", resource.name, resource.id),
        ChangeType::Removed => format!("{} ({}) removed", resource.name, resource.id),
    }
}

/// Default `monitor_changes`: poll every `interval` and report diffs.
///
/// The first poll only establishes the baseline. Polls that fail are
/// skipped and never count as absence; partial polls update the devices
/// they did return.
pub async fn poll_for_changes<D: VendorDetector + ?Sized>(
    detector: &D,
    cancel: CancellationToken,
    callback: ChangeCallback,
    interval: Duration,
    settings: MonitorSettings,
) -> Result<()> {
    let vendor = detector.vendor();
    let mut differ = SnapshotDiffer::new(settings.thresholds, settings.removal_grace_cycles);
    let mut primed = false;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(vendor = %vendor, "Change monitor stopped");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        let (resources, complete) = match detector.discover_resources(&cancel).await {
            Ok(resources) => (resources, true),
            Err(FleetError::PartialDiscovery { resources, .. }) => (resources, false),
            Err(FleetError::Cancelled) => return Ok(()),
            Err(e) => {
                warn!(vendor = %vendor, error = %e, "Monitor poll failed");
                continue;
            }
        };

        let events = differ.apply(resources, complete);
        if primed {
            for event in events {
                callback(event);
            }
        }
        primed = true;
    }
}

/// Default `run_benchmark`: sample the device's telemetry for `duration`.
///
/// Cancellation after at least one sample returns the truncated result.
pub async fn sampled_benchmark<D: VendorDetector + ?Sized>(
    detector: &D,
    cancel: &CancellationToken,
    resource_id: &str,
    kind: BenchmarkKind,
    duration: Duration,
) -> Result<BenchmarkResult> {
    let interval = (duration / 10).clamp(MIN_SAMPLE_INTERVAL, MAX_SAMPLE_INTERVAL);
    let started = Instant::now();
    let mut samples = Vec::new();
    let mut truncated = false;

    loop {
        let info = detector.get_resource_info(cancel, resource_id).await?;
        match sample(kind, &info) {
            Some(value) => samples.push(value),
            None => {
                return Err(FleetError::invalid_input(format!(
                    "{} does not report the reading needed for a {} benchmark",
                    resource_id, kind
                )))
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= duration {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                truncated = true;
                break;
            }
            _ = tokio::time::sleep(interval.min(duration - elapsed)) => {}
        }
    }

    let count = samples.len() as f64;
    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = samples.iter().sum::<f64>() / count;
    let score = match kind {
        BenchmarkKind::Thermal => max,
        _ => mean,
    };

    Ok(
        BenchmarkResult::new(resource_id, kind, score, started.elapsed().as_secs_f64())
            .with_metadata("samples", json!(samples.len()))
            .with_metadata("min", json!(min))
            .with_metadata("max", json!(max))
            .with_metadata("vendor", json!(detector.vendor_name()))
            .with_metadata("truncated", json!(truncated)),
    )
}

fn sample(kind: BenchmarkKind, resource: &ResourceDescriptor) -> Option<f64> {
    let status = &resource.status;
    match kind {
        BenchmarkKind::Thermal => status.temperature_c,
        BenchmarkKind::Power => status.power_draw_w,
        BenchmarkKind::Memory => Some(status.memory_free_mb as f64),
        BenchmarkKind::Utilization => Some((100.0 - status.utilization_pct).max(0.0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{DeviceStatus, Vendor};

    fn gpu(uuid: &str, utilization: f64) -> ResourceDescriptor {
        ResourceDescriptor::new(Vendor::Nvidia, uuid, 0, "NVIDIA L4").with_status(DeviceStatus {
            utilization_pct: utilization,
            memory_used_mb: 0,
            memory_free_mb: 24_000,
            temperature_c: Some(40.0),
            power_draw_w: Some(30.0),
            processes: vec![],
        })
    }

    #[test]
    fn test_first_sighting_is_added() {
        let mut differ = SnapshotDiffer::new(ChangeThresholds::default(), 2);
        let events = differ.apply(vec![gpu("GPU-a", 0.0), gpu("GPU-b", 0.0)], true);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.change_type == ChangeType::Added));
        assert!(differ.apply(vec![gpu("GPU-a", 1.0), gpu("GPU-b", 2.0)], true).is_empty());
    }

    #[test]
    fn test_removal_waits_for_grace() {
        let mut differ = SnapshotDiffer::new(ChangeThresholds::default(), 2);
        differ.apply(vec![gpu("GPU-a", 0.0)], true);

        assert!(differ.apply(vec![], true).is_empty());
        assert!(differ.apply(vec![], true).is_empty());
        let events = differ.apply(vec![], true);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change_type, ChangeType::Removed);
        assert!(differ.is_empty());
    }

    #[test]
    fn test_incomplete_polls_do_not_count_absence() {
        let mut differ = SnapshotDiffer::new(ChangeThresholds::default(), 0);
        differ.apply(vec![gpu("GPU-a", 0.0)], true);
        assert!(differ.apply(vec![], false).is_empty());
        assert_eq!(differ.len(), 1);
    }

    #[test]
    fn test_slow_drift_measured_from_reported_baseline() {
        let mut differ = SnapshotDiffer::new(ChangeThresholds::default(), 2);
        differ.apply(vec![gpu("GPU-a", 10.0)], true);
        assert!(differ.apply(vec![gpu("GPU-a", 13.0)], true).is_empty());
        assert!(differ.apply(vec![gpu("GPU-a", 15.0)], true).is_empty());
        let events = differ.apply(vec![gpu("GPU-a", 16.0)], true);
        assert_eq!(events[0].change_type, ChangeType::PerformanceUpdate);
    }

    #[test]
    fn test_last_seen_strictly_increases() {
        let mut differ = SnapshotDiffer::new(ChangeThresholds::default(), 2);
        let first = gpu("GPU-a", 0.0);
        let stamp = first.last_seen;
        differ.apply(vec![first], true);

        let mut again = gpu("GPU-a", 0.0);
        again.last_seen = stamp;
        differ.apply(vec![again], true);
        assert!(differ.get("GPU-a").unwrap().last_seen > stamp);
    }

    #[test]
    fn test_prune_removes_stale() {
        let mut differ = SnapshotDiffer::new(ChangeThresholds::default(), 2);
        differ.apply(vec![gpu("GPU-a", 0.0)], true);
        let events = differ.prune_older_than(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(events.len(), 1);
        assert!(differ.is_empty());
    }
}
