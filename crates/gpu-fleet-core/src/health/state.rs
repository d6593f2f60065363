use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::score::{health_score, LatencyWindow, UptimeWindow};
use crate::config::{HealthConfig, HeartbeatConfig, RecoveryPolicy};
use crate::contracts::{ProviderHealthStatus, ProviderStatus, ResourceState, ResourceStatus};

const RECENT_INCIDENTS: usize = 20;

/// Everything the aggregator tracks for one provider
#[derive(Debug, Clone)]
pub(crate) struct ProviderEntry {
    pub status: ProviderHealthStatus,
    /// Server-side receipt time of the last applied heartbeat
    pub last_received_at: Option<DateTime<Utc>>,
    /// Missed slots since the last heartbeat already folded into the summary
    pub missed_recorded: u32,
    uptime: UptimeWindow,
    latency: LatencyWindow,
}

/// Resource state changes from one heartbeat, collapsed per resource
pub(crate) type ResourceTransitions = Vec<(String, ResourceState, ResourceState)>;

impl ProviderEntry {
    pub fn new(provider_id: &str, now: DateTime<Utc>, window: usize) -> Self {
        Self {
            status: ProviderHealthStatus::new(provider_id, now),
            last_received_at: None,
            missed_recorded: 0,
            uptime: UptimeWindow::new(window),
            latency: LatencyWindow::new(window),
        }
    }

    /// Apply reported resource statuses in order.
    ///
    /// Illegal state edges keep the stored state but still take the new
    /// utilization, metrics and issues. Returns the net transitions and a
    /// warning per ignored edge.
    pub fn apply_resources(&mut self, reports: &[ResourceStatus]) -> (ResourceTransitions, Vec<String>) {
        let mut initial: HashMap<String, ResourceState> = HashMap::new();
        let mut warnings = Vec::new();

        for report in reports {
            let index = self
                .status
                .resource_statuses
                .iter()
                .position(|r| r.resource_id == report.resource_id);

            match index {
                None => {
                    initial
                        .entry(report.resource_id.clone())
                        .or_insert(ResourceState::Unknown);
                    self.status.resource_statuses.push(report.clone());
                }
                Some(i) => {
                    let stored = &mut self.status.resource_statuses[i];
                    initial
                        .entry(report.resource_id.clone())
                        .or_insert(stored.state);

                    let state = if stored.state.can_transition_to(report.state) {
                        report.state
                    } else {
                        warnings.push(format!(
                            "resource {}: transition {} -> {} ignored",
                            report.resource_id,
                            stored.state.as_str(),
                            report.state.as_str()
                        ));
                        stored.state
                    };
                    *stored = ResourceStatus {
                        state,
                        ..report.clone()
                    };
                }
            }
        }

        let mut transitions: ResourceTransitions = initial
            .into_iter()
            .filter_map(|(id, before)| {
                let after = self.status.resource(&id)?.state;
                (before != after).then_some((id, before, after))
            })
            .collect();
        transitions.sort_by(|a, b| a.0.cmp(&b.0));
        (transitions, warnings)
    }

    /// Fold an accepted heartbeat into the summary counters
    pub fn record_heartbeat(&mut self, latency_ms: f64) {
        let summary = &mut self.status.summary;
        summary.total_heartbeats += 1;
        summary.consecutive_successful_heartbeats += 1;
        summary.consecutive_failed_heartbeats = 0;
        self.uptime.record(true);
        self.latency.record(latency_ms);
        self.missed_recorded = 0;
    }

    /// Fold newly detected missed slots into the summary counters
    pub fn record_missed(&mut self, missed_total: u32) -> u32 {
        let new = missed_total.saturating_sub(self.missed_recorded);
        for _ in 0..new {
            self.uptime.record(false);
        }
        let summary = &mut self.status.summary;
        summary.missed_heartbeats += new as u64;
        summary.consecutive_failed_heartbeats += new as u64;
        if new > 0 {
            summary.consecutive_successful_heartbeats = 0;
        }
        self.missed_recorded = self.missed_recorded.max(missed_total);
        new
    }

    pub fn rescore(&mut self, config: &HealthConfig) {
        let healthy = self
            .status
            .resource_statuses
            .iter()
            .filter(|r| !r.has_problem())
            .count();
        let total = self.status.resource_statuses.len();

        let summary = &mut self.status.summary;
        summary.uptime_percentage = self.uptime.percentage();
        summary.average_latency_ms = self.latency.average();
        summary.healthy_resources = healthy;
        summary.total_resources = total;
        self.status.health_score = health_score(
            config,
            summary.uptime_percentage,
            summary.average_latency_ms,
            healthy,
            total,
        );
    }

    /// Status implied by the current score and resource reports
    pub fn evaluate(&self, heartbeat: &HeartbeatConfig, health: &HealthConfig) -> ProviderStatus {
        let previous = self.status.status;
        let direct = matches!(previous, ProviderStatus::Unknown)
            || (previous == ProviderStatus::Offline && health.recovery_policy == RecoveryPolicy::Direct);
        if direct {
            return ProviderStatus::Healthy;
        }

        let problems = self
            .status
            .resource_statuses
            .iter()
            .filter(|r| r.has_problem())
            .count();
        let score = self.status.health_score;
        if score < health.unhealthy_threshold {
            ProviderStatus::Unhealthy
        } else if score < health.degraded_threshold || problems > heartbeat.resource_issue_threshold {
            ProviderStatus::Degraded
        } else {
            ProviderStatus::Healthy
        }
    }

    /// Mark every resource not in maintenance offline
    pub fn take_resources_offline(&mut self, now: DateTime<Utc>) -> ResourceTransitions {
        let mut transitions = Vec::new();
        for resource in &mut self.status.resource_statuses {
            if matches!(resource.state, ResourceState::Maintenance | ResourceState::Offline) {
                continue;
            }
            transitions.push((resource.resource_id.clone(), resource.state, ResourceState::Offline));
            resource.state = ResourceState::Offline;
            resource.last_updated = now;
        }
        transitions
    }

    pub fn push_incident(&mut self, id: uuid::Uuid) {
        let recent = &mut self.status.recent_incidents;
        if recent.last() == Some(&id) {
            return;
        }
        recent.retain(|existing| *existing != id);
        recent.push(id);
        if recent.len() > RECENT_INCIDENTS {
            recent.remove(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> ProviderEntry {
        ProviderEntry::new("p1", Utc::now(), 60)
    }

    #[test]
    fn test_flip_within_one_heartbeat_keeps_latest() {
        let mut entry = entry();
        let reports = vec![
            ResourceStatus::new("gpu-0", ResourceState::Available),
            ResourceStatus::new("gpu-0", ResourceState::Busy),
            ResourceStatus::new("gpu-0", ResourceState::Available),
        ];
        let (transitions, warnings) = entry.apply_resources(&reports);

        assert!(warnings.is_empty());
        assert_eq!(entry.status.resource("gpu-0").unwrap().state, ResourceState::Available);
        assert_eq!(
            transitions,
            vec![("gpu-0".to_string(), ResourceState::Unknown, ResourceState::Available)]
        );

        let (transitions, _) = entry.apply_resources(&reports);
        assert!(transitions.is_empty());
    }

    #[test]
    fn test_offline_resource_only_recovers_through_available() {
        let mut entry = entry();
        entry.apply_resources(&[ResourceStatus::new("gpu-0", ResourceState::Busy)]);
        entry.take_resources_offline(Utc::now());

        let (_, warnings) = entry.apply_resources(&[ResourceStatus::new("gpu-0", ResourceState::Busy)
            .with_utilization(80.0)]);
        assert_eq!(warnings.len(), 1);
        let stored = entry.status.resource("gpu-0").unwrap();
        assert_eq!(stored.state, ResourceState::Offline);
        assert_eq!(stored.utilization, 80.0);

        let (transitions, warnings) =
            entry.apply_resources(&[ResourceStatus::new("gpu-0", ResourceState::Available)]);
        assert!(warnings.is_empty());
        assert_eq!(transitions[0].2, ResourceState::Available);
    }

    #[test]
    fn test_maintenance_survives_going_offline() {
        let mut entry = entry();
        entry.apply_resources(&[
            ResourceStatus::new("gpu-0", ResourceState::Maintenance),
            ResourceStatus::new("gpu-1", ResourceState::Available),
        ]);
        let transitions = entry.take_resources_offline(Utc::now());
        assert_eq!(transitions.len(), 1);
        assert_eq!(entry.status.resource("gpu-0").unwrap().state, ResourceState::Maintenance);
    }

    #[test]
    fn test_missed_slots_counted_once() {
        let mut entry = entry();
        entry.record_heartbeat(10.0);
        assert_eq!(entry.record_missed(1), 1);
        assert_eq!(entry.record_missed(1), 0);
        assert_eq!(entry.record_missed(3), 2);
        assert_eq!(entry.status.summary.consecutive_failed_heartbeats, 3);
        assert_eq!(entry.status.summary.consecutive_successful_heartbeats, 0);

        entry.record_heartbeat(10.0);
        assert_eq!(entry.status.summary.consecutive_failed_heartbeats, 0);
        assert_eq!(entry.missed_recorded, 0);
    }

    #[test]
    fn test_recovery_policy() {
        let heartbeat = HeartbeatConfig::default();
        let mut entry = entry();
        entry.apply_resources(&[ResourceStatus::new("gpu-0", ResourceState::Error)]);
        entry.rescore(&HealthConfig::default());
        entry.status.status = ProviderStatus::Offline;

        assert_eq!(entry.evaluate(&heartbeat, &HealthConfig::default()), ProviderStatus::Healthy);

        let strict = HealthConfig {
            recovery_policy: RecoveryPolicy::RequireResourceValidation,
            ..Default::default()
        };
        assert_eq!(entry.evaluate(&heartbeat, &strict), ProviderStatus::Degraded);
    }
}
