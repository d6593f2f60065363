//! Health aggregator
//!
//! Per-provider state lives behind its own async mutex inside a `DashMap`,
//! so heartbeats from different providers never contend and the work done
//! under a provider's lock is bounded by the heartbeat's size. The
//! missed-heartbeat sweep snapshots the provider handles first and then
//! locks each provider briefly in turn.
//!
//! Side effects (availability events, persistence records) are collected
//! while the lock is held and released only after it is dropped.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{ProviderEntry, ResourceTransitions};
use crate::clock::SharedClock;
use crate::config::{FleetConfig, HealthConfig, HeartbeatConfig};
use crate::contracts::{
    AvailabilityEvent, Heartbeat, IncidentSeverity, IncidentType, OverallStatus, ProviderHealthStatus,
    ProviderStatus, ResourceState, SystemHealthOverview,
};
use crate::error::{FleetError, Result};
use crate::incidents::{AlertManager, IncidentManager, NewIncident};
use crate::persistence::{PersistRecord, PersistenceHandle};
use crate::telemetry::FleetMetrics;

const AVAILABILITY_CHANNEL_SIZE: usize = 1024;

/// What happened to a heartbeat handed to [`HealthAggregator::apply_heartbeat`]
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied {
        status: ProviderStatus,
        warnings: Vec<String>,
    },
    /// Same timestamp as the last applied heartbeat
    Duplicate,
    /// Older than the last applied heartbeat
    Stale,
}

/// Result of one missed-heartbeat sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub missed_slots: u64,
    pub newly_offline: Vec<String>,
}

#[derive(Default)]
struct Effects {
    events: Vec<AvailabilityEvent>,
    records: Vec<PersistRecord>,
}

pub struct HealthAggregator {
    providers: DashMap<String, Arc<Mutex<ProviderEntry>>>,
    heartbeat: HeartbeatConfig,
    health: HealthConfig,
    auto_resolve: bool,
    incidents: Arc<IncidentManager>,
    alerts: Arc<AlertManager>,
    persistence: Option<PersistenceHandle>,
    clock: SharedClock,
    metrics: Arc<FleetMetrics>,
    availability: broadcast::Sender<AvailabilityEvent>,
    status_counts: std::sync::Mutex<HashMap<ProviderStatus, usize>>,
}

impl std::fmt::Debug for HealthAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthAggregator")
            .field("providers", &self.providers.len())
            .field("heartbeat", &self.heartbeat)
            .finish()
    }
}

impl HealthAggregator {
    pub fn new(
        config: &FleetConfig,
        incidents: Arc<IncidentManager>,
        alerts: Arc<AlertManager>,
        clock: SharedClock,
        metrics: Arc<FleetMetrics>,
    ) -> Self {
        let (availability, _) = broadcast::channel(AVAILABILITY_CHANNEL_SIZE);
        Self {
            providers: DashMap::new(),
            heartbeat: config.heartbeat.clone(),
            health: config.health.clone(),
            auto_resolve: config.alerts.auto_resolve_on_recovery,
            incidents,
            alerts,
            persistence: None,
            clock,
            metrics,
            availability,
            status_counts: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Send health state, incidents and alerts to the persistence writer
    pub fn with_persistence(mut self, handle: PersistenceHandle) -> Self {
        self.persistence = Some(handle);
        self
    }

    pub fn incidents(&self) -> &Arc<IncidentManager> {
        &self.incidents
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    /// Provider and resource availability transitions
    pub fn subscribe_availability(&self) -> broadcast::Receiver<AvailabilityEvent> {
        self.availability.subscribe()
    }

    fn entry(&self, provider_id: &str, now: DateTime<Utc>) -> Arc<Mutex<ProviderEntry>> {
        if let Some(existing) = self.providers.get(provider_id) {
            return existing.clone();
        }
        match self.providers.entry(provider_id.to_string()) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => {
                let entry = Arc::new(Mutex::new(ProviderEntry::new(
                    provider_id,
                    now,
                    self.health.uptime_window,
                )));
                e.insert(entry.clone());
                self.count_transition(None, ProviderStatus::Unknown);
                entry
            }
        }
    }

    fn count_transition(&self, previous: Option<ProviderStatus>, next: ProviderStatus) {
        let mut counts = self.status_counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = previous {
            if let Some(count) = counts.get_mut(&previous) {
                *count = count.saturating_sub(1);
            }
        }
        *counts.entry(next).or_insert(0) += 1;
        let snapshot: Vec<(ProviderStatus, usize)> = counts.iter().map(|(s, c)| (*s, *c)).collect();
        drop(counts);
        self.metrics.set_providers(&snapshot);
    }

    /// Apply an already validated heartbeat.
    ///
    /// Heartbeats not newer than the last applied one change nothing.
    pub async fn apply_heartbeat(&self, heartbeat: &Heartbeat, received_at: DateTime<Utc>) -> ApplyOutcome {
        let provider_id = heartbeat.provider_id.as_str();
        let entry = self.entry(provider_id, received_at);
        let mut effects = Effects::default();

        let outcome = {
            let mut state = entry.lock().await;
            if let Some(last) = state.status.last_heartbeat {
                if heartbeat.timestamp == last {
                    return ApplyOutcome::Duplicate;
                }
                if heartbeat.timestamp < last {
                    return ApplyOutcome::Stale;
                }
            }

            let (transitions, warnings) = state.apply_resources(&heartbeat.resource_statuses);
            self.resource_effects(&mut state, &transitions, "reported by provider", received_at, &mut effects);

            let latency_ms = (received_at - heartbeat.timestamp).num_milliseconds().max(0) as f64;
            state.record_heartbeat(latency_ms);
            state.status.last_heartbeat = Some(heartbeat.timestamp);
            state.last_received_at = Some(received_at);
            state.status.next_expected_heartbeat = Some(received_at + self.heartbeat.interval());
            state.status.latest_metrics = Some(heartbeat.system_metrics.clone());
            state.status.agent_version = heartbeat.version.clone();
            state.rescore(&self.health);

            self.check_thresholds(&mut state, heartbeat, received_at, &mut effects);
            if self.auto_resolve {
                self.resolve(
                    provider_id,
                    IncidentType::HeartbeatMissed,
                    None,
                    "heartbeat received",
                    received_at,
                    &mut effects,
                );
            }

            let reason = match state.status.status {
                ProviderStatus::Unknown => Some("first heartbeat accepted".to_string()),
                ProviderStatus::Offline => Some("heartbeat received after going offline".to_string()),
                _ => None,
            };
            let next = self.reevaluate(&mut state, reason, received_at, &mut effects);

            effects.records.push(state.status.clone().into());
            debug!(
                provider_id = %provider_id,
                status = %next,
                score = state.status.health_score,
                "Heartbeat applied"
            );
            ApplyOutcome::Applied { status: next, warnings }
        };

        self.flush(effects).await;
        outcome
    }

    fn resource_effects(
        &self,
        state: &mut ProviderEntry,
        transitions: &ResourceTransitions,
        reason: &str,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) {
        let provider_id = state.status.provider_id.clone();
        for (resource_id, previous, current) in transitions {
            effects.events.push(AvailabilityEvent::resource(
                provider_id.as_str(),
                resource_id.as_str(),
                *previous,
                *current,
                reason,
                now,
            ));
            if *current == ResourceState::Error {
                let issues = state
                    .status
                    .resource(resource_id)
                    .map(|r| r.issues.join("; "))
                    .unwrap_or_default();
                let incident = NewIncident::new(
                    provider_id.as_str(),
                    IncidentType::ResourceFailure,
                    IncidentSeverity::High,
                    format!("Resource {} reported an error", resource_id),
                )
                .for_resource(resource_id.as_str())
                .with_description(if issues.is_empty() {
                    format!("{} entered error state", resource_id)
                } else {
                    issues
                });
                self.raise(state, incident, now, effects);
            }
        }
    }

    fn check_thresholds(
        &self,
        state: &mut ProviderEntry,
        heartbeat: &Heartbeat,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) {
        let limits = &self.health.thresholds;
        let metrics = &heartbeat.system_metrics;
        let provider_id = heartbeat.provider_id.as_str();

        let mut host_violated = false;
        for (name, value, limit) in [
            ("CPU", metrics.cpu_percent, limits.max_cpu_percent),
            ("Memory", metrics.memory_percent, limits.max_memory_percent),
        ] {
            if value > limit {
                host_violated = true;
                let incident = NewIncident::new(
                    provider_id,
                    IncidentType::ThresholdViolation,
                    IncidentSeverity::Medium,
                    format!("{} usage above limit", name),
                )
                .with_description(format!("{} usage {:.1}% exceeds {:.1}%", name, value, limit));
                self.raise(state, incident, now, effects);
            }
        }
        if !host_violated && self.auto_resolve {
            self.resolve(
                provider_id,
                IncidentType::ThresholdViolation,
                None,
                "usage back under limits",
                now,
                effects,
            );
        }

        for report in &heartbeat.resource_statuses {
            let temperature = report
                .metrics
                .get("temperature_c")
                .or_else(|| report.metrics.get("temperature"));
            if let Some(temperature) = temperature.copied() {
                if temperature > limits.max_gpu_temperature_c {
                    let incident = NewIncident::new(
                        provider_id,
                        IncidentType::ThresholdViolation,
                        IncidentSeverity::High,
                        format!("{} temperature above limit", report.resource_id),
                    )
                    .for_resource(report.resource_id.as_str())
                    .with_description(format!(
                        "{:.1}C exceeds {:.1}C",
                        temperature, limits.max_gpu_temperature_c
                    ));
                    self.raise(state, incident, now, effects);
                } else if self.auto_resolve {
                    self.resolve(
                        provider_id,
                        IncidentType::ThresholdViolation,
                        Some(report.resource_id.as_str()),
                        "temperature back under limit",
                        now,
                        effects,
                    );
                }
            }
        }
    }

    /// Re-derive the status from score and resources. A score-driven
    /// worsening raises a performance incident; a return to healthy resolves it.
    fn reevaluate(
        &self,
        state: &mut ProviderEntry,
        reason: Option<String>,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) -> ProviderStatus {
        let provider_id = state.status.provider_id.clone();
        let previous = state.status.status;
        let next = state.evaluate(&self.heartbeat, &self.health);

        if next == ProviderStatus::Healthy && self.auto_resolve {
            self.resolve(
                &provider_id,
                IncidentType::PerformanceDegradation,
                None,
                "provider healthy again",
                now,
                effects,
            );
        }
        if next == previous {
            return next;
        }

        let reason = reason.unwrap_or_else(|| format!("health score {:.1}", state.status.health_score));
        self.set_status(state, next, reason, now, effects);

        let degraded_by_score = state.status.health_score < self.health.degraded_threshold;
        let worse = matches!(
            (previous, next),
            (ProviderStatus::Healthy, ProviderStatus::Degraded | ProviderStatus::Unhealthy)
                | (ProviderStatus::Degraded, ProviderStatus::Unhealthy)
        );
        if worse && degraded_by_score {
            let severity = if next == ProviderStatus::Unhealthy {
                IncidentSeverity::High
            } else {
                IncidentSeverity::Medium
            };
            let incident = NewIncident::new(
                provider_id.as_str(),
                IncidentType::PerformanceDegradation,
                severity,
                format!("Provider {} is {}", provider_id, next),
            )
            .with_description(format!(
                "health score {:.1}, uptime {:.1}%, average latency {:.0}ms",
                state.status.health_score,
                state.status.summary.uptime_percentage,
                state.status.summary.average_latency_ms
            ));
            self.raise(state, incident, now, effects);
        }
        next
    }

    fn raise(&self, state: &mut ProviderEntry, incident: NewIncident, now: DateTime<Utc>, effects: &mut Effects) {
        let raised = self.incidents.raise(incident, now);
        state.push_incident(raised.incident.id);
        if let Some(promotion) = self.alerts.promote(&raised.incident, now) {
            if let Some(old) = promotion.superseded {
                effects.records.push(old.into());
            }
            effects.records.push(promotion.alert.into());
        }
        effects.records.push(raised.incident.into());
    }

    fn resolve(
        &self,
        provider_id: &str,
        incident_type: IncidentType,
        resource_id: Option<&str>,
        note: &str,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) {
        if let Some(incident) = self
            .incidents
            .resolve_active(provider_id, incident_type, resource_id, note, now)
        {
            effects.records.push(incident.into());
            for alert in self.alerts.reconcile(&self.incidents, now) {
                effects.records.push(alert.into());
            }
        }
    }

    fn set_status(
        &self,
        state: &mut ProviderEntry,
        next: ProviderStatus,
        reason: String,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) {
        let previous = state.status.status;
        state.status.status = next;
        state.status.status_changed_at = now;
        self.count_transition(Some(previous), next);
        info!(
            provider_id = %state.status.provider_id,
            from = %previous,
            to = %next,
            reason = %reason,
            "Provider status changed"
        );
        effects.events.push(AvailabilityEvent::provider(
            state.status.provider_id.as_str(),
            previous,
            next,
            reason,
            now,
        ));
    }

    async fn flush(&self, effects: Effects) {
        for event in effects.events {
            let _ = self.availability.send(event);
        }
        if let Some(persistence) = &self.persistence {
            for record in effects.records {
                persistence.submit(record);
            }
        }
    }

    /// Detect missed heartbeats as of `now`.
    ///
    /// A provider whose last heartbeat is `N` or more intervals old goes
    /// offline with a single `HeartbeatMissed` incident.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let entries: Vec<Arc<Mutex<ProviderEntry>>> =
            self.providers.iter().map(|e| e.value().clone()).collect();
        let interval_ms = self.heartbeat.interval().num_milliseconds().max(1);
        let threshold = self.heartbeat.missed_threshold;
        let mut report = SweepReport::default();

        for entry in entries {
            let mut effects = Effects::default();
            {
                let mut state = entry.lock().await;
                let Some(last) = state.last_received_at else {
                    continue;
                };
                report.checked += 1;

                let elapsed_ms = (now - last).num_milliseconds();
                if elapsed_ms <= 0 {
                    continue;
                }
                let missed = (elapsed_ms / interval_ms).min(u32::MAX as i64) as u32;
                let new = state.record_missed(missed);
                if new == 0 {
                    continue;
                }
                report.missed_slots += new as u64;
                state.rescore(&self.health);

                if missed >= threshold && state.status.status != ProviderStatus::Offline {
                    let provider_id = state.status.provider_id.clone();
                    let transitions = state.take_resources_offline(now);
                    self.resource_effects(&mut state, &transitions, "provider offline", now, &mut effects);
                    self.set_status(
                        &mut state,
                        ProviderStatus::Offline,
                        format!("{} consecutive heartbeats missed", missed),
                        now,
                        &mut effects,
                    );
                    let incident = NewIncident::new(
                        provider_id.as_str(),
                        IncidentType::HeartbeatMissed,
                        IncidentSeverity::Medium,
                        format!("Provider {} stopped sending heartbeats", provider_id),
                    )
                    .with_description(format!(
                        "no heartbeat since {} ({} expected heartbeats missed)",
                        last.to_rfc3339(),
                        missed
                    ));
                    self.raise(&mut state, incident, now, &mut effects);
                    warn!(provider_id = %provider_id, missed, "Provider offline");
                    report.newly_offline.push(provider_id);
                } else if state.status.status != ProviderStatus::Offline {
                    let reason = format!(
                        "health score {:.1} after {} missed heartbeats",
                        state.status.health_score, missed
                    );
                    self.reevaluate(&mut state, Some(reason), now, &mut effects);
                }

                effects.records.push(state.status.clone().into());
            }
            self.flush(effects).await;
        }

        if report.missed_slots > 0 {
            debug!(
                checked = report.checked,
                missed = report.missed_slots,
                offline = report.newly_offline.len(),
                "Heartbeat sweep complete"
            );
        }
        report
    }

    /// Periodic sweep on the configured interval until cancelled
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.heartbeat.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.heartbeat.sweep_interval_secs, "Heartbeat sweeper started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_at(self.clock.now()).await;
                }
            }
        }
        info!("Heartbeat sweeper stopped");
    }

    pub async fn provider_health(&self, provider_id: &str) -> Result<ProviderHealthStatus> {
        let entry = self
            .providers
            .get(provider_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| FleetError::UnknownProvider(provider_id.to_string()))?;
        let state = entry.lock().await;
        Ok(state.status.clone())
    }

    pub async fn providers(&self) -> Vec<ProviderHealthStatus> {
        let entries: Vec<Arc<Mutex<ProviderEntry>>> =
            self.providers.iter().map(|e| e.value().clone()).collect();
        let mut statuses = Vec::with_capacity(entries.len());
        for entry in entries {
            statuses.push(entry.lock().await.status.clone());
        }
        statuses.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        statuses
    }

    pub async fn system_overview(&self) -> SystemHealthOverview {
        let statuses = self.providers().await;
        let total_providers = statuses.len();

        let mut providers_by_status: BTreeMap<String, usize> = BTreeMap::new();
        let mut resources_by_state: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_resources = 0;
        let mut score_sum = 0.0;
        for status in &statuses {
            *providers_by_status
                .entry(status.status.as_str().to_string())
                .or_insert(0) += 1;
            score_sum += status.health_score;
            for resource in &status.resource_statuses {
                total_resources += 1;
                *resources_by_state
                    .entry(resource.state.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }

        let count = |s: ProviderStatus| providers_by_status.get(s.as_str()).copied().unwrap_or(0);
        let down = count(ProviderStatus::Offline) + count(ProviderStatus::Unhealthy);
        let degraded = count(ProviderStatus::Degraded);

        let open_incidents = self.incidents.active_count();
        let open_incidents_by_severity = self.incidents.active_by_severity();
        let critical_open = open_incidents_by_severity
            .get(IncidentSeverity::Critical.as_str())
            .copied()
            .unwrap_or(0);

        let overall_status = if down * 2 > total_providers || critical_open > 0 {
            OverallStatus::Critical
        } else if down > 0 || degraded > 0 || open_incidents > 0 {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        };

        SystemHealthOverview {
            overall_status,
            total_providers,
            providers_by_status,
            average_health_score: if total_providers == 0 {
                0.0
            } else {
                score_sum / total_providers as f64
            },
            total_resources,
            resources_by_state,
            open_incidents,
            open_incidents_by_severity,
            active_alerts: self.alerts.active_count(),
            generated_at: self.clock.now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::contracts::{IncidentStatus, ResourceStatus, SystemMetrics};
    use crate::incidents::IncidentFilter;
    use crate::telemetry::FleetMetricsRegistry;
    use chrono::Duration;

    fn aggregator(config: &FleetConfig, clock: &ManualClock) -> HealthAggregator {
        let metrics = FleetMetricsRegistry::new().unwrap().fleet();
        HealthAggregator::new(
            config,
            Arc::new(IncidentManager::new(metrics.clone())),
            Arc::new(AlertManager::new(config.alerts.clone(), metrics.clone())),
            Arc::new(clock.clone()),
            metrics,
        )
    }

    fn missed_incidents(agg: &HealthAggregator, provider: &str) -> Vec<crate::contracts::HealthIncident> {
        agg.incidents().list(&IncidentFilter {
            provider_id: Some(provider.to_string()),
            incident_type: Some(IncidentType::HeartbeatMissed),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_first_heartbeat_makes_provider_healthy() {
        let clock = ManualClock::new(Utc::now());
        let agg = aggregator(&FleetConfig::default(), &clock);
        let mut events = agg.subscribe_availability();

        let hb = Heartbeat::new("p1", clock.now())
            .with_resource(ResourceStatus::new("nvidia-GPU-1", ResourceState::Available));
        let outcome = agg.apply_heartbeat(&hb, clock.now()).await;

        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                status: ProviderStatus::Healthy,
                warnings: vec![]
            }
        );
        let health = agg.provider_health("p1").await.unwrap();
        assert_eq!(health.summary.consecutive_successful_heartbeats, 1);
        assert_eq!(health.health_score, 100.0);

        let first = events.recv().await.unwrap();
        assert!(matches!(
            first.change,
            crate::contracts::AvailabilityChange::Resource { current: ResourceState::Available, .. }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_and_stale_are_noops() {
        let clock = ManualClock::new(Utc::now());
        let agg = aggregator(&FleetConfig::default(), &clock);
        let t = clock.now();

        agg.apply_heartbeat(&Heartbeat::new("p1", t), t).await;
        assert_eq!(agg.apply_heartbeat(&Heartbeat::new("p1", t), t).await, ApplyOutcome::Duplicate);
        assert_eq!(
            agg.apply_heartbeat(&Heartbeat::new("p1", t - Duration::seconds(5)), t).await,
            ApplyOutcome::Stale
        );

        let health = agg.provider_health("p1").await.unwrap();
        assert_eq!(health.summary.consecutive_successful_heartbeats, 1);
        assert_eq!(health.last_heartbeat, Some(t));
    }

    #[tokio::test]
    async fn test_sweep_takes_provider_offline_once() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        let agg = aggregator(&FleetConfig::default(), &clock);
        let hb = Heartbeat::new("p1", start)
            .with_resource(ResourceStatus::new("gpu-0", ResourceState::Busy))
            .with_resource(ResourceStatus::new("gpu-1", ResourceState::Maintenance));
        agg.apply_heartbeat(&hb, start).await;

        let report = agg.sweep_at(start + Duration::seconds(179)).await;
        assert!(report.newly_offline.is_empty());
        assert_ne!(agg.provider_health("p1").await.unwrap().status, ProviderStatus::Offline);

        let report = agg.sweep_at(start + Duration::seconds(181)).await;
        assert_eq!(report.newly_offline, vec!["p1".to_string()]);
        agg.sweep_at(start + Duration::seconds(250)).await;
        agg.sweep_at(start + Duration::seconds(400)).await;

        let health = agg.provider_health("p1").await.unwrap();
        assert_eq!(health.status, ProviderStatus::Offline);
        assert_eq!(health.resource("gpu-0").unwrap().state, ResourceState::Offline);
        assert_eq!(health.resource("gpu-1").unwrap().state, ResourceState::Maintenance);

        let incidents = missed_incidents(&agg, "p1");
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].severity, IncidentSeverity::Medium);
        assert_eq!(incidents[0].status, IncidentStatus::Open);
    }

    #[tokio::test]
    async fn test_recovery_resolves_missed_incident() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        let agg = aggregator(&FleetConfig::default(), &clock);
        agg.apply_heartbeat(&Heartbeat::new("p1", start), start).await;
        agg.sweep_at(start + Duration::seconds(200)).await;

        let back = start + Duration::seconds(210);
        let outcome = agg.apply_heartbeat(&Heartbeat::new("p1", back), back).await;
        assert!(matches!(outcome, ApplyOutcome::Applied { status: ProviderStatus::Healthy, .. }));

        let incidents = missed_incidents(&agg, "p1");
        assert_eq!(incidents[0].status, IncidentStatus::Resolved);
        assert_eq!(agg.provider_health("p1").await.unwrap().summary.consecutive_failed_heartbeats, 0);
    }

    #[tokio::test]
    async fn test_thresholds_raise_incidents_and_alerts() {
        let clock = ManualClock::new(Utc::now());
        let agg = aggregator(&FleetConfig::default(), &clock);
        let hb = Heartbeat::new("p1", clock.now())
            .with_metrics(SystemMetrics {
                cpu_percent: 99.0,
                memory_percent: 40.0,
                ..Default::default()
            })
            .with_resource(ResourceStatus::new("gpu-0", ResourceState::Busy).with_metric("temperature_c", 93.0));
        agg.apply_heartbeat(&hb, clock.now()).await;

        let violations = agg.incidents().list(&IncidentFilter {
            incident_type: Some(IncidentType::ThresholdViolation),
            ..Default::default()
        });
        assert_eq!(violations.len(), 2);
        assert_eq!(agg.alerts().active_count(), 1);
        assert_eq!(agg.provider_health("p1").await.unwrap().recent_incidents.len(), 2);
    }

    #[tokio::test]
    async fn test_resource_errors_degrade_provider() {
        let clock = ManualClock::new(Utc::now());
        let agg = aggregator(&FleetConfig::default(), &clock);
        let t = clock.now();
        agg.apply_heartbeat(&Heartbeat::new("p1", t), t).await;

        let t2 = t + Duration::seconds(30);
        let hb = Heartbeat::new("p1", t2)
            .with_resource(ResourceStatus::new("gpu-0", ResourceState::Error).with_issue("XID 79"));
        let outcome = agg.apply_heartbeat(&hb, t2).await;
        assert!(matches!(outcome, ApplyOutcome::Applied { status: ProviderStatus::Degraded, .. }));

        let failures = agg.incidents().list(&IncidentFilter {
            incident_type: Some(IncidentType::ResourceFailure),
            ..Default::default()
        });
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].description, "XID 79");
    }

    #[tokio::test]
    async fn test_overview_rolls_up_fleet() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        let agg = aggregator(&FleetConfig::default(), &clock);
        for id in ["p1", "p2", "p3"] {
            agg.apply_heartbeat(
                &Heartbeat::new(id, start).with_resource(ResourceStatus::new("gpu-0", ResourceState::Available)),
                start,
            )
            .await;
        }
        let overview = agg.system_overview().await;
        assert_eq!(overview.overall_status, OverallStatus::Healthy);
        assert_eq!(overview.total_resources, 3);

        let later = start + Duration::seconds(200);
        for id in ["p1", "p2"] {
            agg.apply_heartbeat(&Heartbeat::new(id, later), later).await;
        }
        agg.sweep_at(later).await;
        let overview = agg.system_overview().await;
        assert_eq!(overview.overall_status, OverallStatus::Degraded);
        assert_eq!(overview.providers_by_status.get("offline"), Some(&1));
        assert_eq!(overview.open_incidents, 1);
    }

    #[tokio::test]
    async fn test_sweep_reevaluates_status_from_score() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        let agg = aggregator(&FleetConfig::default(), &clock);
        agg.apply_heartbeat(&Heartbeat::new("p1", start), start).await;
        let mut events = agg.subscribe_availability();

        agg.sweep_at(start + Duration::seconds(125)).await;

        let health = agg.provider_health("p1").await.unwrap();
        assert_eq!(health.summary.missed_heartbeats, 2);
        assert!(health.health_score < 70.0);
        assert_eq!(health.status, ProviderStatus::Degraded);

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event.change,
            crate::contracts::AvailabilityChange::Provider { current: ProviderStatus::Degraded, .. }
        ));
        let degraded = agg.incidents().list(&IncidentFilter {
            incident_type: Some(IncidentType::PerformanceDegradation),
            active_only: true,
            ..Default::default()
        });
        assert_eq!(degraded.len(), 1);

        // offline then back resets the status directly
        agg.sweep_at(start + Duration::seconds(200)).await;
        let back = start + Duration::seconds(210);
        agg.apply_heartbeat(&Heartbeat::new("p1", back), back).await;
        assert_eq!(agg.provider_health("p1").await.unwrap().status, ProviderStatus::Healthy);
        assert!(agg
            .incidents()
            .list(&IncidentFilter {
                incident_type: Some(IncidentType::PerformanceDegradation),
                active_only: true,
                ..Default::default()
            })
            .is_empty());
    }

    #[tokio::test]
    async fn test_threshold_incidents_resolve_when_back_under_limits() {
        let clock = ManualClock::new(Utc::now());
        let agg = aggregator(&FleetConfig::default(), &clock);
        let t = clock.now();
        let hot = Heartbeat::new("p1", t)
            .with_metrics(SystemMetrics {
                cpu_percent: 99.0,
                ..Default::default()
            })
            .with_resource(ResourceStatus::new("gpu-0", ResourceState::Busy).with_metric("temperature_c", 93.0));
        agg.apply_heartbeat(&hot, t).await;
        assert_eq!(agg.alerts().active_count(), 1);

        let t2 = t + Duration::seconds(60);
        let cool = Heartbeat::new("p1", t2)
            .with_metrics(SystemMetrics {
                cpu_percent: 20.0,
                ..Default::default()
            })
            .with_resource(ResourceStatus::new("gpu-0", ResourceState::Busy).with_metric("temperature_c", 60.0));
        agg.apply_heartbeat(&cool, t2).await;

        let violations = agg.incidents().list(&IncidentFilter {
            incident_type: Some(IncidentType::ThresholdViolation),
            ..Default::default()
        });
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().all(|i| i.status == IncidentStatus::Resolved));
        assert_eq!(agg.alerts().active_count(), 0);
    }
}
