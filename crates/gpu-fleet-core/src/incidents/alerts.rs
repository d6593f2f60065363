use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::manager::IncidentManager;
use crate::config::AlertConfig;
use crate::contracts::{AlertStatus, HealthIncident, IncidentSeverity, IncidentType, SystemAlert};
use crate::error::{FleetError, Result};
use crate::telemetry::FleetMetrics;

/// Provider name used for alerts about the aggregator itself
pub const AGGREGATOR_SOURCE: &str = "fleet-aggregator";

const ALERT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertFilter {
    pub provider_id: Option<String>,
    pub status: Option<AlertStatus>,
    pub min_severity: Option<IncidentSeverity>,
    pub open_only: bool,
}

impl AlertFilter {
    fn matches(&self, alert: &SystemAlert) -> bool {
        self.provider_id
            .as_ref()
            .map_or(true, |p| alert.affected_providers.contains(p))
            && self.status.map_or(true, |s| s == alert.status)
            && self.min_severity.map_or(true, |s| alert.severity >= s)
            && (!self.open_only || alert.status.is_open())
    }
}

type AlertKey = (String, IncidentType);

/// Alerts touched by one promotion
#[derive(Debug, Clone)]
pub struct Promotion {
    pub alert: SystemAlert,
    /// Open alert for the same key that fell outside the dedup window and
    /// was resolved in favour of `alert`
    pub superseded: Option<SystemAlert>,
}

#[derive(Debug, Default)]
struct AlertBook {
    by_id: HashMap<Uuid, SystemAlert>,
    /// Open alert per provider and type
    open: HashMap<AlertKey, Uuid>,
}

/// Promotes severe incidents into deduplicated alerts
pub struct AlertManager {
    config: AlertConfig,
    book: RwLock<AlertBook>,
    tx: broadcast::Sender<SystemAlert>,
    metrics: Arc<FleetMetrics>,
}

impl std::fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertManager")
            .field("config", &self.config)
            .field("alerts", &self.read().by_id.len())
            .finish()
    }
}

impl AlertManager {
    pub fn new(config: AlertConfig, metrics: Arc<FleetMetrics>) -> Self {
        let (tx, _) = broadcast::channel(ALERT_CHANNEL_SIZE);
        Self {
            config,
            book: RwLock::new(AlertBook::default()),
            tx,
            metrics,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, AlertBook> {
        self.book.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, AlertBook> {
        self.book.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Alert stream for the notification collaborator
    pub fn subscribe(&self) -> broadcast::Receiver<SystemAlert> {
        self.tx.subscribe()
    }

    /// Promote an incident if severe enough.
    ///
    /// Incidents for the same provider and type inside the dedup window
    /// update the existing open alert instead of creating another one. An
    /// open alert older than the window is resolved and its incidents move
    /// to the new alert.
    pub fn promote(&self, incident: &HealthIncident, now: DateTime<Utc>) -> Option<Promotion> {
        if incident.severity < self.config.promotion_severity {
            return None;
        }
        let resources: Vec<String> = incident.resource_id.iter().cloned().collect();
        Some(self.upsert(
            (incident.provider_id.clone(), incident.incident_type),
            incident.severity,
            &incident.title,
            &resources,
            Some(incident.id),
            now,
        ))
    }

    /// Raise a critical alert about the aggregator itself
    pub fn raise_internal(&self, title: &str, now: DateTime<Utc>) -> SystemAlert {
        error!(title = %title, "Aggregator alert raised");
        let promotion = self.upsert(
            (AGGREGATOR_SOURCE.to_string(), IncidentType::ConnectivityIssue),
            IncidentSeverity::Critical,
            title,
            &[],
            None,
            now,
        );
        promotion.alert
    }

    /// Resolve the open aggregator alert, if any
    pub fn clear_internal(&self, now: DateTime<Utc>) -> Option<SystemAlert> {
        let id = self
            .read()
            .open
            .get(&(AGGREGATOR_SOURCE.to_string(), IncidentType::ConnectivityIssue))
            .copied()?;
        self.resolve(id, now).ok()
    }

    fn upsert(
        &self,
        key: AlertKey,
        severity: IncidentSeverity,
        title: &str,
        resources: &[String],
        incident_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Promotion {
        let window = self.config.dedup_window();
        let mut book = self.write();
        let mut superseded = None;

        let reusable = book.open.get(&key).copied().filter(|id| {
            book.by_id
                .get(id)
                .map_or(false, |a| now - a.last_triggered_at <= window)
        });
        let alert = match reusable.and_then(|id| book.by_id.get_mut(&id)) {
            Some(alert) => {
                alert.last_triggered_at = now;
                alert.updated_at = now;
                if severity > alert.severity {
                    alert.severity = severity;
                    alert.title = title.to_string();
                }
                for resource in resources {
                    if !alert.affected_resources.contains(resource) {
                        alert.affected_resources.push(resource.clone());
                    }
                }
                if let Some(id) = incident_id {
                    if !alert.incident_ids.contains(&id) {
                        alert.incident_ids.push(id);
                    }
                }
                debug!(alert_id = %alert.id, incidents = alert.incident_ids.len(), "Alert updated");
                alert.clone()
            }
            None => {
                let mut affected_resources = Vec::new();
                let mut incident_ids = Vec::new();
                let expired = book.open.remove(&key).and_then(|id| book.by_id.get_mut(&id));
                if let Some(old) = expired {
                    old.status = AlertStatus::Resolved;
                    old.updated_at = now;
                    old.resolved_at = Some(now);
                    affected_resources = old.affected_resources.clone();
                    incident_ids = old.incident_ids.clone();
                    info!(alert_id = %old.id, "Alert superseded after dedup window");
                    superseded = Some(old.clone());
                }
                for resource in resources {
                    if !affected_resources.contains(resource) {
                        affected_resources.push(resource.clone());
                    }
                }
                if let Some(id) = incident_id {
                    if !incident_ids.contains(&id) {
                        incident_ids.push(id);
                    }
                }

                let alert = SystemAlert {
                    id: Uuid::new_v4(),
                    alert_type: key.1,
                    severity,
                    status: AlertStatus::Active,
                    title: title.to_string(),
                    affected_providers: vec![key.0.clone()],
                    affected_resources,
                    incident_ids,
                    triggered_at: now,
                    last_triggered_at: now,
                    updated_at: now,
                    resolved_at: None,
                };
                info!(
                    alert_id = %alert.id,
                    provider_id = %key.0,
                    severity = severity.as_str(),
                    "Alert triggered"
                );
                book.by_id.insert(alert.id, alert.clone());
                book.open.insert(key, alert.id);
                alert
            }
        };
        let open = book.by_id.values().filter(|a| a.status.is_open()).count();
        drop(book);

        self.metrics.set_active_alerts(open);
        if let Some(old) = &superseded {
            let _ = self.tx.send(old.clone());
        }
        let _ = self.tx.send(alert.clone());
        Promotion { alert, superseded }
    }

    pub fn acknowledge(&self, id: Uuid, now: DateTime<Utc>) -> Result<SystemAlert> {
        self.transition(id, AlertStatus::Acknowledged, now)
    }

    pub fn suppress(&self, id: Uuid, now: DateTime<Utc>) -> Result<SystemAlert> {
        self.transition(id, AlertStatus::Suppressed, now)
    }

    pub fn resolve(&self, id: Uuid, now: DateTime<Utc>) -> Result<SystemAlert> {
        self.transition(id, AlertStatus::Resolved, now)
    }

    fn transition(&self, id: Uuid, next: AlertStatus, now: DateTime<Utc>) -> Result<SystemAlert> {
        let mut book = self.write();
        let alert = book
            .by_id
            .get_mut(&id)
            .ok_or_else(|| FleetError::AlertNotFound(id.to_string()))?;

        let allowed = matches!(
            (alert.status, next),
            (AlertStatus::Active, AlertStatus::Acknowledged)
                | (AlertStatus::Active | AlertStatus::Acknowledged, AlertStatus::Suppressed)
                | (AlertStatus::Active | AlertStatus::Acknowledged | AlertStatus::Suppressed, AlertStatus::Resolved)
        );
        if !allowed {
            return Err(FleetError::invalid_transition(
                format!("alert {}", id),
                alert.status,
                next,
            ));
        }

        alert.status = next;
        alert.updated_at = now;
        if next == AlertStatus::Resolved {
            alert.resolved_at = Some(now);
        }
        let snapshot = alert.clone();
        if next == AlertStatus::Resolved {
            book.open.retain(|_, open_id| *open_id != id);
        }
        let open = book.by_id.values().filter(|a| a.status.is_open()).count();
        drop(book);

        info!(alert_id = %id, status = ?next, "Alert transitioned");
        self.metrics.set_active_alerts(open);
        let _ = self.tx.send(snapshot.clone());
        Ok(snapshot)
    }

    /// Resolve open alerts whose linked incidents are all resolved or closed
    pub fn reconcile(&self, incidents: &IncidentManager, now: DateTime<Utc>) -> Vec<SystemAlert> {
        let done: Vec<Uuid> = self
            .read()
            .by_id
            .values()
            .filter(|a| a.status.is_open() && !a.incident_ids.is_empty())
            .filter(|a| {
                a.incident_ids
                    .iter()
                    .all(|id| incidents.status_of(*id).map_or(true, |s| !s.is_active()))
            })
            .map(|a| a.id)
            .collect();

        done.into_iter()
            .filter_map(|id| self.resolve(id, now).ok())
            .collect()
    }

    /// Drop resolved alerts past the retention window
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.config.retention();
        let mut book = self.write();
        let before = book.by_id.len();
        book.by_id.retain(|_, alert| {
            alert.status.is_open() || alert.resolved_at.map_or(true, |at| at > cutoff)
        });
        let purged = before - book.by_id.len();
        if purged > 0 {
            debug!(purged, "Purged resolved alerts");
        }
        purged
    }

    pub fn get(&self, id: Uuid) -> Result<SystemAlert> {
        self.read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| FleetError::AlertNotFound(id.to_string()))
    }

    /// Matching alerts, most recently triggered first
    pub fn list(&self, filter: &AlertFilter) -> Vec<SystemAlert> {
        let mut alerts: Vec<SystemAlert> = self
            .read()
            .by_id
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.last_triggered_at.cmp(&a.last_triggered_at));
        alerts
    }

    pub fn active_count(&self) -> usize {
        self.read().by_id.values().filter(|a| a.status.is_open()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::IncidentStatus;
    use crate::incidents::NewIncident;
    use crate::telemetry::FleetMetricsRegistry;
    use chrono::Duration;

    fn setup() -> (AlertManager, IncidentManager) {
        let metrics = FleetMetricsRegistry::new().unwrap().fleet();
        (
            AlertManager::new(AlertConfig::default(), metrics.clone()),
            IncidentManager::new(metrics),
        )
    }

    fn hot(resource: &str, severity: IncidentSeverity) -> NewIncident {
        NewIncident::new("p1", IncidentType::ThresholdViolation, severity, "GPU temperature above limit")
            .for_resource(resource)
    }

    #[test]
    fn test_low_severity_not_promoted() {
        let (alerts, incidents) = setup();
        let incident = incidents.raise(hot("gpu-0", IncidentSeverity::Medium), Utc::now()).incident;
        assert!(alerts.promote(&incident, Utc::now()).is_none());
        assert_eq!(alerts.active_count(), 0);
    }

    #[test]
    fn test_dedup_by_provider_and_type_within_window() {
        let (alerts, incidents) = setup();
        let now = Utc::now();
        let a = incidents.raise(hot("gpu-0", IncidentSeverity::High), now).incident;
        let b = incidents.raise(hot("gpu-1", IncidentSeverity::Critical), now).incident;

        let first = alerts.promote(&a, now).unwrap().alert;
        let second = alerts.promote(&b, now + Duration::seconds(60)).unwrap().alert;

        assert_eq!(first.id, second.id);
        assert_eq!(second.incident_ids, vec![a.id, b.id]);
        assert_eq!(second.affected_resources, vec!["gpu-0", "gpu-1"]);
        assert_eq!(second.severity, IncidentSeverity::Critical);
        assert_eq!(alerts.active_count(), 1);
    }

    #[test]
    fn test_new_alert_outside_window() {
        let (alerts, incidents) = setup();
        let now = Utc::now();
        let a = incidents.raise(hot("gpu-0", IncidentSeverity::High), now).incident;
        let first = alerts.promote(&a, now).unwrap().alert;
        let later = alerts.promote(&a, now + Duration::seconds(301)).unwrap();
        assert_ne!(first.id, later.alert.id);

        let superseded = later.superseded.unwrap();
        assert_eq!(superseded.id, first.id);
        assert_eq!(superseded.status, AlertStatus::Resolved);
        assert_eq!(alerts.get(first.id).unwrap().status, AlertStatus::Resolved);
        assert_eq!(alerts.active_count(), 1);
    }

    #[test]
    fn test_superseded_alert_hands_incidents_to_successor() {
        let (alerts, incidents) = setup();
        let now = Utc::now();
        let a = incidents.raise(hot("gpu-0", IncidentSeverity::High), now).incident;
        let b = incidents.raise(hot("gpu-1", IncidentSeverity::High), now).incident;
        alerts.promote(&a, now).unwrap();

        let later = now + Duration::seconds(600);
        let successor = alerts.promote(&b, later).unwrap().alert;
        assert_eq!(successor.incident_ids, vec![a.id, b.id]);
        assert_eq!(successor.affected_resources, vec!["gpu-0", "gpu-1"]);

        for id in [a.id, b.id] {
            incidents.transition(id, IncidentStatus::Resolved, None, later).unwrap();
        }
        assert_eq!(alerts.reconcile(&incidents, later).len(), 1);
        assert_eq!(alerts.active_count(), 0);
    }

    #[test]
    fn test_reconcile_resolves_when_incidents_close() {
        let (alerts, incidents) = setup();
        let now = Utc::now();
        let incident = incidents.raise(hot("gpu-0", IncidentSeverity::High), now).incident;
        let alert = alerts.promote(&incident, now).unwrap().alert;

        assert!(alerts.reconcile(&incidents, now).is_empty());
        incidents
            .transition(incident.id, IncidentStatus::Resolved, None, now)
            .unwrap();
        let resolved = alerts.reconcile(&incidents, now);
        assert_eq!(resolved.len(), 1);
        assert_eq!(alerts.get(alert.id).unwrap().status, AlertStatus::Resolved);
    }

    #[test]
    fn test_resolved_alerts_retained_until_expiry() {
        let (alerts, _) = setup();
        let now = Utc::now();
        let alert = alerts.raise_internal("persistence failing", now);
        alerts.acknowledge(alert.id, now).unwrap();
        assert!(alerts.acknowledge(alert.id, now).is_err());
        alerts.resolve(alert.id, now).unwrap();

        assert_eq!(alerts.purge_expired(now + Duration::hours(1)), 0);
        assert!(alerts.get(alert.id).is_ok());
        assert_eq!(alerts.purge_expired(now + Duration::seconds(86_401)), 1);
        assert!(matches!(alerts.get(alert.id), Err(FleetError::AlertNotFound(_))));
    }

    #[tokio::test]
    async fn test_alert_stream() {
        let (alerts, _) = setup();
        let mut rx = alerts.subscribe();
        let alert = alerts.raise_internal("store down", Utc::now());
        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, alert.id);
        assert_eq!(received.severity, IncidentSeverity::Critical);
        assert!(alerts.clear_internal(Utc::now()).is_some());
    }
}
