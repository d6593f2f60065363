use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::contracts::{HealthIncident, IncidentNote, IncidentSeverity, IncidentStatus, IncidentType};
use crate::error::{FleetError, Result};
use crate::telemetry::FleetMetrics;

/// Request to record an incident
#[derive(Debug, Clone)]
pub struct NewIncident {
    pub provider_id: String,
    pub resource_id: Option<String>,
    pub incident_type: IncidentType,
    pub severity: IncidentSeverity,
    pub title: String,
    pub description: String,
}

impl NewIncident {
    pub fn new(
        provider_id: impl Into<String>,
        incident_type: IncidentType,
        severity: IncidentSeverity,
        title: impl Into<String>,
    ) -> Self {
        let title = title.into();
        Self {
            provider_id: provider_id.into(),
            resource_id: None,
            incident_type,
            severity,
            description: title.clone(),
            title,
        }
    }

    pub fn for_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Result of [`IncidentManager::raise`]
#[derive(Debug, Clone)]
pub struct RaisedIncident {
    pub incident: HealthIncident,
    /// False when an active incident absorbed this occurrence
    pub created: bool,
}

/// Query filter for [`IncidentManager::list`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentFilter {
    pub provider_id: Option<String>,
    pub resource_id: Option<String>,
    pub incident_type: Option<IncidentType>,
    pub status: Option<IncidentStatus>,
    pub min_severity: Option<IncidentSeverity>,
    pub active_only: bool,
    pub limit: Option<usize>,
}

impl IncidentFilter {
    fn matches(&self, incident: &HealthIncident) -> bool {
        self.provider_id.as_ref().map_or(true, |p| *p == incident.provider_id)
            && self
                .resource_id
                .as_ref()
                .map_or(true, |r| incident.resource_id.as_ref() == Some(r))
            && self.incident_type.map_or(true, |t| t == incident.incident_type)
            && self.status.map_or(true, |s| s == incident.status)
            && self.min_severity.map_or(true, |s| incident.severity >= s)
            && (!self.active_only || incident.status.is_active())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IncidentKey {
    provider_id: String,
    incident_type: IncidentType,
    resource_id: Option<String>,
}

impl IncidentKey {
    fn of(incident: &HealthIncident) -> Self {
        Self {
            provider_id: incident.provider_id.clone(),
            incident_type: incident.incident_type,
            resource_id: incident.resource_id.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct IncidentBook {
    by_id: HashMap<Uuid, HealthIncident>,
    active: HashMap<IncidentKey, Uuid>,
}

/// Owns every incident ever raised; closed incidents are retained
pub struct IncidentManager {
    book: RwLock<IncidentBook>,
    metrics: Arc<FleetMetrics>,
}

impl std::fmt::Debug for IncidentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncidentManager")
            .field("incidents", &self.read().by_id.len())
            .finish()
    }
}

impl IncidentManager {
    pub fn new(metrics: Arc<FleetMetrics>) -> Self {
        Self {
            book: RwLock::new(IncidentBook::default()),
            metrics,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, IncidentBook> {
        self.book.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, IncidentBook> {
        self.book.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an occurrence, folding it into a matching active incident if one exists
    pub fn raise(&self, new: NewIncident, now: DateTime<Utc>) -> RaisedIncident {
        let key = IncidentKey {
            provider_id: new.provider_id.clone(),
            incident_type: new.incident_type,
            resource_id: new.resource_id.clone(),
        };

        let mut book = self.write();
        if let Some(id) = book.active.get(&key).copied() {
            if let Some(existing) = book.by_id.get_mut(&id) {
                existing.occurrence_count += 1;
                existing.last_occurrence = now;
                existing.updated_at = now;
                if new.severity > existing.severity {
                    info!(
                        incident_id = %id,
                        from = existing.severity.as_str(),
                        to = new.severity.as_str(),
                        "Incident escalated"
                    );
                    existing.severity = new.severity;
                    existing.title = new.title;
                }
                existing.description = new.description;
                debug!(incident_id = %id, occurrences = existing.occurrence_count, "Incident recurred");
                return RaisedIncident {
                    incident: existing.clone(),
                    created: false,
                };
            }
        }

        let incident = HealthIncident {
            id: Uuid::new_v4(),
            provider_id: new.provider_id,
            resource_id: new.resource_id,
            incident_type: new.incident_type,
            severity: new.severity,
            status: IncidentStatus::Open,
            title: new.title,
            description: new.description,
            occurrence_count: 1,
            created_at: now,
            updated_at: now,
            last_occurrence: now,
            resolved_at: None,
            closed_at: None,
            notes: Vec::new(),
        };
        book.active.insert(key, incident.id);
        book.by_id.insert(incident.id, incident.clone());
        drop(book);

        self.metrics
            .record_incident(incident.incident_type.as_str(), incident.severity.as_str());
        info!(
            incident_id = %incident.id,
            provider_id = %incident.provider_id,
            incident_type = incident.incident_type.as_str(),
            severity = incident.severity.as_str(),
            "Incident opened"
        );
        RaisedIncident {
            incident,
            created: true,
        }
    }

    /// Move an incident along `Open -> Investigating -> Resolved -> Closed`
    pub fn transition(
        &self,
        id: Uuid,
        status: IncidentStatus,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<HealthIncident> {
        let mut book = self.write();
        let incident = book
            .by_id
            .get_mut(&id)
            .ok_or_else(|| FleetError::IncidentNotFound(id.to_string()))?;

        if !incident.status.can_transition_to(status) {
            return Err(FleetError::invalid_transition(
                format!("incident {}", id),
                incident.status,
                status,
            ));
        }

        incident.status = status;
        incident.updated_at = now;
        match status {
            IncidentStatus::Resolved => incident.resolved_at = Some(now),
            IncidentStatus::Closed => incident.closed_at = Some(now),
            _ => {}
        }
        if let Some(note) = note {
            incident.notes.push(IncidentNote { at: now, status, note });
        }

        let snapshot = incident.clone();
        if !status.is_active() {
            book.active.remove(&IncidentKey::of(&snapshot));
        }
        info!(incident_id = %id, status = ?status, "Incident transitioned");
        Ok(snapshot)
    }

    /// Resolve the active incident matching the key, if any
    pub fn resolve_active(
        &self,
        provider_id: &str,
        incident_type: IncidentType,
        resource_id: Option<&str>,
        note: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Option<HealthIncident> {
        let id = self.find_active(provider_id, incident_type, resource_id)?.id;
        self.transition(id, IncidentStatus::Resolved, Some(note.into()), now).ok()
    }

    pub fn find_active(
        &self,
        provider_id: &str,
        incident_type: IncidentType,
        resource_id: Option<&str>,
    ) -> Option<HealthIncident> {
        let key = IncidentKey {
            provider_id: provider_id.to_string(),
            incident_type,
            resource_id: resource_id.map(str::to_string),
        };
        let book = self.read();
        book.active.get(&key).and_then(|id| book.by_id.get(id)).cloned()
    }

    pub fn get(&self, id: Uuid) -> Result<HealthIncident> {
        self.read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| FleetError::IncidentNotFound(id.to_string()))
    }

    /// Status of an incident, if it exists
    pub fn status_of(&self, id: Uuid) -> Option<IncidentStatus> {
        self.read().by_id.get(&id).map(|i| i.status)
    }

    /// Matching incidents, newest first
    pub fn list(&self, filter: &IncidentFilter) -> Vec<HealthIncident> {
        let mut incidents: Vec<HealthIncident> = self
            .read()
            .by_id
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        incidents.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            incidents.truncate(limit);
        }
        incidents
    }

    pub fn active_count(&self) -> usize {
        self.read().active.len()
    }

    pub fn active_by_severity(&self) -> BTreeMap<String, usize> {
        let book = self.read();
        let mut counts = BTreeMap::new();
        for incident in book.active.values().filter_map(|id| book.by_id.get(id)) {
            *counts.entry(incident.severity.as_str().to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
