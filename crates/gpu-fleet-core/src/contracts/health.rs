//! Provider health, incidents and alerts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::heartbeat::{ResourceStatus, SystemMetrics};

/// Aggregated provider status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl ProviderStatus {
    pub const ALL: [ProviderStatus; 5] = [
        ProviderStatus::Unknown,
        ProviderStatus::Healthy,
        ProviderStatus::Degraded,
        ProviderStatus::Unhealthy,
        ProviderStatus::Offline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Unknown => "unknown",
            ProviderStatus::Healthy => "healthy",
            ProviderStatus::Degraded => "degraded",
            ProviderStatus::Unhealthy => "unhealthy",
            ProviderStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rolling counters behind a provider's score
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    /// Share of expected heartbeats received over the rolling window
    pub uptime_percentage: f64,
    pub consecutive_successful_heartbeats: u64,
    pub consecutive_failed_heartbeats: u64,
    pub total_heartbeats: u64,
    pub missed_heartbeats: u64,
    pub average_latency_ms: f64,
    pub healthy_resources: usize,
    pub total_resources: usize,
}

/// The aggregator's view of one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealthStatus {
    pub provider_id: String,
    pub status: ProviderStatus,
    /// 0-100
    pub health_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_metrics: Option<SystemMetrics>,
    pub resource_statuses: Vec<ResourceStatus>,
    pub summary: HealthSummary,
    /// Most recent incidents, newest last
    pub recent_incidents: Vec<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_expected_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub agent_version: String,
    pub status_changed_at: DateTime<Utc>,
}

impl ProviderHealthStatus {
    pub fn new(provider_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            provider_id: provider_id.into(),
            status: ProviderStatus::Unknown,
            health_score: 0.0,
            latest_metrics: None,
            resource_statuses: Vec::new(),
            summary: HealthSummary::default(),
            recent_incidents: Vec::new(),
            last_heartbeat: None,
            next_expected_heartbeat: None,
            agent_version: String::new(),
            status_changed_at: now,
        }
    }

    pub fn resource(&self, resource_id: &str) -> Option<&ResourceStatus> {
        self.resource_statuses
            .iter()
            .find(|r| r.resource_id == resource_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
    HeartbeatMissed,
    ResourceFailure,
    PerformanceDegradation,
    ThresholdViolation,
    ConnectivityIssue,
    SecurityAlert,
}

impl IncidentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentType::HeartbeatMissed => "heartbeat_missed",
            IncidentType::ResourceFailure => "resource_failure",
            IncidentType::PerformanceDegradation => "performance_degradation",
            IncidentType::ThresholdViolation => "threshold_violation",
            IncidentType::ConnectivityIssue => "connectivity_issue",
            IncidentType::SecurityAlert => "security_alert",
        }
    }
}

/// Ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl IncidentSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentSeverity::Low => "low",
            IncidentSeverity::Medium => "medium",
            IncidentSeverity::High => "high",
            IncidentSeverity::Critical => "critical",
        }
    }
}

/// `Open -> Investigating -> Resolved -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Investigating,
    Resolved,
    Closed,
}

impl IncidentStatus {
    pub fn can_transition_to(&self, next: IncidentStatus) -> bool {
        use IncidentStatus::*;
        matches!(
            (self, next),
            (Open, Investigating) | (Open, Resolved) | (Investigating, Resolved) | (Resolved, Closed)
        )
    }

    /// Still needs attention
    pub fn is_active(&self) -> bool {
        matches!(self, IncidentStatus::Open | IncidentStatus::Investigating)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentNote {
    pub at: DateTime<Utc>,
    pub status: IncidentStatus,
    pub note: String,
}

/// A lifecycle-tracked health event; never deleted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthIncident {
    pub id: Uuid,
    pub provider_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub incident_type: IncidentType,
    pub severity: IncidentSeverity,
    pub status: IncidentStatus,
    pub title: String,
    pub description: String,
    pub occurrence_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Vec<IncidentNote>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Suppressed,
    Resolved,
}

impl AlertStatus {
    pub fn is_open(&self) -> bool {
        !matches!(self, AlertStatus::Resolved)
    }
}

/// Externally surfaced aggregation of one or more incidents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemAlert {
    pub id: Uuid,
    pub alert_type: IncidentType,
    pub severity: IncidentSeverity,
    pub status: AlertStatus,
    pub title: String,
    pub affected_providers: Vec<String>,
    pub affected_resources: Vec<String>,
    pub incident_ids: Vec<Uuid>,
    pub triggered_at: DateTime<Utc>,
    pub last_triggered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Critical,
}

/// Fleet-wide roll-up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealthOverview {
    pub overall_status: OverallStatus,
    pub total_providers: usize,
    pub providers_by_status: BTreeMap<String, usize>,
    pub average_health_score: f64,
    pub total_resources: usize,
    pub resources_by_state: BTreeMap<String, usize>,
    pub open_incidents: usize,
    pub open_incidents_by_severity: BTreeMap<String, usize>,
    pub active_alerts: usize,
    pub generated_at: DateTime<Utc>,
}
