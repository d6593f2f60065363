//! Provider heartbeats and per-resource status reports

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{FleetError, Result};

/// Status self-reported by the provider agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Online,
    Degraded,
    Maintenance,
    ShuttingDown,
}

/// Host-level metrics carried in a heartbeat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    #[serde(default)]
    pub disk_percent: f64,
    #[serde(default)]
    pub network_rx_bytes: u64,
    #[serde(default)]
    pub network_tx_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_average: Option<f64>,
    #[serde(default)]
    pub gpu_count: u32,
}

/// Periodic liveness and status report from a provider agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub provider_id: String,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub system_metrics: SystemMetrics,
    #[serde(default)]
    pub resource_statuses: Vec<ResourceStatus>,
    #[serde(default)]
    pub version: String,
    /// Agent-side send time
    pub timestamp: DateTime<Utc>,
}

impl Heartbeat {
    pub fn new(provider_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            provider_id: provider_id.into(),
            status: AgentStatus::Online,
            system_metrics: SystemMetrics::default(),
            resource_statuses: Vec::new(),
            version: String::new(),
            timestamp,
        }
    }

    pub fn with_resource(mut self, status: ResourceStatus) -> Self {
        self.resource_statuses.push(status);
        self
    }

    pub fn with_metrics(mut self, metrics: SystemMetrics) -> Self {
        self.system_metrics = metrics;
        self
    }

    /// Structural validation, independent of stored state
    pub fn validate(&self) -> Result<()> {
        if self.provider_id.trim().is_empty() {
            return Err(FleetError::invalid_input("provider_id must not be empty"));
        }
        let m = &self.system_metrics;
        for (name, value) in [
            ("cpu_percent", m.cpu_percent),
            ("memory_percent", m.memory_percent),
            ("disk_percent", m.disk_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(FleetError::invalid_input(format!(
                    "{} out of range: {}",
                    name, value
                )));
            }
        }
        for status in &self.resource_statuses {
            if status.resource_id.trim().is_empty() {
                return Err(FleetError::invalid_input("resource_id must not be empty"));
            }
            if !(0.0..=100.0).contains(&status.utilization) {
                return Err(FleetError::invalid_input(format!(
                    "utilization out of range for {}: {}",
                    status.resource_id, status.utilization
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    #[default]
    Gpu,
    Cpu,
    Memory,
    Storage,
    Network,
    Other,
}

/// Resource lifecycle state
///
/// ```text
/// Unknown -> Available <-> {Allocated, Busy} -> {Maintenance, Offline, Error}
/// Offline | Error -> Available only
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    #[default]
    Unknown,
    Available,
    Allocated,
    Busy,
    Error,
    Maintenance,
    Offline,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Unknown => "unknown",
            ResourceState::Available => "available",
            ResourceState::Allocated => "allocated",
            ResourceState::Busy => "busy",
            ResourceState::Error => "error",
            ResourceState::Maintenance => "maintenance",
            ResourceState::Offline => "offline",
        }
    }

    /// Whether a reported move from `self` to `next` is a legal edge
    pub fn can_transition_to(&self, next: ResourceState) -> bool {
        use ResourceState::*;

        if *self == next {
            return true;
        }
        match (self, next) {
            (_, Unknown) => false,
            (Unknown, _) => true,
            (Offline | Error, Available) => true,
            (Offline | Error, _) => false,
            (Available, _) => true,
            (Allocated | Busy, _) => true,
            (Maintenance, Available | Offline | Error) => true,
            (Maintenance, _) => false,
        }
    }

    /// Usable or intentionally parked
    pub fn is_healthy(&self) -> bool {
        matches!(
            self,
            ResourceState::Available
                | ResourceState::Allocated
                | ResourceState::Busy
                | ResourceState::Maintenance
        )
    }
}

/// Provider-reported status of one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub resource_id: String,
    #[serde(default)]
    pub resource_type: ResourceType,
    pub state: ResourceState,
    #[serde(default)]
    pub utilization: f64,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    #[serde(default)]
    pub issues: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

impl ResourceStatus {
    pub fn new(resource_id: impl Into<String>, state: ResourceState) -> Self {
        Self {
            resource_id: resource_id.into(),
            resource_type: ResourceType::Gpu,
            state,
            utilization: 0.0,
            metrics: HashMap::new(),
            issues: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn with_utilization(mut self, utilization: f64) -> Self {
        self.utilization = utilization;
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_issue(mut self, issue: impl Into<String>) -> Self {
        self.issues.push(issue.into());
        self
    }

    /// Counts against the provider's resource health
    pub fn has_problem(&self) -> bool {
        !self.state.is_healthy() || !self.issues.is_empty()
    }
}

/// Reply to a heartbeat submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub accepted: bool,
    pub next_heartbeat_interval_secs: u64,
    #[serde(default)]
    pub required_checks: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub received_at: DateTime<Utc>,
}
