//! Events published to downstream consumers (scheduler, dashboards)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::health::ProviderStatus;
use super::heartbeat::ResourceState;
use super::resource::ResourceDescriptor;

/// Kind of inventory change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    PerformanceUpdate,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Added => "added",
            ChangeType::Removed => "removed",
            ChangeType::Modified => "modified",
            ChangeType::PerformanceUpdate => "performance_update",
        }
    }
}

/// Inventory change detected by a discovery poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_id: Uuid,
    pub change_type: ChangeType,
    /// Resource snapshot at detection time
    pub resource: ResourceDescriptor,
    pub timestamp: DateTime<Utc>,
    pub description: String,
}

impl ChangeEvent {
    pub fn new(change_type: ChangeType, resource: ResourceDescriptor, description: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            change_type,
            resource,
            timestamp: Utc::now(),
            description: description.into(),
        }
    }

    pub fn added(resource: ResourceDescriptor) -> Self {
        let description = format!("{} ({}) discovered", resource.name, resource.id);
        Self::new(ChangeType::Added, resource, description)
    }

    pub fn removed(resource: ResourceDescriptor, missed_cycles: u32) -> Self {
        let description = format!(
            "{} ({}) not seen for {} discovery cycles",
            resource.name, resource.id, missed_cycles
        );
        Self::new(ChangeType::Removed, resource, description)
    }
}

/// What changed availability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subject", rename_all = "snake_case")]
pub enum AvailabilityChange {
    Provider {
        previous: ProviderStatus,
        current: ProviderStatus,
    },
    Resource {
        resource_id: String,
        previous: ResourceState,
        current: ResourceState,
    },
}

/// Availability transition consumed by the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityEvent {
    pub event_id: Uuid,
    pub provider_id: String,
    pub change: AvailabilityChange,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl AvailabilityEvent {
    pub fn provider(
        provider_id: impl Into<String>,
        previous: ProviderStatus,
        current: ProviderStatus,
        reason: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            provider_id: provider_id.into(),
            change: AvailabilityChange::Provider { previous, current },
            reason: reason.into(),
            timestamp,
        }
    }

    pub fn resource(
        provider_id: impl Into<String>,
        resource_id: impl Into<String>,
        previous: ResourceState,
        current: ResourceState,
        reason: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            provider_id: provider_id.into(),
            change: AvailabilityChange::Resource {
                resource_id: resource_id.into(),
                previous,
                current,
            },
            reason: reason.into(),
            timestamp,
        }
    }
}
