//! Accelerator resource descriptors
//!
//! One `ResourceDescriptor` per discrete device, identified within a
//! discovery session by `(vendor, uuid)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::events::ChangeType;

/// Hardware vendors with a detector implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vendor {
    Nvidia,
    Amd,
    Intel,
}

impl Vendor {
    pub const ALL: [Vendor; 3] = [Vendor::Nvidia, Vendor::Amd, Vendor::Intel];

    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::Nvidia => "nvidia",
            Vendor::Amd => "amd",
            Vendor::Intel => "intel",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vendor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "nvidia" => Ok(Vendor::Nvidia),
            "amd" | "rocm" => Ok(Vendor::Amd),
            "intel" | "xpu" => Ok(Vendor::Intel),
            other => Err(format!("unknown vendor: {}", other)),
        }
    }
}

/// Key used to merge discovery results across cycles
pub type ResourceKey = (Vendor, String);

/// A discovered accelerator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Session-unique identifier, derived from vendor and UUID
    pub id: String,

    pub vendor: Vendor,

    /// Vendor-reported stable device UUID
    pub uuid: String,

    /// Device index as enumerated by the vendor tool
    pub index: u32,

    /// Marketing name
    pub name: String,

    /// Static specifications
    pub specs: ResourceSpecs,

    /// Dynamic status at `last_seen`
    pub status: DeviceStatus,

    pub capabilities: Capabilities,

    pub driver: DriverInfo,

    /// Last successful poll; strictly increasing across polls
    pub last_seen: DateTime<Utc>,

    /// Name of the detector that produced this descriptor
    pub source: String,
}

impl ResourceDescriptor {
    /// Build the session identifier for a device
    pub fn resource_id(vendor: Vendor, uuid: &str) -> String {
        format!("{}-{}", vendor.as_str(), uuid)
    }

    /// Create a descriptor with empty status and capabilities
    pub fn new(vendor: Vendor, uuid: impl Into<String>, index: u32, name: impl Into<String>) -> Self {
        let uuid = uuid.into();
        Self {
            id: Self::resource_id(vendor, &uuid),
            vendor,
            uuid,
            index,
            name: name.into(),
            specs: ResourceSpecs::default(),
            status: DeviceStatus::default(),
            capabilities: Capabilities::default(),
            driver: DriverInfo::default(),
            last_seen: Utc::now(),
            source: vendor.as_str().to_string(),
        }
    }

    pub fn with_specs(mut self, specs: ResourceSpecs) -> Self {
        self.specs = specs;
        self
    }

    pub fn with_status(mut self, status: DeviceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_driver(mut self, driver: DriverInfo) -> Self {
        self.driver = driver;
        self
    }

    pub fn key(&self) -> ResourceKey {
        (self.vendor, self.uuid.clone())
    }

    /// Compare against a previously reported snapshot of the same device.
    ///
    /// Identity or specification changes win over performance drift.
    pub fn classify_change(
        &self,
        baseline: &ResourceDescriptor,
        thresholds: &ChangeThresholds,
    ) -> Option<ChangeType> {
        if self.name != baseline.name
            || self.index != baseline.index
            || self.specs != baseline.specs
            || self.capabilities != baseline.capabilities
            || self.driver != baseline.driver
        {
            return Some(ChangeType::Modified);
        }

        if self.status.differs_materially(&baseline.status, thresholds) {
            return Some(ChangeType::PerformanceUpdate);
        }

        None
    }
}

/// Static device specifications
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpecs {
    pub memory_total_mb: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_core_clock_mhz: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_memory_clock_mhz: Option<u32>,

    /// SMs, CUs or Xe cores depending on vendor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_units: Option<u32>,

    pub architecture: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_capability: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pcie_generation: Option<u32>,
}

/// Dynamic device status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Core utilization percentage (0-100)
    pub utilization_pct: f64,

    pub memory_used_mb: u64,

    pub memory_free_mb: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_draw_w: Option<f64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processes: Vec<GpuProcess>,
}

impl DeviceStatus {
    /// Whether the difference to `other` exceeds the noise thresholds
    pub fn differs_materially(&self, other: &DeviceStatus, thresholds: &ChangeThresholds) -> bool {
        if (self.utilization_pct - other.utilization_pct).abs() > thresholds.utilization_pct {
            return true;
        }
        if optional_delta(self.temperature_c, other.temperature_c) > thresholds.temperature_c {
            return true;
        }
        optional_delta(self.power_draw_w, other.power_draw_w) > thresholds.power_w
    }

    /// Memory utilization percentage, if total memory is known
    pub fn memory_used_pct(&self) -> Option<f64> {
        let total = self.memory_used_mb + self.memory_free_mb;
        if total == 0 {
            None
        } else {
            Some(self.memory_used_mb as f64 / total as f64 * 100.0)
        }
    }
}

// A reading that appears or disappears always counts as a change.
fn optional_delta(a: Option<f64>, b: Option<f64>) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) => (a - b).abs(),
        (None, None) => 0.0,
        _ => f64::INFINITY,
    }
}

/// A process holding device memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuProcess {
    pub pid: u32,
    pub name: String,
    pub memory_used_mb: u64,
}

/// What a device can run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Programming APIs, e.g. "cuda", "rocm", "opencl", "vulkan", "level_zero"
    #[serde(default)]
    pub apis: Vec<String>,

    /// Supported numeric precisions, e.g. "fp32", "bf16", "int8"
    #[serde(default)]
    pub precisions: Vec<String>,

    /// Partitioning/virtualization features, e.g. "mig", "sr-iov"
    #[serde(default)]
    pub virtualization: Vec<String>,
}

impl Capabilities {
    pub fn supports_api(&self, api: &str) -> bool {
        self.apis.iter().any(|a| a.eq_ignore_ascii_case(api))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub version: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
}

/// Noise thresholds below which a status difference is not a change
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChangeThresholds {
    pub utilization_pct: f64,
    pub temperature_c: f64,
    pub power_w: f64,
}

impl Default for ChangeThresholds {
    fn default() -> Self {
        Self {
            utilization_pct: 5.0,
            temperature_c: 5.0,
            power_w: 15.0,
        }
    }
}
