//! Intel detector backed by `xpu-smi`

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{parse_reading, CommandRunner, ToolState, VendorDetector};
use crate::contracts::{Capabilities, DeviceStatus, DriverInfo, ResourceDescriptor, ResourceSpecs, Vendor};
use crate::error::{FleetError, Result};

const TOOL: &str = "xpu-smi";

#[derive(Debug, Deserialize)]
struct DeviceList {
    #[serde(default)]
    device_list: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct DeviceEntry {
    device_id: u32,
    #[serde(default)]
    device_name: String,
    #[serde(default)]
    uuid: String,
}

#[derive(Debug)]
pub struct IntelDetector {
    runner: Arc<dyn CommandRunner>,
    tool: ToolState,
    monitor_interval: Duration,
}

impl IntelDetector {
    pub fn new(runner: Arc<dyn CommandRunner>, monitor_interval: Duration) -> Self {
        Self {
            runner,
            tool: ToolState::default(),
            monitor_interval,
        }
    }

    async fn list_devices(&self, cancel: &CancellationToken) -> Result<Vec<DeviceEntry>> {
        let output = self.runner.run_checked(cancel, TOOL, &["discovery", "-j"]).await?;
        let list: DeviceList = serde_json::from_str(&output)?;
        Ok(list.device_list)
    }

    async fn describe(&self, cancel: &CancellationToken, entry: &DeviceEntry) -> Result<ResourceDescriptor> {
        if entry.uuid.trim().is_empty() {
            return Err(FleetError::parse(format!("device {} has no uuid", entry.device_id)));
        }
        let id = entry.device_id.to_string();
        let details: Value = serde_json::from_str(
            &self
                .runner
                .run_checked(cancel, TOOL, &["discovery", "-d", &id, "-j"])
                .await?,
        )?;
        let stats: Value = serde_json::from_str(
            &self
                .runner
                .run_checked(cancel, TOOL, &["stats", "-d", &id, "-j"])
                .await?,
        )?;
        build_descriptor(entry, &details, &stats)
    }
}

#[async_trait]
impl VendorDetector for IntelDetector {
    fn vendor(&self) -> Vendor {
        Vendor::Intel
    }

    async fn initialize(&self, cancel: &CancellationToken) -> Result<()> {
        if self.tool.is_initialized() && self.tool.is_available() {
            return Ok(());
        }
        if !self.runner.exists(TOOL).await {
            self.tool.mark(false);
            return Err(FleetError::unavailable(Vendor::Intel, "xpu-smi not found"));
        }
        match self.list_devices(cancel).await {
            Ok(devices) => {
                self.tool.mark(true);
                info!(vendor = "intel", devices = devices.len(), "Detector initialized");
                Ok(())
            }
            Err(FleetError::Cancelled) => Err(FleetError::Cancelled),
            Err(e) => {
                self.tool.mark(false);
                Err(FleetError::unavailable(Vendor::Intel, e.to_string()))
            }
        }
    }

    async fn cleanup(&self) -> Result<()> {
        self.tool.reset();
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.tool.is_available()
    }

    async fn discover_resources(&self, cancel: &CancellationToken) -> Result<Vec<ResourceDescriptor>> {
        self.tool.require(Vendor::Intel)?;

        let devices = self.list_devices(cancel).await?;
        let mut resources = Vec::with_capacity(devices.len());
        let mut failures = Vec::new();

        for entry in &devices {
            match self.describe(cancel, entry).await {
                Ok(resource) => resources.push(resource),
                Err(FleetError::Cancelled) => return Err(FleetError::Cancelled),
                Err(e) => failures.push(format!("device {}: {}", entry.device_id, e)),
            }
        }

        if failures.is_empty() {
            debug!(vendor = "intel", count = resources.len(), "Discovered GPUs");
            return Ok(resources);
        }
        if resources.is_empty() {
            return Err(FleetError::parse(format!(
                "xpu-smi listed {} devices but none could be read: {}",
                devices.len(),
                failures.join("; ")
            )));
        }
        warn!(vendor = "intel", parsed = resources.len(), expected = devices.len(), "Partial GPU enumeration");
        Err(FleetError::PartialDiscovery {
            vendor: Vendor::Intel,
            message: format!("read {} of {} devices", resources.len(), devices.len()),
            resources,
        })
    }

    async fn get_resource_info(&self, cancel: &CancellationToken, resource_id: &str) -> Result<ResourceDescriptor> {
        self.tool.require(Vendor::Intel)?;

        let entry = self
            .list_devices(cancel)
            .await?
            .into_iter()
            .find(|d| ResourceDescriptor::resource_id(Vendor::Intel, &d.uuid) == resource_id)
            .ok_or_else(|| FleetError::ResourceNotFound(resource_id.to_string()))?;
        self.describe(cancel, &entry).await
    }

    fn monitor_interval(&self) -> Duration {
        self.monitor_interval
    }
}

fn field<T: std::str::FromStr>(value: &Value, keys: &[&str]) -> Option<T> {
    keys.iter().find_map(|key| match value.get(*key)? {
        Value::String(s) => parse_reading(s),
        Value::Number(n) => parse_reading(&n.to_string()),
        _ => None,
    })
}

fn metric(stats: &Value, metrics_type: &str) -> Option<f64> {
    stats
        .get("device_level")?
        .as_array()?
        .iter()
        .find(|m| m.get("metrics_type").and_then(Value::as_str) == Some(metrics_type))
        .and_then(|m| field(m, &["value"]))
}

fn build_descriptor(entry: &DeviceEntry, details: &Value, stats: &Value) -> Result<ResourceDescriptor> {
    let memory_bytes: u64 = field(details, &["memory_physical_size_byte"])
        .ok_or_else(|| FleetError::parse(format!("device {} reports no memory size", entry.device_id)))?;
    let memory_total_mb = memory_bytes / (1024 * 1024);
    let memory_used_mb = metric(stats, "XPUM_STATS_MEMORY_USED").unwrap_or(0.0) as u64;

    let name = details
        .get("device_name")
        .and_then(Value::as_str)
        .unwrap_or(entry.device_name.as_str())
        .to_string();
    let family = family(&name);

    Ok(ResourceDescriptor::new(Vendor::Intel, entry.uuid.clone(), entry.device_id, name)
        .with_specs(ResourceSpecs {
            memory_total_mb,
            max_core_clock_mhz: field(details, &["max_frequency_mhz", "core_clock_rate_mhz"]),
            max_memory_clock_mhz: None,
            compute_units: field(details, &["number_of_xe_cores", "number_of_eus"]),
            architecture: family.to_string(),
            compute_capability: None,
            pcie_generation: field(details, &["pcie_generation"]),
        })
        .with_status(DeviceStatus {
            utilization_pct: metric(stats, "XPUM_STATS_GPU_UTILIZATION").unwrap_or(0.0),
            memory_used_mb,
            memory_free_mb: memory_total_mb.saturating_sub(memory_used_mb),
            temperature_c: metric(stats, "XPUM_STATS_GPU_CORE_TEMPERATURE"),
            power_draw_w: metric(stats, "XPUM_STATS_POWER"),
            processes: Vec::new(),
        })
        .with_capabilities(capabilities(family))
        .with_driver(DriverInfo {
            version: details
                .get("driver_version")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            runtime_version: details
                .get("kernel_version")
                .and_then(Value::as_str)
                .map(str::to_string),
        }))
}

fn family(name: &str) -> &'static str {
    if name.contains("Max") {
        "Xe-HPC"
    } else if name.contains("Flex") || name.contains("Arc") {
        "Xe-HPG"
    } else {
        "Xe"
    }
}

fn capabilities(family: &str) -> Capabilities {
    let mut precisions = vec!["fp32".to_string(), "fp16".to_string(), "bf16".to_string(), "int8".to_string()];
    if family == "Xe-HPC" {
        precisions.push("fp64".into());
        precisions.push("tf32".into());
    }
    Capabilities {
        apis: vec!["level_zero".into(), "sycl".into(), "opencl".into(), "vulkan".into()],
        precisions,
        virtualization: if family == "Xe" { Vec::new() } else { vec!["sr-iov".into()] },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::ScriptedCommandRunner;

    const LIST: &str = r#"{"device_list": [
        {"device_id": 0, "device_name": "Intel(R) Data Center GPU Max 1100", "uuid": "00000000-0000-0000-1111-0000000000bd"},
        {"device_id": 1, "device_name": "Intel(R) Data Center GPU Max 1100", "uuid": "00000000-0000-0000-2222-0000000000bd"}
    ]}"#;

    const DETAILS: &str = r#"{
        "device_id": 0,
        "device_name": "Intel(R) Data Center GPU Max 1100",
        "driver_version": "1.3.27642",
        "memory_physical_size_byte": "51539607552",
        "number_of_eus": "448",
        "max_frequency_mhz": 1550
    }"#;

    const STATS: &str = r#"{"device_id": 0, "device_level": [
        {"metrics_type": "XPUM_STATS_GPU_UTILIZATION", "value": 17},
        {"metrics_type": "XPUM_STATS_POWER", "value": 112.5},
        {"metrics_type": "XPUM_STATS_GPU_CORE_TEMPERATURE", "value": 48},
        {"metrics_type": "XPUM_STATS_MEMORY_USED", "value": 2048}
    ]}"#;

    fn runner() -> ScriptedCommandRunner {
        ScriptedCommandRunner::new()
            .installed(TOOL)
            .respond("xpu-smi discovery -j", LIST)
            .respond("xpu-smi discovery -d 0 -j", DETAILS)
            .respond("xpu-smi stats -d 0 -j", STATS)
    }

    #[tokio::test]
    async fn test_unreadable_device_is_partial() {
        let detector = IntelDetector::new(Arc::new(runner()), Duration::from_secs(15));
        let cancel = CancellationToken::new();
        detector.initialize(&cancel).await.unwrap();

        match detector.discover_resources(&cancel).await {
            Err(FleetError::PartialDiscovery { resources, .. }) => {
                let gpu = &resources[0];
                assert_eq!(gpu.id, "intel-00000000-0000-0000-1111-0000000000bd");
                assert_eq!(gpu.specs.memory_total_mb, 49152);
                assert_eq!(gpu.specs.compute_units, Some(448));
                assert_eq!(gpu.specs.max_core_clock_mhz, Some(1550));
                assert_eq!(gpu.specs.architecture, "Xe-HPC");
                assert_eq!(gpu.status.utilization_pct, 17.0);
                assert_eq!(gpu.status.memory_free_mb, 47104);
                assert_eq!(gpu.status.power_draw_w, Some(112.5));
            }
            other => panic!("expected partial discovery, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resource_info_reads_single_device() {
        let detector = IntelDetector::new(Arc::new(runner()), Duration::from_secs(15));
        let cancel = CancellationToken::new();
        detector.initialize(&cancel).await.unwrap();

        let gpu = detector
            .get_resource_info(&cancel, "intel-00000000-0000-0000-1111-0000000000bd")
            .await
            .unwrap();
        assert_eq!(gpu.status.temperature_c, Some(48.0));
        assert!(gpu.capabilities.supports_api("level_zero"));
    }

    #[tokio::test]
    async fn test_broken_listing_makes_detector_unavailable() {
        let runner = ScriptedCommandRunner::new()
            .installed(TOOL)
            .fail("xpu-smi discovery -j", "Level Zero initialization error");
        let detector = IntelDetector::new(Arc::new(runner), Duration::from_secs(15));
        let result = detector.initialize(&CancellationToken::new()).await;
        assert!(matches!(result, Err(FleetError::DetectorUnavailable { vendor: Vendor::Intel, .. })));
    }
}
