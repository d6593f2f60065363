//! NVIDIA detector backed by `nvidia-smi`

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{parse_reading, CommandRunner, ToolState, VendorDetector};
use crate::contracts::{
    Capabilities, DeviceStatus, DriverInfo, GpuProcess, ResourceDescriptor, ResourceSpecs, Vendor,
};
use crate::error::{FleetError, Result};

const TOOL: &str = "nvidia-smi";

const GPU_FIELDS: &str = "index,uuid,name,memory.total,memory.used,memory.free,utilization.gpu,\
temperature.gpu,power.draw,clocks.max.sm,clocks.max.mem,driver_version,compute_cap,pcie.link.gen.max";
const GPU_FIELD_COUNT: usize = 14;

const APP_FIELDS: &str = "gpu_uuid,pid,process_name,used_memory";

#[derive(Debug)]
pub struct NvidiaDetector {
    runner: Arc<dyn CommandRunner>,
    tool: ToolState,
    monitor_interval: Duration,
}

impl NvidiaDetector {
    pub fn new(runner: Arc<dyn CommandRunner>, monitor_interval: Duration) -> Self {
        Self {
            runner,
            tool: ToolState::default(),
            monitor_interval,
        }
    }

    async fn query_gpus(&self, cancel: &CancellationToken, target: Option<&str>) -> Result<String> {
        let query = format!("--query-gpu={}", GPU_FIELDS);
        let mut args = vec![query.as_str(), "--format=csv,noheader,nounits"];
        if let Some(uuid) = target {
            args.push("-i");
            args.push(uuid);
        }
        self.runner.run_checked(cancel, TOOL, &args).await
    }

    /// Processes per GPU UUID; best effort
    async fn query_processes(&self, cancel: &CancellationToken) -> HashMap<String, Vec<GpuProcess>> {
        let query = format!("--query-compute-apps={}", APP_FIELDS);
        match self
            .runner
            .run_checked(cancel, TOOL, &[query.as_str(), "--format=csv,noheader,nounits"])
            .await
        {
            Ok(output) => parse_processes(&output),
            Err(e) => {
                debug!(error = %e, "Compute app query failed");
                HashMap::new()
            }
        }
    }
}

#[async_trait]
impl VendorDetector for NvidiaDetector {
    fn vendor(&self) -> Vendor {
        Vendor::Nvidia
    }

    async fn initialize(&self, cancel: &CancellationToken) -> Result<()> {
        if self.tool.is_initialized() && self.tool.is_available() {
            return Ok(());
        }
        if !self.runner.exists(TOOL).await {
            self.tool.mark(false);
            return Err(FleetError::unavailable(Vendor::Nvidia, "nvidia-smi not found"));
        }
        match self.runner.run_checked(cancel, TOOL, &["-L"]).await {
            Ok(listing) => {
                self.tool.mark(true);
                info!(vendor = "nvidia", devices = count_listed(&listing), "Detector initialized");
                Ok(())
            }
            Err(FleetError::Cancelled) => Err(FleetError::Cancelled),
            Err(e) => {
                self.tool.mark(false);
                Err(FleetError::unavailable(Vendor::Nvidia, e.to_string()))
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
        self.tool.require(Vendor::Nvidia)?;

        let listed = match self.runner.run_checked(cancel, TOOL, &["-L"]).await {
            Ok(listing) => count_listed(&listing),
            Err(FleetError::Cancelled) => return Err(FleetError::Cancelled),
            Err(_) => 0,
        };
        let output = self.query_gpus(cancel, None).await?;
        let processes = self.query_processes(cancel).await;

        let (mut resources, failures) = parse_gpu_rows(&output);
        for resource in &mut resources {
            if let Some(procs) = processes.get(&resource.uuid) {
                resource.status.processes = procs.clone();
            }
        }

        let expected = listed.max(resources.len() + failures.len());
        if resources.len() == expected {
            debug!(vendor = "nvidia", count = resources.len(), "Discovered GPUs");
            return Ok(resources);
        }
        if resources.is_empty() {
            return Err(FleetError::parse(format!(
                "nvidia-smi listed {} GPUs but none could be parsed: {}",
                expected,
                failures.join("; ")
            )));
        }
        warn!(vendor = "nvidia", parsed = resources.len(), expected, "Partial GPU enumeration");
        Err(FleetError::PartialDiscovery {
            vendor: Vendor::Nvidia,
            message: format!("parsed {} of {} GPUs", resources.len(), expected),
            resources,
        })
    }

    async fn get_resource_info(&self, cancel: &CancellationToken, resource_id: &str) -> Result<ResourceDescriptor> {
        self.tool.require(Vendor::Nvidia)?;

        let uuid = resource_id
            .strip_prefix("nvidia-")
            .ok_or_else(|| FleetError::ResourceNotFound(resource_id.to_string()))?;
        let output = self
            .query_gpus(cancel, Some(uuid))
            .await
            .map_err(|e| match e {
                FleetError::CommandFailed { .. } => FleetError::ResourceNotFound(resource_id.to_string()),
                other => other,
            })?;

        let (resources, _) = parse_gpu_rows(&output);
        let mut resource = resources
            .into_iter()
            .find(|r| r.id == resource_id)
            .ok_or_else(|| FleetError::ResourceNotFound(resource_id.to_string()))?;

        if let Some(procs) = self.query_processes(cancel).await.remove(&resource.uuid) {
            resource.status.processes = procs;
        }
        Ok(resource)
    }

    fn monitor_interval(&self) -> Duration {
        self.monitor_interval
    }
}

fn count_listed(listing: &str) -> usize {
    listing.lines().filter(|l| l.trim_start().starts_with("GPU ")).count()
}

/// Parse `--query-gpu` CSV rows; returns descriptors and per-row failures
fn parse_gpu_rows(output: &str) -> (Vec<ResourceDescriptor>, Vec<String>) {
    let mut resources = Vec::new();
    let mut failures = Vec::new();

    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        match parse_gpu_row(line) {
            Ok(resource) => resources.push(resource),
            Err(e) => failures.push(e),
        }
    }
    (resources, failures)
}

fn parse_gpu_row(line: &str) -> std::result::Result<ResourceDescriptor, String> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != GPU_FIELD_COUNT {
        return Err(format!("expected {} fields, got {}", GPU_FIELD_COUNT, fields.len()));
    }

    let index: u32 = parse_reading(fields[0]).ok_or_else(|| format!("bad index `{}`", fields[0]))?;
    let uuid = fields[1];
    if !uuid.starts_with("GPU-") {
        return Err(format!("bad uuid `{}` for GPU {}", uuid, index));
    }
    let memory_total_mb: u64 =
        parse_reading(fields[3]).ok_or_else(|| format!("no memory total for GPU {}", index))?;
    let compute_capability: Option<String> = parse_reading(fields[12]);

    let specs = ResourceSpecs {
        memory_total_mb,
        max_core_clock_mhz: parse_reading(fields[9]),
        max_memory_clock_mhz: parse_reading(fields[10]),
        compute_units: None,
        architecture: compute_capability
            .as_deref()
            .map(architecture)
            .unwrap_or("unknown")
            .to_string(),
        pcie_generation: parse_reading(fields[13]),
        compute_capability: compute_capability.clone(),
    };

    let status = DeviceStatus {
        utilization_pct: parse_reading(fields[6]).unwrap_or(0.0),
        memory_used_mb: parse_reading(fields[4]).unwrap_or(0),
        memory_free_mb: parse_reading(fields[5]).unwrap_or(0),
        temperature_c: parse_reading(fields[7]),
        power_draw_w: parse_reading(fields[8]),
        processes: Vec::new(),
    };

    Ok(ResourceDescriptor::new(Vendor::Nvidia, uuid, index, fields[2])
        .with_specs(specs)
        .with_status(status)
        .with_capabilities(capabilities(compute_capability.as_deref()))
        .with_driver(DriverInfo {
            version: fields[11].to_string(),
            runtime_version: None,
        }))
}

fn parse_processes(output: &str) -> HashMap<String, Vec<GpuProcess>> {
    let mut by_gpu: HashMap<String, Vec<GpuProcess>> = HashMap::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            continue;
        }
        let Some(pid) = parse_reading::<u32>(fields[1]) else {
            continue;
        };
        by_gpu.entry(fields[0].to_string()).or_default().push(GpuProcess {
            pid,
            name: fields[2].to_string(),
            memory_used_mb: parse_reading(fields[3]).unwrap_or(0),
        });
    }
    by_gpu
}

fn parse_compute_capability(cc: &str) -> Option<(u32, u32)> {
    let (major, minor) = cc.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn architecture(cc: &str) -> &'static str {
    match parse_compute_capability(cc) {
        Some((6, _)) => "Pascal",
        Some((7, 5)) => "Turing",
        Some((7, _)) => "Volta",
        Some((8, 9)) => "Ada Lovelace",
        Some((8, _)) => "Ampere",
        Some((9, _)) => "Hopper",
        Some((10..=12, _)) => "Blackwell",
        _ => "unknown",
    }
}

fn capabilities(cc: Option<&str>) -> Capabilities {
    let version = cc.and_then(parse_compute_capability).unwrap_or((0, 0));
    let at_least = |major: u32, minor: u32| version >= (major, minor);

    let mut precisions = vec!["fp32".to_string(), "fp64".to_string()];
    if at_least(5, 3) {
        precisions.push("fp16".into());
    }
    if at_least(6, 1) {
        precisions.push("int8".into());
    }
    if at_least(8, 0) {
        precisions.push("bf16".into());
        precisions.push("tf32".into());
    }
    if at_least(8, 9) {
        precisions.push("fp8".into());
    }

    let mut virtualization = Vec::new();
    if version == (8, 0) || at_least(9, 0) {
        virtualization.push("mig".to_string());
    }

    Capabilities {
        apis: vec!["cuda".into(), "opencl".into(), "vulkan".into()],
        precisions,
        virtualization,
    }
}
